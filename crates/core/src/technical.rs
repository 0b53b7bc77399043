use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Source of tool-derived technical metadata (EXIF-style fields). Failure is
/// never an error: an unavailable tool yields an empty mapping.
#[async_trait]
pub trait TechnicalMetadataSource: Send + Sync {
    async fn extract(&self, path: &Path) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTechnicalMetadata;

#[async_trait]
impl TechnicalMetadataSource for NoTechnicalMetadata {
    async fn extract(&self, _path: &Path) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Runs `exiftool -j -G <path>` and flattens the first JSON object.
#[derive(Debug, Clone)]
pub struct ExifTool {
    program: String,
    timeout: Duration,
}

impl ExifTool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "exiftool".to_string(),
            timeout,
        }
    }

    pub fn is_installed(&self) -> bool {
        which::which(&self.program).is_ok()
    }
}

#[async_trait]
impl TechnicalMetadataSource for ExifTool {
    async fn extract(&self, path: &Path) -> BTreeMap<String, String> {
        let run = Command::new(&self.program)
            .arg("-j")
            .arg("-G")
            .arg(path)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                warn!(path = %path.display(), status = %output.status, "exiftool exited with failure");
                return BTreeMap::new();
            }
            Ok(Err(error)) => {
                debug!(path = %path.display(), error = %error, "exiftool not runnable");
                return BTreeMap::new();
            }
            Err(_) => {
                warn!(path = %path.display(), timeout = ?self.timeout, "exiftool timed out");
                return BTreeMap::new();
            }
        };

        parse_exiftool_output(&output.stdout).unwrap_or_else(|| {
            warn!(path = %path.display(), "exiftool output was not a JSON array");
            BTreeMap::new()
        })
    }
}

/// ExifTool prints a one-element array of grouped tags. Values are
/// stringified; `SourceFile` repeats the path and is dropped.
fn parse_exiftool_output(stdout: &[u8]) -> Option<BTreeMap<String, String>> {
    let parsed: Value = serde_json::from_slice(stdout).ok()?;
    let object = parsed.as_array()?.first()?.as_object()?;

    Some(
        object
            .iter()
            .filter(|(key, _)| key.as_str() != "SourceFile")
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exiftool_json_is_flattened() {
        let stdout = br#"[{"SourceFile": "/tmp/a.jpg", "File:FileType": "JPEG",
            "EXIF:ImageWidth": 640, "EXIF:Keywords": ["a", "b"]}]"#;
        let parsed = parse_exiftool_output(stdout).unwrap();

        assert_eq!(parsed.get("File:FileType").map(String::as_str), Some("JPEG"));
        assert_eq!(parsed.get("EXIF:ImageWidth").map(String::as_str), Some("640"));
        assert_eq!(parsed.get("EXIF:Keywords").map(String::as_str), Some("[\"a\",\"b\"]"));
        assert!(!parsed.contains_key("SourceFile"));
    }

    #[test]
    fn garbage_output_is_rejected() {
        assert!(parse_exiftool_output(b"Error: file not found").is_none());
        assert!(parse_exiftool_output(b"[]").is_none());
    }

    #[tokio::test]
    async fn missing_tool_yields_empty_mapping() {
        let tool = ExifTool {
            program: "definitely-not-an-installed-exiftool".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(!tool.is_installed());
        assert!(tool.extract(Path::new("/tmp/none.jpg")).await.is_empty());
    }
}
