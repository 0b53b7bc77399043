use crate::config::IngestionConfig;
use crate::error::IngestError;
use chrono::{DateTime, Utc};
use lopdf::Document as PdfDocument;
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Decompressed size cap for `word/document.xml`.
const MAX_DOCX_XML_BYTES: u64 = 50 * 1024 * 1024;

/// One file as handed to the ingestion coordinator.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub async fn load(path: &Path) -> Result<Self, IngestError> {
        let metadata = tokio::fs::metadata(path).await?;
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let bytes = tokio::fs::read(path).await?;

        Ok(Self {
            path: path.to_path_buf(),
            last_modified,
            bytes,
        })
    }

    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn file_name(&self) -> Result<String, IngestError> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| IngestError::MissingFileName(self.path.display().to_string()))
    }

    pub fn extension(&self) -> String {
        extension_of(&self.path)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Identifier of the document stored for `path`; stable for as long as the
/// file keeps its path.
pub fn document_id_for(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Recursively lists supported files under `folder`, sorted, skipping the
/// known-names list itself.
pub fn discover_files(folder: &Path, config: &IngestionConfig) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_names_list = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name == config.known_names_file);
        if is_names_list {
            continue;
        }

        if config.accepts_extension(&extension_of(entry.path())) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Reads the text content of a file. Media formats have no text and yield an
/// empty string; their metadata alone drives extraction.
pub fn decode_text(file: &SourceFile) -> Result<String, IngestError> {
    let text = match file.extension().as_str() {
        "txt" | "md" => decode_utf8(&file.bytes, &file.path)?,
        "pdf" => extract_pdf_text(&file.bytes, &file.path)?,
        "docx" => extract_docx_text(&file.bytes, &file.path)?,
        _ => String::new(),
    };
    Ok(text.trim().to_string())
}

fn decode_utf8(bytes: &[u8], path: &Path) -> Result<String, IngestError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|error| {
        IngestError::Chunking(format!("{} is not valid UTF-8: {error}", path.display()))
    })
}

fn extract_pdf_text(bytes: &[u8], path: &Path) -> Result<String, IngestError> {
    let document = PdfDocument::load_mem(bytes).map_err(|error| {
        IngestError::Chunking(format!("unreadable pdf {}: {error}", path.display()))
    })?;

    let mut pages = Vec::new();
    for page_no in document.get_pages().keys() {
        let text = document.extract_text(&[*page_no]).map_err(|error| {
            IngestError::Chunking(format!(
                "unreadable page {page_no} in {}: {error}",
                path.display()
            ))
        })?;
        if !text.trim().is_empty() {
            pages.push(text);
        }
    }

    Ok(pages.join("\n"))
}

fn extract_docx_text(bytes: &[u8], path: &Path) -> Result<String, IngestError> {
    let malformed =
        |error: String| IngestError::Chunking(format!("unreadable docx {}: {error}", path.display()));

    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|error| malformed(error.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|error| malformed(error.to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_DOCX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|error| malformed(error.to_string()))?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err(malformed("word/document.xml exceeds size limit".to_string()));
    }

    paragraphs_from_document_xml(&xml).map_err(malformed)
}

/// Collects `w:t` runs, one line per `w:p` paragraph.
fn paragraphs_from_document_xml(xml: &[u8]) -> Result<String, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) if element.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(text)) if in_text => {
                let unescaped = text.unescape().map_err(|error| error.to_string())?;
                out.push_str(&unescaped);
            }
            Ok(Event::Eof) => break,
            Err(error) => return Err(error.to_string()),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Reads the optional one-name-per-line list of correct spellings.
pub async fn load_known_names(folder: &Path, file_name: &str) -> Result<Vec<String>, IngestError> {
    let path = folder.join(file_name);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(&path).await?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub async fn save_known_names(folder: &Path, file_name: &str, content: &str) -> Result<(), IngestError> {
    if !tokio::fs::metadata(folder).await?.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "{} is not a directory",
            folder.display()
        )));
    }
    tokio::fs::write(folder.join(file_name), content).await?;
    Ok(())
}
