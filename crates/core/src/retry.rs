use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Runs `operation` under `timeout`, retrying at most `retries` extra times
/// while `is_transient` holds for the failure.
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    retries: u32,
    timeout: Duration,
    mut operation: F,
    on_timeout: impl Fn(Duration) -> E,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retries && is_transient(&error) => {
                attempt += 1;
                warn!(operation = label, attempt, error = %error, "retrying after transient failure");
            }
            Err(error) => return Err(error),
        }
    }
}

/// Store read under `timeout` with every failure treated as transient.
pub async fn read_store_with_retry<T, F, Fut>(
    label: &'static str,
    retries: u32,
    timeout: Duration,
    operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    with_retry(
        label,
        retries,
        timeout,
        operation,
        |timeout| StoreError::query("store", format!("{label} timed out after {timeout:?}")),
        |_| true,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::{read_store_with_retry, with_retry};
    use crate::error::StoreError;
    use crate::error::ModelError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            "test",
            1,
            Duration::from_secs(1),
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(ModelError::Unavailable("refused".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            },
            ModelError::Timeout,
            ModelError::is_transient,
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ModelError> = with_retry(
            "test",
            1,
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ModelError::Unavailable("refused".to_string())) }
            },
            ModelError::Timeout,
            ModelError::is_transient,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ModelError> = with_retry(
            "test",
            3,
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ModelError::Malformed("bad".to_string())) }
            },
            ModelError::Timeout,
            ModelError::is_transient,
        )
        .await;

        assert_eq!(result, Err(ModelError::Malformed("bad".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_operation_times_out() {
        let result: Result<(), ModelError> = with_retry(
            "test",
            0,
            Duration::from_millis(10),
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            ModelError::Timeout,
            ModelError::is_transient,
        )
        .await;

        assert_eq!(result, Err(ModelError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn store_read_retries_any_failure_once() {
        let calls = AtomicU32::new(0);
        let result = read_store_with_retry("lookup", 1, Duration::from_secs(1), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(StoreError::query("memory", "connection reset"))
                } else {
                    Ok(3)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stalled_store_read_becomes_query_error() {
        let result: Result<(), StoreError> =
            read_store_with_retry("lookup", 0, Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Query { .. })));
    }
}
