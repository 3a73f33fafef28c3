use std::future::Future;
use std::time::Duration;

use crate::error::BackendError;

/// Run one unit of remote I/O, swallowing connection-level failures.
///
/// Network errors are logged and followed by a short `backoff` sleep, after
/// which `Ok(None)` is returned so the caller can retry on its next pass.
/// Well-formed API errors and exhausted retries are returned unchanged.
pub async fn ignore_connection_errors<T, Fut>(
    context: &str,
    backoff: Duration,
    request: Fut,
) -> Result<Option<T>, BackendError>
where
    Fut: Future<Output = Result<T, BackendError>>,
{
    match request.await {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_connection() => {
            tracing::warn!(
                context,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "ignoring connection error"
            );
            tokio::time::sleep(backoff).await;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_through_success() {
        let value = ignore_connection_errors("ok", Duration::ZERO, async {
            Ok::<_, BackendError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn test_swallows_connection_errors() {
        let value = ignore_connection_errors("flaky", Duration::from_millis(1), async {
            Err::<u8, _>(BackendError::connection("connection reset"))
        })
        .await
        .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_keeps_api_errors() {
        let err = ignore_connection_errors("api", Duration::ZERO, async {
            Err::<u8, _>(BackendError::api(400, "BadRequest", "nope"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), Some(400));
    }
}
