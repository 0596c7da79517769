//! Deadline wrapper for backend and network operations

use crate::error::{Result, VpnError};
use std::future::Future;
use std::time::Duration;

/// Run `fut` with a deadline.
///
/// On expiry the future is dropped and `Timeout { operation, duration }` is
/// returned. Any error from `fut` itself passes through unchanged.
pub async fn with_timeout<T, F>(operation: &str, duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("⏱️ {} timed out after {}ms", operation, duration.as_millis());
            Err(VpnError::Timeout {
                operation: operation.to_string(),
                duration,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorCode;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let value = with_timeout("quick", Duration::from_secs(1), async { Ok(7) })
            .await
            .expect("value");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = with_timeout::<(), _>("failing", Duration::from_secs(1), async {
            Err(VpnError::Backend(BackendErrorCode::ServerUnreachable))
        })
        .await
        .unwrap_err();
        assert_eq!(err.backend_code(), Some(BackendErrorCode::ServerUnreachable));
    }

    #[tokio::test]
    async fn test_expiry_names_operation() {
        let err = with_timeout::<(), _>("connect", Duration::from_millis(20), async {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .await
        .unwrap_err();

        match err {
            VpnError::Timeout { operation, duration } => {
                assert_eq!(operation, "connect");
                assert_eq!(duration, Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {other}"),
        }
    }
}
