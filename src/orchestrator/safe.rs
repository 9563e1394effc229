//! `safe_execute`: every provider-facing call the orchestrator makes
//! goes through here so that failures are logged with the same two tags
//! (operation name, range id) no matter where they originate, following
//! the "unknown exceptions re-wrapped, never escape unclassified" rule.

use std::future::Future;

use crate::error::RangeError;

/// Awaits `fut`, logging and re-raising any error tagged with `operation`
/// and `range_id`. The error type itself is left untouched so callers can
/// still match on specific `RangeError` variants (e.g. `RangeNotFound`).
pub async fn safe_execute<T, Fut>(operation: &str, range_id: &str, fut: Fut) -> Result<T, RangeError>
where
    Fut: Future<Output = Result<T, RangeError>>,
{
    match fut.await {
        Ok(value) => Ok(value),
        Err(error) => {
            tracing::error!(operation, range_id, error = %error, "operation failed");
            Err(error)
        }
    }
}

/// Variant for best-effort cleanup steps: logs the failure but returns the
/// caller-supplied default instead of propagating, so one stuck resource
/// doesn't stop the rest of a teardown from being attempted.
pub async fn safe_execute_or<T, Fut>(operation: &str, range_id: &str, default: T, fut: Fut) -> T
where
    Fut: Future<Output = Result<T, RangeError>>,
{
    match fut.await {
        Ok(value) => value,
        Err(error) => {
            tracing::error!(operation, range_id, error = %error, "operation failed, continuing with default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn safe_execute_passes_through_ok() {
        let result = safe_execute("noop", "101", async { Ok::<_, RangeError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn safe_execute_passes_through_err() {
        let result: Result<i32, RangeError> = safe_execute(
            "noop",
            "101",
            async { Err(RangeError::Validation { message: "boom".into() }) },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn safe_execute_or_swallows_error_into_default() {
        let result = safe_execute_or(
            "cleanup",
            "101",
            false,
            async { Err::<bool, _>(RangeError::Validation { message: "boom".into() }) },
        )
        .await;
        assert!(!result);
    }
}
