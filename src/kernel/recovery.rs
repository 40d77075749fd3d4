//! Panic recovery for user callbacks.
//!
//! Jobs, sources, administrators and escalation handlers are user code. A
//! panic in any of them must not unwind through kernel locks: it is caught
//! here, logged, and turned into a [`Failure`] (or a fallback value) so the
//! escalation procedure can deal with it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::escalation::Failure;

/// Execute a callback with panic recovery.
///
/// A panic is captured, logged, and converted to a [`Failure`] of kind
/// `Panic`. Ordinary failures pass through untouched.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T, Failure>
where
    F: FnOnce() -> Result<T, Failure>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Failure::panic(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Execute a callback that has no failure channel, using `fallback` if it
/// panics.
pub fn recover_or<F, T>(operation: F, operation_name: &str, fallback: T) -> T
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(value) => value,
        Err(panic_payload) => {
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                extract_panic_message(&panic_payload)
            );
            fallback
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::escalation::FailureKind;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "test_operation");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_preserves_failure() {
        let result: Result<(), Failure> =
            with_recovery(|| Err(Failure::new("db.locked", "table locked")), "test_operation");
        let failure = result.unwrap_err();
        assert_eq!(failure.kind(), &FailureKind::Job("db.locked".to_string()));
        assert_eq!(failure.message(), "table locked");
    }

    #[test]
    fn test_with_recovery_panic_str() {
        let result: Result<(), Failure> = with_recovery(
            || {
                panic!("test panic");
            },
            "test_operation",
        );

        let failure = result.unwrap_err();
        assert_eq!(failure.kind(), &FailureKind::Panic);
        assert!(failure.message().contains("panic in test_operation"));
        assert!(failure.message().contains("test panic"));
    }

    #[test]
    fn test_with_recovery_panic_string() {
        let result: Result<(), Failure> = with_recovery(
            || {
                panic!("{}", "dynamic panic message");
            },
            "test_operation",
        );

        assert!(result.unwrap_err().message().contains("dynamic panic message"));
    }

    #[test]
    fn test_recover_or_uses_fallback() {
        assert_eq!(recover_or(|| 7, "ok", 0), 7);
        assert_eq!(recover_or(|| -> i32 { panic!("nope") }, "boom", 0), 0);
    }

    #[test]
    fn test_extract_panic_message_str() {
        let panic_result = std::panic::catch_unwind(|| {
            panic!("test message");
        });

        match panic_result {
            Err(payload) => assert_eq!(extract_panic_message(&payload), "test message"),
            Ok(_) => panic!("Expected panic"),
        }
    }
}
