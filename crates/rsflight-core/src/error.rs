//! Error types surfaced by coalesced calls.

use std::any::Any;

use thiserror::Error;

/// Placeholder used when a panic payload is neither `&str` nor `String`.
const OPAQUE_PAYLOAD: &str = "Box<dyn Any>";

/// A panic raised by coalesced work, captured so it can be re-raised in
/// every caller that was waiting on the same call.
///
/// Callers observe this as the payload of their own panic:
///
/// ```ignore
/// let err = handle.await.unwrap_err().into_panic();
/// let panic = err.downcast_ref::<PanicError>().unwrap();
/// assert_eq!(panic.message(), "boom");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("coalesced call panicked: {message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    /// Creates a panic error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Builds a panic error from a payload caught by `catch_unwind`.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Self::new(*message),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<&'static str>() {
            Ok(message) => return Self::new(*message),
            Err(payload) => payload,
        };
        // A re-raised panic from another coalesced call keeps its message.
        match payload.downcast::<PanicError>() {
            Ok(inner) => *inner,
            Err(_) => Self::new(OPAQUE_PAYLOAD),
        }
    }

    /// The message carried by the original panic.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-raises this panic in the current task.
    ///
    /// Each caller raises its own copy, so no payload is shared between
    /// unwinding threads.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_payload_from_str_literal() {
        let payload = catch_unwind(|| panic!("static message")).unwrap_err();
        let err = PanicError::from_payload(payload);
        assert_eq!(err.message(), "static message");
    }

    #[test]
    fn test_payload_from_formatted_string() {
        let code = 42;
        let payload = catch_unwind(|| panic!("failed with code {code}")).unwrap_err();
        let err = PanicError::from_payload(payload);
        assert_eq!(err.message(), "failed with code 42");
    }

    #[test]
    fn test_payload_of_unknown_type_is_opaque() {
        let payload =
            catch_unwind(|| std::panic::resume_unwind(Box::new(7_u32))).unwrap_err();
        let err = PanicError::from_payload(payload);
        assert_eq!(err.message(), OPAQUE_PAYLOAD);
    }

    #[test]
    fn test_resume_round_trips_through_catch_unwind() {
        let original = PanicError::new("nested");
        let payload = catch_unwind(AssertUnwindSafe(|| original.clone().resume())).unwrap_err();

        assert_eq!(payload.downcast_ref::<PanicError>(), Some(&original));
        assert_eq!(PanicError::from_payload(payload), original);
    }

    #[test]
    fn test_display_includes_message() {
        let err = PanicError::new("index out of bounds");
        assert_eq!(
            err.to_string(),
            "coalesced call panicked: index out of bounds"
        );
    }
}
