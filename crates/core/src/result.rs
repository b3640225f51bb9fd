//! Result type definition and extension traits.
//!
//! Provides combinators for Result types so callers can log and recover
//! without unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type for keel-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for any displayable error.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Operation failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged(), Some(42));
    }

    #[test]
    fn test_result_into_option_err() {
        let result: Result<i32> = Err(Error::invalid_record("test"));
        assert_eq!(result.into_option_logged(), None);
    }
}
