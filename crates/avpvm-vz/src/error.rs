//! Error types for the Virtualization.framework adapter.

use avpvm_core::RuntimeError;
use thiserror::Error;

/// Result type alias for adapter operations.
pub type VzResult<T> = std::result::Result<T, VzError>;

/// Errors raised while marshalling a configuration onto the framework.
#[derive(Debug, Error)]
pub enum VzError {
    /// An Objective-C class is missing from the loaded frameworks.
    #[error("class {0} not found")]
    ClassNotFound(&'static str),

    /// A private selector is missing on this macOS release.
    #[error("selector {0} not available on this system")]
    SelectorUnavailable(&'static str),

    /// A file the configuration refers to does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The framework refused the configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The machine is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An object could not be created.
    #[error("failed to create {0}")]
    Creation(&'static str),

    /// The framework reported an `NSError`.
    #[error("{message} (code={code})")]
    Internal {
        /// `NSError` code.
        code: i64,
        /// Localized description.
        message: String,
    },
}

impl From<VzError> for RuntimeError {
    fn from(err: VzError) -> Self {
        match err {
            VzError::Internal { code, message } => Self::new(code, message),
            other => Self::message(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nserror_keeps_code() {
        let runtime: RuntimeError = VzError::Internal {
            code: 2,
            message: "Invalid virtual machine configuration.".into(),
        }
        .into();
        assert_eq!(runtime.code, 2);
        assert_eq!(runtime.message, "Invalid virtual machine configuration.");
    }

    #[test]
    fn test_adapter_error_has_no_code() {
        let runtime: RuntimeError = VzError::ClassNotFound("_VZPL011SerialPortConfiguration").into();
        assert_eq!(runtime.code, -1);
        assert!(runtime.message.contains("_VZPL011SerialPortConfiguration"));
    }
}
