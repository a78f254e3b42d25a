//! Error types for the lifecycle core.

use std::fmt;

use thiserror::Error;

use crate::controller::VmState;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors surfaced to the caller of the lifecycle controller.
#[derive(Debug, Error)]
pub enum VmError {
    /// A configuration field failed validation.
    ///
    /// Recoverable: fix the field and call `configure` again.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfiguration {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable diagnostic.
        reason: String,
    },

    /// The identity generator was reached with a platform version that
    /// validation should have rejected.
    #[error("unsupported platform version {0}")]
    UnsupportedPlatformVersion(u32),

    /// The runtime rejected or aborted the start sequence.
    #[error("start failed: {0}")]
    StartFailed(String),

    /// `start` or `configure` was called while an instance is active.
    #[error("virtual machine already active (state: {state})")]
    AlreadyActive {
        /// State observed when the call was rejected.
        state: VmState,
    },

    /// `start` was called without a validated configuration.
    #[error("virtual machine not configured (state: {state})")]
    NotConfigured {
        /// State observed when the call was rejected.
        state: VmState,
    },

    /// Settings could not be loaded or parsed.
    #[error("settings error: {0}")]
    Settings(#[from] Box<figment::Error>),
}

impl VmError {
    /// Creates a new invalid configuration error.
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true if this is an invalid configuration error.
    #[must_use]
    pub const fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// Returns the offending field for invalid configuration errors.
    #[must_use]
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConfiguration { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Returns true if this is an already active error.
    #[must_use]
    pub const fn is_already_active(&self) -> bool {
        matches!(self, Self::AlreadyActive { .. })
    }

    /// Returns true if this is a start failure.
    #[must_use]
    pub const fn is_start_failed(&self) -> bool {
        matches!(self, Self::StartFailed(_))
    }
}

impl From<figment::Error> for VmError {
    fn from(err: figment::Error) -> Self {
        Self::Settings(Box::new(err))
    }
}

/// A diagnostic reported by the hypervisor runtime.
///
/// Mirrors the `(code, localizedDescription)` pair of an `NSError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    /// Runtime error code, `-1` when the runtime supplied none.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

impl RuntimeError {
    /// Creates a runtime error with an explicit code.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a runtime error without a meaningful code.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(-1, message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == -1 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (code={})", self.message, self.code)
        }
    }
}

impl std::error::Error for RuntimeError {}
