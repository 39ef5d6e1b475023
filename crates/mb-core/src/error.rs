//! Error types shared across the workspace.
//!
//! `DaqError` is the workspace-level error. Driver crates define their own,
//! richer error enums and convert into `DaqError::Driver` at their boundary,
//! so callers that juggle several devices only have to match on one type.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: a value was rejected at a setter boundary (out of
//!   range, wrong shape, wrong sign, illegal characters, read-only). The
//!   previous value is always preserved.
//! - **`Driver`**: a categorised failure reported by a device driver.
//! - **`Timeout`**: an operation did not complete within its budget.
//! - **`Io`** / **`Serialization`**: wrapped lower-level failures.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be brought up.
    Initialization,
    /// A value was rejected.
    Configuration,
    /// The device could not be reached.
    Communication,
    /// The device answered something unexpected.
    Protocol,
    /// An operation did not complete in time.
    Timeout,
    /// The device is in use by another operation.
    Busy,
    /// The device or its worker has stopped.
    Shutdown,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured error reported by a driver crate.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver that reported the error, e.g. `asm`.
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human readable details.
    pub message: String,
}

impl DriverError {
    /// Create a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the workspace error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the workspace.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A value was rejected by an attribute or a configuration check.
    ///
    /// **Recovery Strategy**: fix the value; the previous one is still in place.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(DriverError),

    /// An operation exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DriverError> for DaqError {
    fn from(err: DriverError) -> Self {
        DaqError::Driver(err)
    }
}

impl DaqError {
    /// True when the error was raised at a setter or configuration boundary.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DaqError::Configuration(_)
                | DaqError::Driver(DriverError {
                    kind: DriverErrorKind::Configuration,
                    ..
                })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display_includes_kind_and_driver() {
        let err = DriverError::new("asm", DriverErrorKind::Communication, "host unreachable");
        assert_eq!(
            err.to_string(),
            "Driver 'asm' communication error: host unreachable"
        );
    }

    #[test]
    fn configuration_classification() {
        assert!(DaqError::Configuration("bad".into()).is_configuration());
        let driver: DaqError =
            DriverError::new("asm", DriverErrorKind::Configuration, "bad gain").into();
        assert!(driver.is_configuration());
        assert!(!DaqError::Timeout("slow".into()).is_configuration());
    }
}
