//! Error types for the ASM driver.
//!
//! The variants follow how failures are handled:
//!
//! - `Connectivity`: the ASM cannot be reached. Retried a bounded number of
//!   times at start-up, fatal afterwards.
//! - `Protocol`: the ASM answered with an unexpected status code. Never
//!   retried automatically.
//! - `Configuration`: a value was rejected at a setter or while deriving
//!   scan parameters. The previous value is kept.
//! - `AcquisitionBusy`, `WorkerStopped`, `Timeout`: acquisition lifecycle
//!   failures reported to the caller of a single-field acquisition.

use crate::transport::ApiResponse;
use mb_core::error::{DaqError, DriverError, DriverErrorKind};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Driver name used when converting into [`DaqError::Driver`].
pub const DRIVER_TYPE: &str = "asm";

/// Result type of the ASM driver.
pub type AsmResult<T> = std::result::Result<T, AsmError>;

/// Errors of the ASM driver.
#[derive(Error, Debug)]
pub enum AsmError {
    /// The ASM could not be reached.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The ASM answered with an unexpected status code.
    #[error("{0}")]
    Protocol(Box<ApiError>),

    /// A value was rejected.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A call or an acquisition did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A single field was requested while a stream is running.
    #[error(
        "There is already an acquisition on going with {listeners} listeners subscribed, \
         first cancel/stop current running acquisition to acquire a single field-image"
    )]
    AcquisitionBusy {
        /// Subscribers of the running acquisition.
        listeners: usize,
    },

    /// The acquisition worker ended before answering.
    #[error("Acquisition worker stopped before delivering the field image")]
    WorkerStopped,

    /// A field image could not be decoded.
    #[error("Failed to decode field image: {0}")]
    ImageDecode(String),

    /// A message could not be (de)serialized.
    #[error("Invalid JSON exchanged with the ASM: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other workspace error.
    #[error(transparent)]
    Core(DaqError),
}

impl AsmError {
    /// Failure category.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            AsmError::Connectivity(_) => DriverErrorKind::Communication,
            AsmError::Protocol(_) | AsmError::Json(_) | AsmError::ImageDecode(_) => {
                DriverErrorKind::Protocol
            }
            AsmError::Configuration(_) => DriverErrorKind::Configuration,
            AsmError::Timeout(_) => DriverErrorKind::Timeout,
            AsmError::AcquisitionBusy { .. } => DriverErrorKind::Busy,
            AsmError::WorkerStopped => DriverErrorKind::Shutdown,
            AsmError::Core(_) => DriverErrorKind::Unknown,
        }
    }

    /// The structured protocol failure, if this is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            AsmError::Protocol(api) => Some(&**api),
            _ => None,
        }
    }
}

impl From<DaqError> for AsmError {
    fn from(err: DaqError) -> Self {
        match err {
            DaqError::Configuration(msg) => AsmError::Configuration(msg),
            DaqError::Timeout(msg) => AsmError::Timeout(msg),
            other => AsmError::Core(other),
        }
    }
}

impl From<AsmError> for DaqError {
    fn from(err: AsmError) -> Self {
        match err {
            AsmError::Configuration(msg) => DaqError::Configuration(msg),
            AsmError::Timeout(msg) => DaqError::Timeout(msg),
            AsmError::Core(inner) => inner,
            other => DaqError::Driver(DriverError::new(
                DRIVER_TYPE,
                other.kind(),
                other.to_string(),
            )),
        }
    }
}

// =============================================================================
// ApiError
// =============================================================================

/// An unexpected answer from the ASM.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// Full URL of the call.
    pub url: String,
    /// Received status code.
    pub status: u16,
    /// Reason phrase of the received status.
    pub reason: String,
    /// Status code the call expected.
    pub expected: u16,
    /// `status_code` reported inside a JSON error body.
    pub server_status_code: Option<i64>,
    /// `message` from a JSON error body, or the raw body text.
    pub server_message: Option<String>,
    /// Findings of the system health checks, when enabled.
    pub diagnostics: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    status_code: i64,
    message: serde_json::Value,
}

impl ApiError {
    /// Build from a response, parsing a JSON error body when there is one.
    pub fn from_response(url: impl Into<String>, response: &ApiResponse, expected: u16) -> Self {
        let (server_status_code, server_message) =
            match serde_json::from_slice::<ErrorBody>(&response.body) {
                Ok(body) => {
                    let message = match body.message {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (Some(body.status_code), Some(message))
                }
                Err(_) => {
                    let text = response.text();
                    let text = text.trim();
                    (None, (!text.is_empty()).then(|| text.to_string()))
                }
            };

        Self {
            url: url.into(),
            status: response.status,
            reason: response.reason.clone(),
            expected,
            server_status_code,
            server_message,
            diagnostics: Vec::new(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Call to {} received unexpected answer. Received status code {} because of the reason '{}', \
             but expected status code was {}",
            self.url, self.status, self.reason, self.expected
        )?;
        match (self.server_status_code, &self.server_message) {
            (Some(code), Some(message)) => {
                write!(f, ". Error status code {} with the message: '{}'", code, message)?
            }
            (None, Some(message)) => write!(f, ". Response: '{}'", message)?,
            _ => {}
        }
        if !self.diagnostics.is_empty() {
            write!(f, ". System checks: {}", self.diagnostics.join("; "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://localhost:8080/v2/scan/scan_field";

    #[test]
    fn json_error_body_is_parsed() {
        let response = ApiResponse::new(
            400,
            r#"{"status_code": 17, "message": "no mega field open"}"#,
        );
        let err = ApiError::from_response(URL, &response, 204);
        assert_eq!(err.server_status_code, Some(17));
        assert_eq!(err.server_message.as_deref(), Some("no mega field open"));
        let text = err.to_string();
        assert!(text.starts_with(&format!("Call to {} received unexpected answer", URL)));
        assert!(text.contains("Received status code 400 because of the reason 'Bad Request'"));
        assert!(text.contains("expected status code was 204"));
        assert!(text.contains("no mega field open"));
    }

    #[test]
    fn plain_text_and_empty_bodies() {
        let err = ApiError::from_response(URL, &ApiResponse::new(500, "boom"), 204);
        assert_eq!(err.server_status_code, None);
        assert_eq!(err.server_message.as_deref(), Some("boom"));

        let err = ApiError::from_response(URL, &ApiResponse::new(503, ""), 204);
        assert_eq!(err.server_message, None);
        assert!(err.to_string().ends_with("expected status code was 204"));
    }

    #[test]
    fn diagnostics_supplement_the_message() {
        let mut err = ApiError::from_response(URL, &ApiResponse::new(500, "boom"), 204);
        err.diagnostics.push("Installation in progress.".into());
        let text = err.to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("System checks: Installation in progress."));
    }

    #[test]
    fn converts_into_workspace_error() {
        let err: DaqError = AsmError::Connectivity("unreachable".into()).into();
        match err {
            DaqError::Driver(driver) => {
                assert_eq!(driver.kind, DriverErrorKind::Communication);
                assert_eq!(driver.driver_type, DRIVER_TYPE);
            }
            other => panic!("unexpected {other:?}"),
        }
        let err: DaqError = AsmError::Configuration("bad".into()).into();
        assert!(err.is_configuration());
        let back: AsmError = DaqError::Configuration("x".into()).into();
        assert!(matches!(back, AsmError::Configuration(_)));
    }
}
