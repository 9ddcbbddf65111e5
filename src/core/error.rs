//! Error types for detection requests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Diagnostic code used when the remote service could not be reached at all.
pub const NETWORK_ERROR_CODE: &str = "NetworkError";

/// Structured detail attached to remote call failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDiagnostic {
    /// Name of the remote operation that failed.
    pub action: String,
    /// Error code reported by the service, or `NetworkError`.
    pub code: String,
    /// Error message reported by the service or transport.
    pub message: String,
}

impl ApiDiagnostic {
    /// Build a diagnostic for `action`.
    pub fn new(action: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Compact JSON rendering with sorted keys.
    ///
    /// ```
    /// use detect_lot::core::ApiDiagnostic;
    ///
    /// let diag = ApiDiagnostic::new("QueryResult", "ServerError", "boom");
    /// assert_eq!(
    ///     diag.to_json(),
    ///     r#"{"action":"QueryResult","error_code":"ServerError","error_message":"boom"}"#
    /// );
    /// ```
    #[must_use]
    pub fn to_json(&self) -> String {
        // serde_json::Value objects are BTreeMap backed, so keys come out sorted.
        serde_json::json!({
            "action": self.action,
            "error_code": self.code,
            "error_message": self.message,
        })
        .to_string()
    }
}

impl std::fmt::Display for ApiDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed with {}: {}", self.action, self.code, self.message)
    }
}

/// Errors produced by the detector, either synchronously at submission or as a
/// task's terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DetectError {
    /// The detector has not been initialized, or was shut down.
    #[error("detector is not initialized")]
    NotInitialized,
    /// `init` was called twice without an intervening `uninit`.
    #[error("detector is already initialized")]
    AlreadyInitialized,
    /// The local file does not exist or could not be read.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path that was not found.
        path: String,
    },
    /// A caller-supplied fingerprint is not 32 hexadecimal characters.
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    /// A caller-supplied URL has no scheme or host.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Admission control rejected the submission.
    #[error("detection queue is full")]
    QueueFull,
    /// The deadline expired before the sample could even be fingerprinted.
    #[error("timed out waiting in queue")]
    TimedOutInQueue,
    /// The deadline expired while waiting on the remote verdict.
    #[error("timed out waiting for detection result")]
    TimedOutWaitingForResult,
    /// The detector shut down before the task finished.
    #[error("detection aborted by shutdown")]
    Aborted,
    /// Uploading the sample content failed.
    #[error("upload failed: {0}")]
    UploadFailed(ApiDiagnostic),
    /// A remote API call failed.
    #[error("remote api error: {0}")]
    RemoteApi(ApiDiagnostic),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DetectError {
    /// Stable numeric code for this error kind. Success is `0`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::NotInitialized | Self::AlreadyInitialized | Self::InvalidConfig(_) => -100,
            Self::FileNotFound { .. } => -99,
            Self::QueueFull => -98,
            Self::RemoteApi(_) => -97,
            Self::TimedOutWaitingForResult => -96,
            Self::UploadFailed(_) => -95,
            Self::Aborted => -94,
            Self::TimedOutInQueue => -93,
            Self::InvalidFingerprint(_) => -92,
            Self::InvalidUrl(_) => -91,
        }
    }

    /// Remote diagnostic, if this error carries one.
    #[must_use]
    pub const fn diagnostic(&self) -> Option<&ApiDiagnostic> {
        match self {
            Self::UploadFailed(diag) | Self::RemoteApi(diag) => Some(diag),
            _ => None,
        }
    }
}
