//! Remote detection service boundary.
//!
//! The scheduler only talks to the service through [`RemoteService`]. Concrete
//! clients own the wire protocol, authentication and upload transport; they are
//! built by a [`RemoteConnector`] when the detector is initialized.

pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DecompressPolicy, DetectorConfig, Endpoint, DEFAULT_REGION};
use crate::core::{ApiDiagnostic, ArchiveMemberResult, Classification, DetectError, Fingerprint, SourceRef};

pub use mock::{MockCall, MockConnector, MockRemote};

/// Error codes the service uses to signal rate limiting.
pub const THROTTLING_CODES: &[&str] = &["RequestTooFrequently", "Throttling.User"];

/// Error code the service uses when it holds no result for a fingerprint.
pub const NOT_FOUND_CODE: &str = "GetResultFail";

/// Operation names used in diagnostics.
pub mod action {
    /// Verdict lookup.
    pub const QUERY: &str = "QueryResult";
    /// Upload target request.
    pub const UPLOAD_TARGET: &str = "RequestUploadTarget";
    /// Content upload.
    pub const UPLOAD: &str = "UploadContent";
    /// Detection registration.
    pub const REGISTER: &str = "RegisterDetection";
    /// Archive member listing.
    pub const LIST_ARCHIVE: &str = "ListArchiveMembers";
}

/// Access credentials for the service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
    /// Optional temporary security token.
    pub security_token: Option<String>,
}

impl Credentials {
    /// Long-term credentials.
    pub fn new(access_key_id: impl Into<String>, access_key_secret: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            security_token: None,
        }
    }

    /// Attach a temporary security token.
    #[must_use]
    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Connection parameters resolved at `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Region requested by the caller, or the default region.
    pub region: String,
    /// Deployment serving that region.
    pub endpoint: Endpoint,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
    /// Upload timeout.
    pub upload_timeout: Duration,
}

impl ClientOptions {
    /// Resolve options for `region` from detector configuration.
    #[must_use]
    pub fn resolve(config: &DetectorConfig, region: Option<&str>) -> Self {
        Self {
            region: region.unwrap_or(DEFAULT_REGION).to_string(),
            endpoint: Endpoint::for_region(region),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            upload_timeout: Duration::from_millis(config.upload_timeout_ms),
        }
    }
}

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The service asked us to slow down. Always retried locally.
    #[error("throttled")]
    Throttled,
    /// The service answered with an error.
    #[error("{code}: {message}")]
    Api {
        /// Service error code.
        code: String,
        /// Service error message.
        message: String,
    },
    /// No answer from the service.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Classify a service error code.
    pub fn from_api_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        if THROTTLING_CODES.contains(&code.as_str()) {
            Self::Throttled
        } else {
            Self::Api {
                code,
                message: message.into(),
            }
        }
    }

    /// Structured diagnostic for a failed `action`.
    #[must_use]
    pub fn diagnostic(&self, action: &str) -> ApiDiagnostic {
        match self {
            Self::Throttled => ApiDiagnostic::new(action, THROTTLING_CODES[0], "request throttled"),
            Self::Api { code, message } => ApiDiagnostic::new(action, code.as_str(), message.as_str()),
            Self::Transport(message) => {
                ApiDiagnostic::new(action, crate::core::error::NETWORK_ERROR_CODE, message.as_str())
            }
        }
    }
}

/// Verdict returned by the service for a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    /// Verdict class.
    pub classification: Classification,
    /// Score, 0-100.
    pub score: u8,
    /// Malware family label.
    pub family: Option<String>,
    /// Free-form extra information.
    pub extra: Option<serde_json::Value>,
    /// The sample is an archive with per-member results available.
    pub has_archive_members: bool,
}

impl RemoteVerdict {
    /// A plain verdict with no extra metadata.
    #[must_use]
    pub const fn new(classification: Classification, score: u8) -> Self {
        Self {
            classification,
            score,
            family: None,
            extra: None,
            has_archive_members: false,
        }
    }

    /// Attach a malware family label.
    #[must_use]
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    /// Mark the sample as an archive with member results.
    #[must_use]
    pub const fn with_archive_members(mut self) -> Self {
        self.has_archive_members = true;
        self
    }
}

/// Answer to a verdict lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    /// A verdict is available.
    Resolved(RemoteVerdict),
    /// The service holds no (unexpired) record; the sample must be submitted.
    NotFound,
    /// Detection is still running remotely.
    Detecting,
}

impl QueryStatus {
    /// Classify an error code returned by a verdict lookup.
    ///
    /// # Errors
    ///
    /// Returns the `RemoteError` for every code other than the not-found code.
    pub fn from_error_code(code: &str, message: &str) -> Result<Self, RemoteError> {
        if code == NOT_FOUND_CODE {
            Ok(Self::NotFound)
        } else {
            Err(RemoteError::from_api_code(code, message))
        }
    }
}

/// Where to upload a sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadTarget {
    /// Upload URL.
    pub url: String,
    /// Storage key the content is registered under.
    pub object_key: String,
    /// The service already holds this content; skip the upload.
    pub already_present: bool,
    /// Extra form fields the upload must carry.
    pub form: BTreeMap<String, String>,
}

/// Request to start remote detection of a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRequest {
    /// Sample fingerprint.
    pub fingerprint: Fingerprint,
    /// Where the sample came from.
    pub source: SourceRef,
    /// Storage key of uploaded content, for local samples.
    pub object_key: Option<String>,
    /// Archive handling.
    pub decompress: DecompressPolicy,
}

/// Client for the remote detection service.
///
/// Calls are synchronous from the task's point of view and may block for up to
/// the configured timeouts.
pub trait RemoteService: Send + Sync {
    /// Look up the verdict for a fingerprint.
    fn query(&self, fingerprint: &Fingerprint) -> Result<QueryStatus, RemoteError>;

    /// Ask where to upload a sample of `size` bytes.
    fn request_upload_target(&self, fingerprint: &Fingerprint, size: u64) -> Result<UploadTarget, RemoteError>;

    /// Upload sample content.
    fn upload(&self, target: &UploadTarget, content: &[u8]) -> Result<(), RemoteError>;

    /// Start remote detection.
    fn register(&self, request: &DetectionRequest) -> Result<(), RemoteError>;

    /// One page of archive member results. Pages are numbered from 1.
    fn list_archive_members(
        &self,
        fingerprint: &Fingerprint,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<ArchiveMemberResult>, RemoteError>;
}

/// Builds a [`RemoteService`] client at `init`.
pub trait RemoteConnector: Send + Sync {
    /// Create a client handle.
    ///
    /// # Errors
    ///
    /// Returns a `DetectError` if the client cannot be constructed.
    fn connect(
        &self,
        credentials: &Credentials,
        options: &ClientOptions,
    ) -> Result<Arc<dyn RemoteService>, DetectError>;
}
