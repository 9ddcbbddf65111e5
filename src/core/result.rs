//! Detection result model delivered to callers.

use serde::{Deserialize, Serialize};

use super::{ApiDiagnostic, DetectError, Fingerprint, SequenceId};

/// Verdict class reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Known good sample.
    Benign,
    /// Known bad or suspicious sample.
    Malicious,
    /// The service has no opinion.
    Unknown,
}

/// Terminal state of a delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// A verdict is available.
    Success,
    /// The request failed; see the error.
    Error,
}

/// What was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "location")]
pub enum SourceRef {
    /// A file on the local filesystem.
    LocalFile(String),
    /// A remote resource the service downloads itself.
    RemoteUrl(String),
}

impl SourceRef {
    /// Path or URL as a string.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::LocalFile(location) | Self::RemoteUrl(location) => location,
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.location())
    }
}

/// Per-member result of an archive sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMemberResult {
    /// Path of the member inside the archive.
    pub path: String,
    /// Member verdict.
    pub classification: Classification,
    /// Member score, 0-100.
    pub score: u8,
    /// Malware family label, if any.
    pub family: Option<String>,
    /// Free-form extra information from the service.
    pub extra: Option<serde_json::Value>,
    /// Set only on the synthetic entry recording a failed page request.
    pub error: Option<ApiDiagnostic>,
}

impl ArchiveMemberResult {
    /// Synthetic entry recording that a page of members could not be listed.
    #[must_use]
    pub const fn failed_page(diagnostic: ApiDiagnostic) -> Self {
        Self {
            path: String::new(),
            classification: Classification::Unknown,
            score: 0,
            family: None,
            extra: None,
            error: Some(diagnostic),
        }
    }
}

/// Successful detection outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Verdict class.
    pub classification: Classification,
    /// Score, 0-100.
    pub score: u8,
    /// Malware family label, if any.
    pub family: Option<String>,
    /// Free-form extra information from the service.
    pub extra: Option<serde_json::Value>,
    /// Member results when the sample is an archive and decompression was requested.
    pub archive_members: Option<Vec<ArchiveMemberResult>>,
}

/// Outcome of one submission, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResult {
    /// Sequence id, absent when the request was rejected before one was drawn.
    pub seq: Option<SequenceId>,
    /// The submitted path or URL.
    pub source: SourceRef,
    /// Fingerprint, once known.
    pub fingerprint: Option<Fingerprint>,
    /// Milliseconds between task creation and delivery.
    pub elapsed_ms: u64,
    /// Verdict or error.
    pub outcome: Result<Verdict, DetectError>,
}

impl DetectResult {
    /// Whether a verdict is available.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Terminal state.
    #[must_use]
    pub const fn status(&self) -> ResultStatus {
        if self.outcome.is_ok() {
            ResultStatus::Success
        } else {
            ResultStatus::Error
        }
    }

    /// Numeric result code: 0 on success, the error code otherwise.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match &self.outcome {
            Ok(_) => 0,
            Err(err) => err.code(),
        }
    }

    /// The verdict, if successful.
    #[must_use]
    pub fn verdict(&self) -> Option<&Verdict> {
        self.outcome.as_ref().ok()
    }

    /// The error, if failed.
    #[must_use]
    pub fn error(&self) -> Option<&DetectError> {
        self.outcome.as_ref().err()
    }
}
