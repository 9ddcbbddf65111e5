//! Detection task state machine.
//!
//! A [`ScanTask`] carries one detection request from admission to delivery. The
//! worker pool drives it through [`Job::step`]; each step performs at most one
//! round of remote work and then reports whether the task finished, wants
//! another dispatch as soon as possible, or wants one after a delay.
//!
//! Per dispatch:
//!
//! 1. Deadline check. An expired task is delivered `TimedOutInQueue` when its
//!    fingerprint is still unknown, otherwise `TimedOutWaitingForResult`.
//! 2. Fingerprint resolution for local files.
//! 3. Poll pacing: a task polled less than the minimum interval ago is deferred
//!    for the remainder.
//! 4. The current phase: query the verdict, submit the sample, or fetch the
//!    next page of archive members. Each page is its own dispatch, so the
//!    deadline check runs between pages.
//!
//! Throttled remote calls are deferred by the configured backoff and retried in
//! the same phase; they never reach the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::worker_pool::{Job, Step};
use super::{
    ArchiveMemberResult, DetectError, DetectResult, Fingerprint, SequenceId, SourceRef, Verdict,
};
use crate::config::{DecompressPolicy, DetectorConfig};
use crate::util::clock;
use crate::remote::{
    action, DetectionRequest, QueryStatus, RemoteError, RemoteService, RemoteVerdict,
};

/// Consumer of a task's single result.
pub type ResultCallback = Box<dyn FnOnce(DetectResult) + Send>;

/// Admission bookkeeping notified when a task reaches its terminal state.
pub trait TaskLifecycle: Send + Sync {
    /// Called exactly once per admitted task, right before its result is delivered.
    fn on_task_end(&self, seq: SequenceId);
}

/// What a task scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A file on the local filesystem.
    LocalFile {
        /// Path to the file.
        path: PathBuf,
        /// Size probed at submission.
        size: u64,
    },
    /// A resource the service downloads itself.
    RemoteUrl {
        /// Validated URL.
        url: String,
    },
}

impl Source {
    /// Caller-facing reference.
    #[must_use]
    pub fn reference(&self) -> SourceRef {
        match self {
            Self::LocalFile { path, .. } => SourceRef::LocalFile(path.display().to_string()),
            Self::RemoteUrl { url } => SourceRef::RemoteUrl(url.clone()),
        }
    }
}

/// A validated detection request, before admission.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// What to scan.
    pub source: Source,
    /// Fingerprint, if supplied by the caller.
    pub fingerprint: Option<Fingerprint>,
    /// Time budget measured from task creation. `None` waits forever.
    pub deadline: Option<Duration>,
    /// Archive handling.
    pub decompress: DecompressPolicy,
}

impl TaskRequest {
    /// Request for a local file of `size` bytes.
    pub fn local_file(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            source: Source::LocalFile {
                path: path.into(),
                size,
            },
            fingerprint: None,
            deadline: None,
            decompress: DecompressPolicy::default(),
        }
    }

    /// Request for a remote resource with a known fingerprint.
    pub fn remote_url(url: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            source: Source::RemoteUrl { url: url.into() },
            fingerprint: Some(fingerprint),
            deadline: None,
            decompress: DecompressPolicy::default(),
        }
    }

    /// Apply a millisecond timeout; negative values mean no deadline.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.deadline = clock::timeout_from_ms(timeout_ms);
        self
    }

    /// Set the decompression policy.
    #[must_use]
    pub const fn with_decompress(mut self, decompress: DecompressPolicy) -> Self {
        self.decompress = decompress;
        self
    }
}

/// Pacing and paging parameters a task snapshots from the detector config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    /// Minimum time between two polls of the same task.
    pub min_poll_interval: Duration,
    /// Delay before retrying a throttled call.
    pub throttle_backoff: Duration,
    /// Archive listing page size.
    pub archive_page_size: usize,
}

impl From<&DetectorConfig> for TaskSettings {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            min_poll_interval: config.min_poll_interval(),
            throttle_backoff: config.throttle_backoff(),
            archive_page_size: config.archive_page_size.max(1),
        }
    }
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self::from(&DetectorConfig::default())
    }
}

#[derive(Debug)]
enum Phase {
    /// Poll the service for a verdict.
    Query,
    /// Upload (for local files) and register the sample. `object_key` is set once
    /// content is stored remotely so a throttled registration does not re-upload.
    Submit { object_key: Option<String> },
    /// Collect archive member results; `page` is the next page to fetch.
    ListArchive { page: u32, verdict: Verdict },
}

/// One detection request moving through the scheduler.
pub struct ScanTask {
    seq: SequenceId,
    source: Source,
    fingerprint: Option<Fingerprint>,
    created: Instant,
    deadline: Option<Duration>,
    last_poll: Option<Instant>,
    decompress: DecompressPolicy,
    settings: TaskSettings,
    phase: Phase,
    remote: Arc<dyn RemoteService>,
    callback: Option<ResultCallback>,
    lifecycle: Option<Arc<dyn TaskLifecycle>>,
}

impl std::fmt::Debug for ScanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanTask")
            .field("seq", &self.seq)
            .field("source", &self.source)
            .field("fingerprint", &self.fingerprint)
            .field("phase", &self.phase)
            .field("delivered", &self.callback.is_none())
            .finish_non_exhaustive()
    }
}

impl ScanTask {
    /// Create a task. Its deadline clock starts now.
    pub fn new(
        seq: SequenceId,
        request: TaskRequest,
        settings: TaskSettings,
        remote: Arc<dyn RemoteService>,
        callback: ResultCallback,
    ) -> Self {
        Self {
            seq,
            source: request.source,
            fingerprint: request.fingerprint,
            created: Instant::now(),
            deadline: request.deadline,
            last_poll: None,
            decompress: request.decompress,
            settings,
            phase: Phase::Query,
            remote,
            callback: Some(callback),
            lifecycle: None,
        }
    }

    /// Attach admission bookkeeping.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn TaskLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Sequence id assigned at admission.
    #[must_use]
    pub const fn seq(&self) -> SequenceId {
        self.seq
    }

    /// Fingerprint, once known.
    #[must_use]
    pub const fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// Whether the result has been delivered.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        self.callback.is_none()
    }

    /// Deliver `Aborted`. Used for tasks the pool refuses to run.
    pub fn abort(mut self) {
        warn!(seq = %self.seq, source = %self.source.reference(), "task aborted");
        self.finish(Err(DetectError::Aborted));
    }

    /// Time left before the deadline, `None` when there is none.
    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_sub(self.created.elapsed()))
    }

    /// Clamp a deferral so the task wakes up no later than its deadline.
    fn defer(&self, delay: Duration) -> Step {
        let delay = self.remaining().map_or(delay, |left| delay.min(left));
        Step::Defer(delay)
    }

    fn expired_error(&self) -> Option<DetectError> {
        let deadline = self.deadline?;
        if self.created.elapsed() < deadline {
            return None;
        }
        Some(if self.fingerprint.is_none() {
            DetectError::TimedOutInQueue
        } else {
            DetectError::TimedOutWaitingForResult
        })
    }

    fn pacing_delay(&self) -> Option<Duration> {
        let since = self.last_poll?.elapsed();
        (since < self.settings.min_poll_interval)
            .then(|| self.settings.min_poll_interval.saturating_sub(since))
    }

    fn resolve_fingerprint(&self) -> Result<Fingerprint, DetectError> {
        match &self.source {
            Source::LocalFile { path, .. } => Fingerprint::of_file(path),
            Source::RemoteUrl { url } => Err(DetectError::InvalidFingerprint(format!(
                "missing for {url}"
            ))),
        }
    }

    /// Build the result, release the admission slot and hand the result over.
    fn finish(&mut self, outcome: Result<Verdict, DetectError>) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        let result = DetectResult {
            seq: Some(self.seq),
            source: self.source.reference(),
            fingerprint: self.fingerprint.clone(),
            elapsed_ms: clock::elapsed_ms(self.created),
            outcome,
        };
        match &result.outcome {
            Ok(verdict) => debug!(
                seq = %self.seq,
                classification = ?verdict.classification,
                score = verdict.score,
                elapsed_ms = result.elapsed_ms,
                "task finished"
            ),
            Err(err) => debug!(
                seq = %self.seq,
                code = err.code(),
                error = %err,
                elapsed_ms = result.elapsed_ms,
                "task failed"
            ),
        }
        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.on_task_end(self.seq);
        }
        callback(result);
    }

    fn fail(&mut self, err: DetectError) -> Step {
        self.finish(Err(err));
        Step::Finished
    }

    fn query(&mut self, fingerprint: &Fingerprint) -> Step {
        match self.remote.query(fingerprint) {
            Ok(QueryStatus::Resolved(verdict)) => self.resolved(fingerprint, verdict),
            Ok(QueryStatus::Detecting) => {
                trace!(seq = %self.seq, "detection in progress");
                Step::Requeue
            }
            Ok(QueryStatus::NotFound) => {
                debug!(seq = %self.seq, fingerprint = %fingerprint, "no verdict yet, submitting sample");
                self.phase = Phase::Submit { object_key: None };
                self.submit(fingerprint)
            }
            Err(RemoteError::Throttled) => {
                debug!(seq = %self.seq, "query throttled");
                self.defer(self.settings.throttle_backoff)
            }
            Err(err) => {
                warn!(seq = %self.seq, error = %err, "verdict query failed");
                self.fail(DetectError::RemoteApi(err.diagnostic(action::QUERY)))
            }
        }
    }

    fn submit(&mut self, fingerprint: &Fingerprint) -> Step {
        let mut object_key = match &self.phase {
            Phase::Submit { object_key } => object_key.clone(),
            _ => None,
        };

        let local = match &self.source {
            Source::LocalFile { path, size } => Some((path.clone(), *size)),
            Source::RemoteUrl { .. } => None,
        };
        if let Some((path, size)) = local {
            if object_key.is_none() {
                let target = match self.remote.request_upload_target(fingerprint, size) {
                    Ok(target) => target,
                    Err(RemoteError::Throttled) => return self.defer(self.settings.throttle_backoff),
                    Err(err) => {
                        warn!(seq = %self.seq, error = %err, "upload target request failed");
                        return self.fail(DetectError::RemoteApi(err.diagnostic(action::UPLOAD_TARGET)));
                    }
                };
                if !target.already_present {
                    let content = match std::fs::read(&path) {
                        Ok(content) => content,
                        Err(err) => {
                            warn!(seq = %self.seq, path = %path.display(), error = %err, "sample unreadable at upload");
                            let err = RemoteError::Transport(format!("cannot read {}: {err}", path.display()));
                            return self.fail(DetectError::UploadFailed(err.diagnostic(action::UPLOAD)));
                        }
                    };
                    match self.remote.upload(&target, &content) {
                        Ok(()) => {}
                        Err(RemoteError::Throttled) => {
                            return self.defer(self.settings.throttle_backoff)
                        }
                        Err(err) => {
                            warn!(seq = %self.seq, error = %err, "sample upload failed");
                            return self.fail(DetectError::UploadFailed(err.diagnostic(action::UPLOAD)));
                        }
                    }
                }
                object_key = Some(target.object_key);
                self.phase = Phase::Submit {
                    object_key: object_key.clone(),
                };
            }
        }

        let request = DetectionRequest {
            fingerprint: fingerprint.clone(),
            source: self.source.reference(),
            object_key,
            decompress: self.decompress,
        };
        match self.remote.register(&request) {
            Ok(()) => {
                debug!(seq = %self.seq, fingerprint = %fingerprint, "detection registered");
                self.phase = Phase::Query;
                Step::Requeue
            }
            Err(RemoteError::Throttled) => self.defer(self.settings.throttle_backoff),
            Err(err) => {
                warn!(seq = %self.seq, error = %err, "detection registration failed");
                self.fail(DetectError::RemoteApi(err.diagnostic(action::REGISTER)))
            }
        }
    }

    fn resolved(&mut self, fingerprint: &Fingerprint, remote: RemoteVerdict) -> Step {
        let fan_out = remote.has_archive_members && self.decompress.enabled;
        let verdict = Verdict {
            classification: remote.classification,
            score: remote.score,
            family: remote.family,
            extra: remote.extra,
            archive_members: None,
        };
        if fan_out {
            self.list_archive(fingerprint, 1, verdict)
        } else {
            self.finish(Ok(verdict));
            Step::Finished
        }
    }

    /// Fetch one page of archive members. A full page schedules the next one;
    /// a short page ends the listing, and so does a failed page, which is
    /// recorded as a synthetic entry.
    fn list_archive(&mut self, fingerprint: &Fingerprint, page: u32, mut verdict: Verdict) -> Step {
        let page_size = self.settings.archive_page_size;
        match self.remote.list_archive_members(fingerprint, page, page_size) {
            Ok(entries) => {
                let full = entries.len() >= page_size;
                verdict.archive_members.get_or_insert_with(Vec::new).extend(entries);
                if full {
                    trace!(seq = %self.seq, page = page, "archive page collected");
                    self.phase = Phase::ListArchive {
                        page: page + 1,
                        verdict,
                    };
                    return Step::Requeue;
                }
            }
            Err(RemoteError::Throttled) => {
                debug!(seq = %self.seq, page = page, "archive listing throttled");
                self.phase = Phase::ListArchive { page, verdict };
                return self.defer(self.settings.throttle_backoff);
            }
            Err(err) => {
                warn!(seq = %self.seq, page = page, error = %err, "archive page request failed");
                verdict
                    .archive_members
                    .get_or_insert_with(Vec::new)
                    .push(ArchiveMemberResult::failed_page(err.diagnostic(action::LIST_ARCHIVE)));
            }
        }
        debug!(
            seq = %self.seq,
            members = verdict.archive_members.as_ref().map_or(0, Vec::len),
            "archive members collected"
        );
        self.finish(Ok(verdict));
        Step::Finished
    }
}

impl Job for ScanTask {
    fn step(&mut self) -> Step {
        if self.is_delivered() {
            return Step::Finished;
        }
        if let Some(err) = self.expired_error() {
            warn!(seq = %self.seq, error = %err, "task deadline expired");
            return self.fail(err);
        }

        let fingerprint = match self.fingerprint.clone() {
            Some(fp) => fp,
            None => match self.resolve_fingerprint() {
                Ok(fp) => {
                    trace!(seq = %self.seq, fingerprint = %fp, "fingerprint computed");
                    self.fingerprint = Some(fp.clone());
                    fp
                }
                Err(err) => return self.fail(err),
            },
        };

        // Archive pages are not verdict polls.
        if !matches!(self.phase, Phase::ListArchive { .. }) {
            if let Some(wait) = self.pacing_delay() {
                return self.defer(wait);
            }
            self.last_poll = Some(Instant::now());
        }

        match std::mem::replace(&mut self.phase, Phase::Query) {
            Phase::Query => self.query(&fingerprint),
            Phase::Submit { object_key } => {
                self.phase = Phase::Submit { object_key };
                self.submit(&fingerprint)
            }
            Phase::ListArchive { page, verdict } => self.list_archive(&fingerprint, page, verdict),
        }
    }
}

impl Drop for ScanTask {
    fn drop(&mut self) {
        if !self.is_delivered() {
            warn!(seq = %self.seq, "task dropped before delivery");
            self.finish(Err(DetectError::Aborted));
        }
    }
}
