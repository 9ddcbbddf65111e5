//! In-memory remote service for tests and demos.
//!
//! `MockRemote` simulates the service's lifecycle for each fingerprint: unknown
//! samples answer `NotFound`, registered samples answer `Detecting` for a
//! configurable number of polls and then resolve to their configured verdict.
//! Scripted answers can be queued per fingerprint to inject throttling or errors
//! into queries, and per [`MockCall`] for the other calls.
//!
//! # Examples
//!
//! ```rust
//! use detect_lot::core::{Classification, Fingerprint};
//! use detect_lot::remote::{MockRemote, RemoteError, RemoteVerdict};
//!
//! let fp = Fingerprint::of_bytes(b"sample");
//! let remote = MockRemote::new()
//!     .with_detect_polls(2)
//!     .with_verdict(&fp, RemoteVerdict::new(Classification::Malicious, 95))
//!     .with_scripted_query(&fp, Err(RemoteError::Throttled));
//! ```
//!
//! Throttle the first registration, then let it through:
//!
//! ```rust
//! use detect_lot::remote::{MockCall, MockRemote, RemoteError};
//!
//! let remote = MockRemote::new().with_scripted_failure(MockCall::Register, RemoteError::Throttled);
//! assert_eq!(remote.call_count(MockCall::Register), 0);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    ClientOptions, Credentials, DetectionRequest, QueryStatus, RemoteConnector, RemoteError,
    RemoteService, RemoteVerdict, UploadTarget,
};
use crate::core::{ArchiveMemberResult, Classification, DetectError, Fingerprint};

/// Remote calls other than the verdict query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    /// [`RemoteService::request_upload_target`].
    UploadTarget,
    /// [`RemoteService::upload`].
    Upload,
    /// [`RemoteService::register`].
    Register,
    /// [`RemoteService::list_archive_members`].
    ListArchive,
}

#[derive(Default)]
struct MockState {
    /// Verdict a fingerprint resolves to once detected.
    verdicts: HashMap<Fingerprint, RemoteVerdict>,
    /// Fingerprints the service already has a verdict for.
    resolved: HashSet<Fingerprint>,
    /// Content the service already stores.
    stored: HashSet<Fingerprint>,
    /// Registered fingerprints and their remaining `Detecting` answers.
    detecting: HashMap<Fingerprint, u32>,
    /// Answers returned before the simulated lifecycle.
    scripted: HashMap<Fingerprint, VecDeque<Result<QueryStatus, RemoteError>>>,
    archives: HashMap<Fingerprint, Vec<ArchiveMemberResult>>,
    failing_pages: HashSet<u32>,
    page_log: Vec<(u32, usize, usize)>,
    registrations: Vec<DetectionRequest>,
    upload_error: Option<RemoteError>,
    register_error: Option<RemoteError>,
    /// One-shot failures for specific archive pages.
    page_failures: HashMap<u32, VecDeque<RemoteError>>,
    /// One-shot failures returned before the call's normal behaviour.
    failures: HashMap<MockCall, VecDeque<RemoteError>>,
    /// Attempts per call, failed ones included.
    calls: HashMap<MockCall, u64>,
}

impl MockState {
    /// Count an attempt of `call` and pop its next scripted failure.
    fn attempt(&mut self, call: MockCall) -> Option<RemoteError> {
        *self.calls.entry(call).or_default() += 1;
        self.failures.get_mut(&call).and_then(VecDeque::pop_front)
    }
}

#[derive(Default)]
struct Gate {
    paused: bool,
    blocked: usize,
}

/// Scriptable in-memory [`RemoteService`].
pub struct MockRemote {
    state: Mutex<MockState>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
    default_verdict: RemoteVerdict,
    detect_polls: u32,
    latency: Option<Duration>,
    queries: AtomicU64,
    uploads: AtomicU64,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Mock resolving every sample to benign, score 0, on the first poll after
    /// registration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
            default_verdict: RemoteVerdict::new(Classification::Benign, 0),
            detect_polls: 0,
            latency: None,
            queries: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
        }
    }

    /// Verdict for fingerprints without an explicit one.
    #[must_use]
    pub fn with_default_verdict(mut self, verdict: RemoteVerdict) -> Self {
        self.default_verdict = verdict;
        self
    }

    /// Number of `Detecting` answers a sample gets after registration.
    #[must_use]
    pub const fn with_detect_polls(mut self, polls: u32) -> Self {
        self.detect_polls = polls;
        self
    }

    /// Simulated latency of every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Verdict `fingerprint` resolves to once detected.
    #[must_use]
    pub fn with_verdict(self, fingerprint: &Fingerprint, verdict: RemoteVerdict) -> Self {
        self.state.lock().verdicts.insert(fingerprint.clone(), verdict);
        self
    }

    /// The service already has a verdict for `fingerprint`.
    #[must_use]
    pub fn with_known_verdict(self, fingerprint: &Fingerprint, verdict: RemoteVerdict) -> Self {
        {
            let mut state = self.state.lock();
            state.verdicts.insert(fingerprint.clone(), verdict);
            state.resolved.insert(fingerprint.clone());
        }
        self
    }

    /// The service already stores the content of `fingerprint`.
    #[must_use]
    pub fn with_stored_content(self, fingerprint: &Fingerprint) -> Self {
        self.state.lock().stored.insert(fingerprint.clone());
        self
    }

    /// Queue an answer returned by the next query of `fingerprint`.
    #[must_use]
    pub fn with_scripted_query(
        self,
        fingerprint: &Fingerprint,
        answer: Result<QueryStatus, RemoteError>,
    ) -> Self {
        self.state
            .lock()
            .scripted
            .entry(fingerprint.clone())
            .or_default()
            .push_back(answer);
        self
    }

    /// Archive members listed for `fingerprint`.
    #[must_use]
    pub fn with_archive(self, fingerprint: &Fingerprint, members: Vec<ArchiveMemberResult>) -> Self {
        self.state.lock().archives.insert(fingerprint.clone(), members);
        self
    }

    /// Make listing page `page` fail.
    #[must_use]
    pub fn with_failing_page(self, page: u32) -> Self {
        self.state.lock().failing_pages.insert(page);
        self
    }

    /// Queue `error` for the next request of archive page `page`.
    #[must_use]
    pub fn with_scripted_page_failure(self, page: u32, error: RemoteError) -> Self {
        self.state
            .lock()
            .page_failures
            .entry(page)
            .or_default()
            .push_back(error);
        self
    }

    /// Make every upload fail with `error`.
    #[must_use]
    pub fn with_upload_error(self, error: RemoteError) -> Self {
        self.state.lock().upload_error = Some(error);
        self
    }

    /// Queue `error` for the next attempt of `call`. Queued failures are
    /// returned in order, one per attempt.
    #[must_use]
    pub fn with_scripted_failure(self, call: MockCall, error: RemoteError) -> Self {
        self.state
            .lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
        self
    }

    /// Make every registration fail with `error`.
    #[must_use]
    pub fn with_register_error(self, error: RemoteError) -> Self {
        self.state.lock().register_error = Some(error);
        self
    }

    /// Number of verdict lookups served.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of content uploads served.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Attempts of `call`, failed ones included.
    pub fn call_count(&self, call: MockCall) -> u64 {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Registrations received, in order.
    pub fn registrations(&self) -> Vec<DetectionRequest> {
        self.state.lock().registrations.clone()
    }

    /// `(page, requested size, returned entries)` for every listing request.
    pub fn page_requests(&self) -> Vec<(u32, usize, usize)> {
        self.state.lock().page_log.clone()
    }

    /// Hold every subsequent query until [`resume_queries`](Self::resume_queries).
    pub fn pause_queries(&self) {
        self.gate.lock().paused = true;
    }

    /// Release held queries.
    pub fn resume_queries(&self) {
        self.gate.lock().paused = false;
        self.gate_changed.notify_all();
    }

    /// Wait until at least `count` queries are held. Returns `false` on timeout.
    pub fn wait_for_held_queries(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while gate.blocked < count {
            if self.gate_changed.wait_until(&mut gate, deadline).timed_out() {
                return gate.blocked >= count;
            }
        }
        true
    }

    fn hold_if_paused(&self) {
        let mut gate = self.gate.lock();
        if !gate.paused {
            return;
        }
        gate.blocked += 1;
        self.gate_changed.notify_all();
        while gate.paused {
            self.gate_changed.wait(&mut gate);
        }
        gate.blocked -= 1;
    }

    fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }

    fn verdict_for(&self, state: &MockState, fingerprint: &Fingerprint) -> RemoteVerdict {
        state
            .verdicts
            .get(fingerprint)
            .cloned()
            .unwrap_or_else(|| self.default_verdict.clone())
    }
}

impl RemoteService for MockRemote {
    fn query(&self, fingerprint: &Fingerprint) -> Result<QueryStatus, RemoteError> {
        self.hold_if_paused();
        self.simulate_latency();
        self.queries.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(answer) = state
            .scripted
            .get_mut(fingerprint)
            .and_then(VecDeque::pop_front)
        {
            return answer;
        }
        if state.resolved.contains(fingerprint) {
            return Ok(QueryStatus::Resolved(self.verdict_for(&state, fingerprint)));
        }
        match state.detecting.get(fingerprint).copied() {
            Some(0) => {
                state.detecting.remove(fingerprint);
                state.resolved.insert(fingerprint.clone());
                Ok(QueryStatus::Resolved(self.verdict_for(&state, fingerprint)))
            }
            Some(remaining) => {
                state.detecting.insert(fingerprint.clone(), remaining - 1);
                Ok(QueryStatus::Detecting)
            }
            None => Ok(QueryStatus::NotFound),
        }
    }

    fn request_upload_target(&self, fingerprint: &Fingerprint, _size: u64) -> Result<UploadTarget, RemoteError> {
        self.simulate_latency();
        let mut state = self.state.lock();
        if let Some(err) = state.attempt(MockCall::UploadTarget) {
            return Err(err);
        }
        Ok(UploadTarget {
            url: format!("mock://uploads/{fingerprint}"),
            object_key: format!("samples/{fingerprint}"),
            already_present: state.stored.contains(fingerprint),
            form: std::collections::BTreeMap::new(),
        })
    }

    fn upload(&self, target: &UploadTarget, content: &[u8]) -> Result<(), RemoteError> {
        self.simulate_latency();
        let mut state = self.state.lock();
        if let Some(err) = state.attempt(MockCall::Upload) {
            return Err(err);
        }
        if let Some(err) = state.upload_error.clone() {
            return Err(err);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        state.stored.insert(Fingerprint::of_bytes(content));
        tracing::trace!(url = %target.url, bytes = content.len(), "mock upload");
        Ok(())
    }

    fn register(&self, request: &DetectionRequest) -> Result<(), RemoteError> {
        self.simulate_latency();
        let mut state = self.state.lock();
        if let Some(err) = state.attempt(MockCall::Register) {
            return Err(err);
        }
        if let Some(err) = state.register_error.clone() {
            return Err(err);
        }
        state.registrations.push(request.clone());
        state
            .detecting
            .insert(request.fingerprint.clone(), self.detect_polls);
        Ok(())
    }

    fn list_archive_members(
        &self,
        fingerprint: &Fingerprint,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<ArchiveMemberResult>, RemoteError> {
        self.simulate_latency();
        let mut state = self.state.lock();
        let mut scripted = state.attempt(MockCall::ListArchive);
        if scripted.is_none() {
            scripted = state.page_failures.get_mut(&page).and_then(VecDeque::pop_front);
        }
        if let Some(err) = scripted {
            state.page_log.push((page, page_size, 0));
            return Err(err);
        }
        if state.failing_pages.contains(&page) {
            state.page_log.push((page, page_size, 0));
            return Err(RemoteError::Api {
                code: "ServerError".into(),
                message: format!("page {page} unavailable"),
            });
        }
        let start = (page.saturating_sub(1) as usize).saturating_mul(page_size);
        let entries: Vec<ArchiveMemberResult> = state
            .archives
            .get(fingerprint)
            .map(|members| members.iter().skip(start).take(page_size).cloned().collect())
            .unwrap_or_default();
        state.page_log.push((page, page_size, entries.len()));
        Ok(entries)
    }
}

/// Connector handing out a shared [`MockRemote`].
pub struct MockConnector {
    remote: Arc<MockRemote>,
    fail_with: Option<DetectError>,
    connections: Mutex<Vec<ClientOptions>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new(Arc::new(MockRemote::new()))
    }
}

impl MockConnector {
    /// Connector returning `remote` on every `connect`.
    #[must_use]
    pub fn new(remote: Arc<MockRemote>) -> Self {
        Self {
            remote,
            fail_with: None,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Connector whose `connect` always fails with `error`.
    #[must_use]
    pub fn failing(error: DetectError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::default()
        }
    }

    /// The shared mock service.
    #[must_use]
    pub fn remote(&self) -> Arc<MockRemote> {
        Arc::clone(&self.remote)
    }

    /// Options of every successful `connect`, in order.
    pub fn connections(&self) -> Vec<ClientOptions> {
        self.connections.lock().clone()
    }
}

impl RemoteConnector for MockConnector {
    fn connect(
        &self,
        credentials: &Credentials,
        options: &ClientOptions,
    ) -> Result<Arc<dyn RemoteService>, DetectError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        tracing::debug!(key_id = %credentials.access_key_id, region = %options.region, "mock connect");
        self.connections.lock().push(options.clone());
        Ok(Arc::clone(&self.remote) as Arc<dyn RemoteService>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecompressPolicy;
    use crate::core::SourceRef;

    fn request(fp: &Fingerprint) -> DetectionRequest {
        DetectionRequest {
            fingerprint: fp.clone(),
            source: SourceRef::LocalFile("/tmp/x".into()),
            object_key: None,
            decompress: DecompressPolicy::default(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let fp = Fingerprint::of_bytes(b"abc");
        let remote = MockRemote::new().with_detect_polls(2);

        assert_eq!(remote.query(&fp), Ok(QueryStatus::NotFound));
        remote.register(&request(&fp)).unwrap();
        assert_eq!(remote.query(&fp), Ok(QueryStatus::Detecting));
        assert_eq!(remote.query(&fp), Ok(QueryStatus::Detecting));
        assert!(matches!(remote.query(&fp), Ok(QueryStatus::Resolved(_))));
        assert!(matches!(remote.query(&fp), Ok(QueryStatus::Resolved(_))));
        assert_eq!(remote.query_count(), 5);
    }

    #[test]
    fn test_scripted_answers_come_first() {
        let fp = Fingerprint::of_bytes(b"abc");
        let remote = MockRemote::new()
            .with_known_verdict(&fp, RemoteVerdict::new(Classification::Malicious, 80))
            .with_scripted_query(&fp, Err(RemoteError::Throttled));
        assert_eq!(remote.query(&fp), Err(RemoteError::Throttled));
        match remote.query(&fp) {
            Ok(QueryStatus::Resolved(v)) => assert_eq!(v.score, 80),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_archive_pages() {
        let fp = Fingerprint::of_bytes(b"zip");
        let members = (0..7)
            .map(|i| ArchiveMemberResult {
                path: format!("f{i}"),
                classification: Classification::Benign,
                score: 0,
                family: None,
                extra: None,
                error: None,
            })
            .collect();
        let remote = MockRemote::new().with_archive(&fp, members);
        assert_eq!(remote.list_archive_members(&fp, 1, 5).unwrap().len(), 5);
        assert_eq!(remote.list_archive_members(&fp, 2, 5).unwrap().len(), 2);
        assert_eq!(remote.page_requests(), vec![(1, 5, 5), (2, 5, 2)]);
    }

    #[test]
    fn test_upload_target_reports_stored_content() {
        let fp = Fingerprint::of_bytes(b"stored");
        let remote = MockRemote::new();
        assert!(!remote.request_upload_target(&fp, 6).unwrap().already_present);
        let target = remote.request_upload_target(&fp, 6).unwrap();
        remote.upload(&target, b"stored").unwrap();
        assert!(remote.request_upload_target(&fp, 6).unwrap().already_present);
        assert_eq!(remote.upload_count(), 1);
    }

    #[test]
    fn test_scripted_failures_are_one_shot() {
        let fp = Fingerprint::of_bytes(b"once");
        let remote = MockRemote::new()
            .with_scripted_failure(MockCall::Register, RemoteError::Throttled)
            .with_scripted_failure(MockCall::Register, RemoteError::Transport("reset".into()));
        assert_eq!(remote.register(&request(&fp)), Err(RemoteError::Throttled));
        assert!(matches!(remote.register(&request(&fp)), Err(RemoteError::Transport(_))));
        assert_eq!(remote.register(&request(&fp)), Ok(()));
        assert_eq!(remote.call_count(MockCall::Register), 3);
        assert_eq!(remote.registrations().len(), 1);
        assert_eq!(remote.call_count(MockCall::Upload), 0);
    }

    #[test]
    fn test_default_verdict_and_latency() {
        let fp = Fingerprint::of_bytes(b"family");
        let remote = MockRemote::new()
            .with_latency(Duration::from_millis(20))
            .with_default_verdict(RemoteVerdict::new(Classification::Malicious, 99).with_family("trojan"));
        remote.register(&request(&fp)).unwrap();

        let started = Instant::now();
        match remote.query(&fp) {
            Ok(QueryStatus::Resolved(v)) => {
                assert_eq!(v.classification, Classification::Malicious);
                assert_eq!(v.family.as_deref(), Some("trojan"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_failing_connector() {
        let connector = MockConnector::failing(DetectError::InvalidConfig("bad".into()));
        let opts = ClientOptions::resolve(&crate::config::DetectorConfig::default(), None);
        assert!(connector.connect(&Credentials::new("a", "b"), &opts).is_err());
        assert!(connector.connections().is_empty());
    }
}
