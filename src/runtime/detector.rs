//! The detector facade: lifecycle, admission control and submission.
//!
//! A [`Detector`] owns one worker pool and one remote client while initialized.
//! Every submission is validated, assigned a [`SequenceId`] and admitted only
//! while fewer than `max_queued_tasks` tasks are in the system. A task counts as
//! admitted from submission until its result is delivered, whether it is queued,
//! deferred, or running.
//!
//! All scheduler state sits behind one mutex. The mutex is never held while
//! user callbacks run or while the pool is being joined, because tasks release
//! their admission slot through the same mutex.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{DecompressPolicy, DetectorConfig};
use crate::core::{
    DetectError, DetectResult, Fingerprint, PoolStats, ResultCallback, ScanTask, SequenceGenerator,
    SequenceId, TaskLifecycle, TaskRequest, TaskSettings, WorkQueue, WorkerPool,
};
use crate::remote::{ClientOptions, Credentials, RemoteConnector, RemoteService};
use crate::util::clock;

/// Poll granularity of the backpressure helpers.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of a backpressure wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited condition holds.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
}

/// Pool and client owned while initialized.
struct Runtime {
    pool: Arc<WorkerPool<ScanTask>>,
    remote: Arc<dyn RemoteService>,
    admission: Arc<dyn TaskLifecycle>,
}

struct State {
    initialized: bool,
    /// Admitted, undelivered tasks.
    alive: usize,
    /// Bumped on every `init`; stale tasks from an earlier run do not touch `alive`.
    generation: u64,
    seq: SequenceGenerator,
    config: DetectorConfig,
    decompress: DecompressPolicy,
    runtime: Option<Runtime>,
}

impl State {
    const fn depth(&self) -> usize {
        if self.initialized {
            self.alive
        } else {
            0
        }
    }
}

/// Releases admission slots for the tasks of one `init` generation.
struct Admission {
    state: Weak<Mutex<State>>,
    generation: u64,
}

impl TaskLifecycle for Admission {
    fn on_task_end(&self, seq: SequenceId) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock();
        if state.generation == self.generation {
            state.alive = state.alive.saturating_sub(1);
            trace!(seq = %seq, alive = state.alive, "admission slot released");
        }
    }
}

/// Scheduler for remote detection requests.
///
/// Owned by the caller; dropping it shuts the worker pool down.
pub struct Detector {
    state: Arc<Mutex<State>>,
    connector: Box<dyn RemoteConnector>,
}

impl Detector {
    /// Create an uninitialized detector.
    pub fn new(config: DetectorConfig, connector: impl RemoteConnector + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                initialized: false,
                alive: 0,
                generation: 0,
                seq: SequenceGenerator::new(),
                config,
                decompress: DecompressPolicy::default(),
                runtime: None,
            })),
            connector: Box::new(connector),
        }
    }

    /// Connect to the service and start the worker pool.
    ///
    /// # Errors
    ///
    /// - `AlreadyInitialized` if called twice without `uninit`
    /// - `InvalidConfig` if the configuration is invalid or the pool cannot start
    /// - whatever the connector reports if the client cannot be built
    pub fn init(&self, credentials: &Credentials, region: Option<&str>) -> Result<(), DetectError> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(DetectError::AlreadyInitialized);
        }
        state.config.validate().map_err(DetectError::InvalidConfig)?;

        let options = ClientOptions::resolve(&state.config, region);
        let remote = self.connector.connect(credentials, &options)?;

        let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(state.config.pool_size), None)
            .map_err(|e| DetectError::InvalidConfig(e.to_string()))?;
        pool.set_rejection_handler(Arc::new(ScanTask::abort));
        pool.prestart_all()
            .map_err(|e| DetectError::InvalidConfig(e.to_string()))?;

        state.generation += 1;
        let admission: Arc<dyn TaskLifecycle> = Arc::new(Admission {
            state: Arc::downgrade(&self.state),
            generation: state.generation,
        });
        state.alive = 0;
        state.seq.reset();
        state.runtime = Some(Runtime {
            pool: Arc::new(pool),
            remote,
            admission,
        });
        state.initialized = true;

        info!(
            region = %options.region,
            endpoint = ?options.endpoint,
            pool_size = state.config.pool_size,
            max_queued_tasks = state.config.max_queued_tasks,
            "detector initialized"
        );
        Ok(())
    }

    /// Stop accepting work, abort queued tasks and join the workers.
    ///
    /// No-op when not initialized.
    pub fn uninit(&self) {
        let runtime = {
            let mut state = self.state.lock();
            if !state.initialized {
                return;
            }
            state.initialized = false;
            state.runtime.take()
        };
        if let Some(runtime) = runtime {
            runtime.pool.shutdown(true);
            let stats = runtime.pool.stats();
            info!(
                steps = stats.steps,
                rejected = stats.rejected,
                panicked = stats.panicked,
                "detector shut down"
            );
        }
    }

    /// Whether the detector is running.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Replace the configuration.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` while running, `InvalidConfig` if `config` is invalid.
    pub fn set_config(&self, config: DetectorConfig) -> Result<(), DetectError> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(DetectError::AlreadyInitialized);
        }
        config.validate().map_err(DetectError::InvalidConfig)?;
        state.config = config;
        Ok(())
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> DetectorConfig {
        self.state.lock().config.clone()
    }

    /// Set the decompression policy applied to subsequent submissions.
    ///
    /// # Errors
    ///
    /// `NotInitialized` when the detector is not running.
    pub fn set_decompress_policy(&self, policy: DecompressPolicy) -> Result<(), DetectError> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(DetectError::NotInitialized);
        }
        state.decompress = policy;
        Ok(())
    }

    /// Decompression policy applied to new submissions.
    #[must_use]
    pub fn decompress_policy(&self) -> DecompressPolicy {
        self.state.lock().decompress
    }

    /// Worker pool statistics, while initialized.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        let pool = self
            .state
            .lock()
            .runtime
            .as_ref()
            .map(|rt| Arc::clone(&rt.pool))?;
        Some(pool.stats())
    }

    /// Submit a local file. The result goes to `callback`, exactly once.
    ///
    /// `timeout_ms < 0` means no deadline. Submissions rejected before admission
    /// also reach `callback`, and are returned as the error.
    ///
    /// # Errors
    ///
    /// `FileNotFound`, `NotInitialized` or `QueueFull`.
    pub fn detect_file<F>(
        &self,
        path: impl AsRef<Path>,
        timeout_ms: i64,
        callback: F,
    ) -> Result<SequenceId, DetectError>
    where
        F: FnOnce(DetectResult) + Send + 'static,
    {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                let request = TaskRequest::local_file(path, meta.len()).with_timeout_ms(timeout_ms);
                self.submit(request, Box::new(callback))
            }
            _ => {
                let err = DetectError::FileNotFound {
                    path: path.display().to_string(),
                };
                Self::reject(&TaskRequest::local_file(path, 0), None, err, Box::new(callback))
            }
        }
    }

    /// Submit a remote resource identified by its caller-supplied fingerprint.
    ///
    /// # Errors
    ///
    /// `InvalidFingerprint`, `InvalidUrl`, `NotInitialized` or `QueueFull`.
    pub fn detect_url<F>(
        &self,
        url: &str,
        fingerprint: &str,
        timeout_ms: i64,
        callback: F,
    ) -> Result<SequenceId, DetectError>
    where
        F: FnOnce(DetectResult) + Send + 'static,
    {
        let callback: ResultCallback = Box::new(callback);
        let fingerprint = match Fingerprint::parse(fingerprint) {
            Ok(fp) => fp,
            Err(err) => {
                let request = TaskRequest {
                    source: crate::core::Source::RemoteUrl { url: url.to_string() },
                    fingerprint: None,
                    deadline: None,
                    decompress: DecompressPolicy::default(),
                };
                return Self::reject(&request, None, err, callback);
            }
        };
        let request = TaskRequest::remote_url(url, fingerprint).with_timeout_ms(timeout_ms);
        if let Err(err) = validate_url(url) {
            return Self::reject(&request, None, err, callback);
        }
        self.submit(request, callback)
    }

    /// Submit a local file and block until its result is ready.
    pub fn detect_file_sync(&self, path: impl AsRef<Path>, timeout_ms: i64) -> DetectResult {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let path = path.as_ref();
        let _ = self.detect_file(path, timeout_ms, move |result| {
            let _ = tx.send(result);
        });
        rx.recv()
            .unwrap_or_else(|_| lost_result(&TaskRequest::local_file(path, 0)))
    }

    /// Submit a remote resource and block until its result is ready.
    pub fn detect_url_sync(&self, url: &str, fingerprint: &str, timeout_ms: i64) -> DetectResult {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = self.detect_url(url, fingerprint, timeout_ms, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or_else(|_| lost_url_result(url))
    }

    /// Submit a local file and await its result.
    #[cfg(feature = "tokio-runtime")]
    pub async fn detect_file_async(&self, path: impl AsRef<Path>, timeout_ms: i64) -> DetectResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let path = path.as_ref().to_path_buf();
        let _ = self.detect_file(&path, timeout_ms, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or_else(|_| lost_result(&TaskRequest::local_file(path, 0)))
    }

    /// Submit a remote resource and await its result.
    #[cfg(feature = "tokio-runtime")]
    pub async fn detect_url_async(&self, url: &str, fingerprint: &str, timeout_ms: i64) -> DetectResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = self.detect_url(url, fingerprint, timeout_ms, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or_else(|_| lost_url_result(url))
    }

    /// Number of admitted, undelivered tasks. 0 when not initialized.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.state.lock().depth()
    }

    /// Wait until another task can be admitted. `timeout_ms < 0` waits forever.
    pub fn wait_until_available(&self, timeout_ms: i64) -> WaitStatus {
        self.wait_until(timeout_ms, |state| state.depth() < state.config.max_queued_tasks)
    }

    /// Wait until no task is in the system. `timeout_ms < 0` waits forever.
    pub fn wait_until_empty(&self, timeout_ms: i64) -> WaitStatus {
        self.wait_until(timeout_ms, |state| state.depth() == 0)
    }

    fn wait_until<F>(&self, timeout_ms: i64, ready: F) -> WaitStatus
    where
        F: Fn(&State) -> bool,
    {
        let deadline = clock::timeout_from_ms(timeout_ms).map(|t| Instant::now() + t);
        loop {
            if ready(&*self.state.lock()) {
                return WaitStatus::Ready;
            }
            let pause = match deadline {
                None => WAIT_POLL_INTERVAL,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitStatus::TimedOut;
                    }
                    WAIT_POLL_INTERVAL.min(deadline - now)
                }
            };
            thread::sleep(pause);
        }
    }

    /// Admit a validated request.
    fn submit(&self, request: TaskRequest, callback: ResultCallback) -> Result<SequenceId, DetectError> {
        let (task, pool) = {
            let mut state = self.state.lock();
            let handles = state.runtime.as_ref().filter(|_| state.initialized).map(|rt| {
                (
                    Arc::clone(&rt.pool),
                    Arc::clone(&rt.remote),
                    Arc::clone(&rt.admission),
                )
            });
            let Some((pool, remote, admission)) = handles else {
                drop(state);
                return Self::reject(&request, None, DetectError::NotInitialized, callback);
            };

            let seq = state.seq.next_id();
            if state.alive >= state.config.max_queued_tasks {
                warn!(
                    seq = %seq,
                    alive = state.alive,
                    max = state.config.max_queued_tasks,
                    "queue full, submission rejected"
                );
                drop(state);
                return Self::reject(&request, Some(seq), DetectError::QueueFull, callback);
            }
            state.alive += 1;

            let request = request.with_decompress(state.decompress);
            let settings = TaskSettings::from(&state.config);
            debug!(seq = %seq, source = %request.source.reference(), alive = state.alive, "task admitted");
            let task = ScanTask::new(seq, request, settings, remote, callback).with_lifecycle(admission);
            (task, pool)
        };
        let seq = task.seq();
        pool.execute(task);
        Ok(seq)
    }

    /// Deliver an immediate rejection to `callback` and return it.
    fn reject(
        request: &TaskRequest,
        seq: Option<SequenceId>,
        err: DetectError,
        callback: ResultCallback,
    ) -> Result<SequenceId, DetectError> {
        debug!(source = %request.source.reference(), error = %err, "submission rejected");
        callback(DetectResult {
            seq,
            source: request.source.reference(),
            fingerprint: request.fingerprint.clone(),
            elapsed_ms: 0,
            outcome: Err(err.clone()),
        });
        Err(err)
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.uninit();
    }
}

/// Accept only absolute URLs with a host.
fn validate_url(raw: &str) -> Result<(), DetectError> {
    match url::Url::parse(raw) {
        Ok(parsed) if parsed.has_host() => Ok(()),
        _ => Err(DetectError::InvalidUrl(raw.to_string())),
    }
}

fn lost_result(request: &TaskRequest) -> DetectResult {
    DetectResult {
        seq: None,
        source: request.source.reference(),
        fingerprint: None,
        elapsed_ms: 0,
        outcome: Err(DetectError::Aborted),
    }
}

fn lost_url_result(url: &str) -> DetectResult {
    DetectResult {
        seq: None,
        source: crate::core::SourceRef::RemoteUrl(url.to_string()),
        fingerprint: None,
        elapsed_ms: 0,
        outcome: Err(DetectError::Aborted),
    }
}
