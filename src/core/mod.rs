//! Core scheduling abstractions: queue, worker pool, task state machine and the
//! result model they deliver.

pub mod error;
pub mod fingerprint;
pub mod result;
pub mod sequence;
pub mod task;
pub mod work_queue;
pub mod worker_pool;

pub use error::{ApiDiagnostic, DetectError};
pub use fingerprint::Fingerprint;
pub use result::{ArchiveMemberResult, Classification, DetectResult, ResultStatus, SourceRef, Verdict};
pub use sequence::{SequenceGenerator, SequenceId};
pub use task::{ResultCallback, ScanTask, Source, TaskLifecycle, TaskRequest, TaskSettings};
pub use work_queue::{Dispatch, WorkQueue};
pub use worker_pool::{Job, PoolError, PoolStats, RejectionHandler, Step, WorkerPool};
