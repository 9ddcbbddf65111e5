//! # Detect Lot
//!
//! A bounded-concurrency scheduler for submitting files and remote resources to an
//! external malware detection service.
//!
//! Remote detection is slow: a sample has to be fingerprinted, looked up, possibly
//! uploaded, registered and then polled until the service produces a verdict. Spawning
//! one thread per pending sample does not scale, so this crate drives every request as
//! a small state machine that a fixed pool of worker threads advances one step at a
//! time.
//!
//! ## Key Features
//!
//! - **Fixed Worker Pool**: `N` persistent OS threads drain one shared work queue
//! - **Admission Control**: Submissions beyond the configured maximum fail fast with `QueueFull`
//! - **Self-Requeuing Tasks**: A task that is waiting on the remote side goes back to the queue
//! - **Rate-Limited Polling**: Per-task minimum poll interval and throttling backoff
//! - **Deadlines**: Per-task deadlines distinguish queue congestion from remote slowness
//! - **Archive Fan-Out**: Paginated per-member results for container files
//!
//! ## Usage
//!
//! ```rust,ignore
//! use detect_lot::config::DetectorConfig;
//! use detect_lot::remote::{Credentials, MockConnector};
//! use detect_lot::runtime::Detector;
//!
//! let detector = Detector::new(DetectorConfig::new().with_pool_size(8), MockConnector::default());
//! detector.init(&Credentials::new("key-id", "key-secret"), None)?;
//!
//! // Blocking API
//! let result = detector.detect_file_sync("/tmp/sample.bin", 60_000);
//! println!("{:?}", result.outcome);
//!
//! // Callback API with backpressure
//! detector.wait_until_available(-1);
//! let seq = detector.detect_file("/tmp/other.bin", 60_000, |res| println!("{res:?}"))?;
//!
//! detector.wait_until_empty(-1);
//! detector.uninit();
//! ```
//!
//! For complete examples, see:
//! - `tests/detector_test.rs` - End-to-end scheduling against a mocked service
//! - `tests/worker_pool_test.rs` - Queue and pool shutdown semantics

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Work queue, worker pool, task state machine and result model.
pub mod core;
/// Configuration models for the detector and decompression.
pub mod config;
/// Remote detection service boundary.
pub mod remote;
/// The detector facade and submission API.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use crate::config::{DecompressPolicy, DetectorConfig};
pub use crate::core::{DetectError, DetectResult, SequenceId};
pub use crate::runtime::{Detector, WaitStatus};
