//! Configuration models for the detector and decompression.

pub mod detector;

pub use detector::{DecompressPolicy, DetectorConfig, Endpoint, DEFAULT_REGION};
