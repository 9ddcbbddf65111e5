//! The detector facade and its submission API.

pub mod detector;

pub use detector::{Detector, WaitStatus, WAIT_POLL_INTERVAL};
