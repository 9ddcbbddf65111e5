pub mod clock;
pub mod telemetry;

pub use clock::{elapsed_ms, timeout_from_ms};
pub use telemetry::init_tracing;
