//! Live tail controller for dashtail
//!
//! This crate drives a live tail: validation query, stream attempts,
//! reconnects with backoff and resume overlap, and the status view.

mod backoff;
mod controller;
mod error;
mod session;
mod state;

pub use backoff::{MAX_DELAY, RESUME_OVERLAP_SECS, backoff_delay, resume_point};
pub use controller::{LiveTail, TailConfig};
pub use error::TailError;
pub use session::TailStatus;
pub use state::{TailEvent, TailState};

// Re-export types used in our public API
pub use dashtail_logs::{ArcLogRecord, LogBuffer};
pub use dashtail_types::{ConnectionState, LogRecord, TailTarget};
