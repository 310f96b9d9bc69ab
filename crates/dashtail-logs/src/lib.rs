//! Log buffering for dashtail
//!
//! This crate provides the deduplicating, bounded record buffer a live tail
//! session writes into and the rendering layer reads from.

mod buffer;

pub use buffer::{ArcLogRecord, DEFAULT_MAX_RECORDS, LevelCounts, LogBuffer, RECENT_WINDOW};

// Re-export types used in our public API
pub use dashtail_types::{LogLevel, LogRecord, RecordKey};
