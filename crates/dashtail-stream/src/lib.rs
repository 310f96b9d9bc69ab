//! Event stream transport for dashtail
//!
//! This crate provides frame parsing, incremental body decoding, the streaming
//! HTTP transport and the backend seam the tail controller talks to.

mod backend;
mod decoder;
mod error;
mod parser;
mod transport;

pub use backend::{BackendConfig, DEFAULT_BACKEND_URL, HttpBackend, LogBackend};
pub use decoder::FrameReader;
pub use error::StreamError;
pub use parser::FrameParser;
pub use transport::{
    MALFORMED_PAYLOAD, STREAM_FAILED, StreamHandler, StreamTransport, dispatch_frame, pump,
};

// Re-export types used in our public API
pub use dashtail_types::{LogRecord, QueryRequest, StreamFrame, StreamRequest, TailTarget};
