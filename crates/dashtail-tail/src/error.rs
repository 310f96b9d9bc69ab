//! Tail controller error types

use dashtail_stream::StreamError;
use dashtail_types::ConnectionState;
use thiserror::Error;

use crate::state::TailEvent;

/// Errors returned by the live tail controller
#[derive(Debug, Error)]
pub enum TailError {
    #[error("A query is required to start a live tail")]
    MissingQuery,

    #[error("A datasource must be selected to start a live tail")]
    MissingDatasource,

    #[error("A live tail is already running")]
    AlreadyRunning,

    #[error("{0}")]
    Validation(#[source] StreamError),

    #[error("Invalid transition from {from} on {event:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: TailEvent,
    },
}
