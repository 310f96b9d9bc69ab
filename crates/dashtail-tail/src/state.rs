//! Connection state machine of a live tail

use std::time::Duration;

use dashtail_types::ConnectionState;

use crate::backoff::backoff_delay;
use crate::error::TailError;

/// State of one live tail, with the data each state needs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TailState {
    #[default]
    Idle,
    /// Opening a stream; `attempt` reconnect cycles happened since the last
    /// `connected` status
    Connecting { attempt: u32 },
    Connected,
    /// Waiting `delay` before reopening
    Reconnecting { attempt: u32, delay: Duration },
}

/// Inputs to the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailEvent {
    /// `start()` was called
    Open,
    /// The backend reported `connected`
    Connected,
    /// The stream ended or failed without cancellation
    Dropped,
    /// The backoff delay passed
    RetryElapsed,
    /// `stop()` was called or the session hit a fatal error
    Stop,
}

impl TailState {
    /// Apply `event`, rejecting transitions the machine does not have
    pub fn transition(self, event: TailEvent) -> Result<TailState, TailError> {
        let next = match (self, event) {
            (_, TailEvent::Stop) => TailState::Idle,
            (TailState::Idle, TailEvent::Open) => TailState::Connecting { attempt: 0 },
            (TailState::Connecting { .. } | TailState::Connected, TailEvent::Connected) => {
                TailState::Connected
            }
            (TailState::Connecting { attempt }, TailEvent::Dropped) => TailState::Reconnecting {
                attempt: attempt.saturating_add(1),
                delay: backoff_delay(attempt),
            },
            (TailState::Connected, TailEvent::Dropped) => TailState::Reconnecting {
                attempt: 1,
                delay: backoff_delay(0),
            },
            (TailState::Reconnecting { attempt, .. }, TailEvent::RetryElapsed) => {
                TailState::Connecting { attempt }
            }
            (from, event) => {
                return Err(TailError::InvalidTransition {
                    from: from.connection_state(),
                    event,
                });
            }
        };
        Ok(next)
    }

    /// Externally visible connection state
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            TailState::Idle => ConnectionState::Idle,
            TailState::Connecting { .. } => ConnectionState::Connecting,
            TailState::Connected => ConnectionState::Connected,
            TailState::Reconnecting { .. } => ConnectionState::Reconnecting,
        }
    }

    /// Reconnect cycles since the last `connected` status
    pub fn attempt(&self) -> u32 {
        match self {
            TailState::Connecting { attempt } | TailState::Reconnecting { attempt, .. } => *attempt,
            TailState::Idle | TailState::Connected => 0,
        }
    }

    /// Pending reconnect delay, if waiting to reconnect
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            TailState::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}
