//! One running tail session: stream attempts, reconnects and status publishing

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use dashtail_logs::{ArcLogRecord, LogBuffer};
use dashtail_stream::{LogBackend, StreamError, StreamHandler};
use dashtail_types::{ConnectionState, LogRecord, StreamRequest, TailTarget};

use crate::backoff::resume_point;
use crate::state::{TailEvent, TailState};

/// Read view of the controller's status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TailStatus {
    pub state: ConnectionState,

    /// Reconnect cycles since the last `connected` status
    pub attempt: u32,

    /// Last surfaced error, kept while connecting or reconnecting
    pub last_error: Option<String>,

    /// Delay until the next reconnect, while reconnecting
    pub retry_in: Option<Duration>,

    /// Identity of the session that owns this status
    pub session: Option<u64>,
}

/// Status channel shared by the controller and its session task
///
/// Only the current session may publish; output from a stopped session is
/// dropped.
pub(crate) struct StatusHub {
    current: Mutex<Option<u64>>,
    tx: watch::Sender<TailStatus>,
}

impl StatusHub {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<TailStatus>) {
        let (tx, rx) = watch::channel(TailStatus::default());
        let hub = Arc::new(Self {
            current: Mutex::new(None),
            tx,
        });
        (hub, rx)
    }

    /// Make `session` the owner and publish its first state
    pub(crate) fn begin(&self, session: u64, state: TailState) {
        let mut current = self.current.lock();
        *current = Some(session);
        self.tx.send_modify(|status| {
            status.state = state.connection_state();
            status.attempt = state.attempt();
            status.retry_in = None;
            status.session = Some(session);
        });
    }

    /// Drop ownership and go idle
    pub(crate) fn end(&self, preserve_error: bool) {
        let mut current = self.current.lock();
        *current = None;
        self.tx.send_modify(|status| {
            status.state = ConnectionState::Idle;
            status.attempt = 0;
            status.retry_in = None;
            status.session = None;
            if !preserve_error {
                status.last_error = None;
            }
        });
    }

    /// Show `state` while no session owns the status yet
    pub(crate) fn announce(&self, state: TailState) {
        let current = self.current.lock();
        if current.is_some() {
            return;
        }
        self.tx.send_modify(|status| {
            status.state = state.connection_state();
            status.attempt = state.attempt();
            status.retry_in = None;
        });
    }

    /// Go idle outside of any session, surfacing `message`
    pub(crate) fn end_with_error(&self, message: String) {
        let mut current = self.current.lock();
        *current = None;
        self.tx.send_modify(|status| {
            status.state = ConnectionState::Idle;
            status.attempt = 0;
            status.retry_in = None;
            status.session = None;
            status.last_error = Some(message);
        });
    }

    /// Run `f` only while `session` owns the status
    ///
    /// The ownership lock is held for the duration of `f`.
    pub(crate) fn while_current<F>(&self, session: u64, f: F) -> bool
    where
        F: FnOnce(),
    {
        let current = self.current.lock();
        if *current != Some(session) {
            return false;
        }
        f();
        true
    }

    /// Update the status if `session` still owns it
    fn publish<F>(&self, session: u64, update: F) -> bool
    where
        F: FnOnce(&mut TailStatus),
    {
        let current = self.current.lock();
        if *current != Some(session) {
            trace!(session, "publish: stale session, dropping update");
            return false;
        }
        self.tx.send_modify(update);
        true
    }

    fn publish_state(&self, session: u64, state: TailState) {
        self.publish(session, |status| {
            status.state = state.connection_state();
            status.attempt = state.attempt();
            status.retry_in = state.retry_delay();
        });
    }

    pub(crate) fn snapshot(&self) -> TailStatus {
        self.tx.borrow().clone()
    }
}

/// Everything a session task owns
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) target: TailTarget,
    pub(crate) limit: usize,
    pub(crate) backend: Arc<dyn LogBackend>,
    pub(crate) buffer: LogBuffer,
    pub(crate) hub: Arc<StatusHub>,
    pub(crate) cancel: CancellationToken,
    pub(crate) records_tx: Option<mpsc::UnboundedSender<ArcLogRecord>>,
}

/// Stream callbacks of one attempt, applied to the session
struct SessionHandler<'a> {
    session: &'a Session,
    state: TailState,
    /// An `error` frame set `last_error` during this attempt
    surfaced_error: bool,
}

impl StreamHandler for SessionHandler<'_> {
    fn on_record(&mut self, record: LogRecord) {
        if self.session.cancel.is_cancelled() {
            return;
        }
        let forwarded = self.session.records_tx.as_ref().map(|_| Arc::new(record.clone()));
        if !self.session.buffer.accept(record) {
            return;
        }
        if let (Some(tx), Some(record)) = (&self.session.records_tx, forwarded) {
            let sent = self.session.hub.while_current(self.session.id, || {
                let _ = tx.send(record);
            });
            if !sent {
                trace!(session = self.session.id, "on_record: stale session, not forwarded");
            }
        }
    }

    fn on_heartbeat(&mut self) {
        trace!(session = self.session.id, "heartbeat");
    }

    fn on_status(&mut self, status: &str, message: Option<&str>) {
        if self.session.cancel.is_cancelled() {
            return;
        }
        if status == "connected" {
            match self.state.transition(TailEvent::Connected) {
                Ok(next) => {
                    self.state = next;
                    self.surfaced_error = false;
                    info!(session = self.session.id, "live tail connected");
                    self.session.hub.publish(self.session.id, |s| {
                        s.state = ConnectionState::Connected;
                        s.attempt = 0;
                        s.retry_in = None;
                        s.last_error = None;
                    });
                }
                Err(e) => warn!(error = %e, "on_status: ignoring connected"),
            }
            return;
        }

        // Unknown statuses are informational
        debug!(session = self.session.id, status, "on_status: informational");
        if let Some(message) = message {
            let message = message.to_string();
            self.session
                .hub
                .publish(self.session.id, |s| s.last_error = Some(message));
        }
    }

    fn on_error(&mut self, message: &str) {
        if self.session.cancel.is_cancelled() {
            return;
        }
        warn!(session = self.session.id, error = message, "stream error");
        let message = message.to_string();
        self.surfaced_error = self
            .session
            .hub
            .publish(self.session.id, |s| s.last_error = Some(message));
    }
}

impl Session {
    /// Run stream attempts until cancelled or a fatal error
    pub(crate) async fn run(self) {
        let mut state = TailState::Connecting { attempt: 0 };

        loop {
            let request = StreamRequest {
                query: self.target.trimmed_query().to_string(),
                start: resume_point(self.buffer.last_seen_timestamp(), unix_now()),
                limit: self.limit,
            };
            debug!(
                session = self.id,
                start = request.start,
                attempt = state.attempt(),
                "run: opening stream"
            );
            self.hub.publish_state(self.id, state);

            let mut handler = SessionHandler {
                session: &self,
                state,
                surfaced_error: false,
            };
            let result = self
                .backend
                .open_stream(&self.target, &request, &mut handler, &self.cancel)
                .await;
            state = handler.state;
            let surfaced_error = handler.surfaced_error;

            if self.cancel.is_cancelled() {
                debug!(session = self.id, "run: cancelled");
                return;
            }

            let err = match result {
                Ok(()) => return,
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(session = self.id, error = %err, "run: fatal stream error");
                self.fail(&err);
                return;
            }

            state = match state.transition(TailEvent::Dropped) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "run: unexpected state");
                    return;
                }
            };
            let delay = state.retry_delay().unwrap_or_default();
            warn!(
                session = self.id,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "run: reconnecting"
            );

            // An error frame's reason outranks the disconnect that follows it
            let message = (!surfaced_error).then(|| err.to_string());
            self.hub.publish(self.id, |s| {
                s.state = state.connection_state();
                s.attempt = state.attempt();
                s.retry_in = Some(delay);
                if let Some(message) = message {
                    s.last_error = Some(message);
                }
            });

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(session = self.id, "run: cancelled during backoff");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            state = match state.transition(TailEvent::RetryElapsed) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "run: unexpected state");
                    return;
                }
            };
        }
    }

    fn fail(&self, err: &StreamError) {
        let message = err.to_string();
        self.hub.publish(self.id, |s| {
            s.state = ConnectionState::Idle;
            s.attempt = 0;
            s.retry_in = None;
            s.last_error = Some(message);
        });
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
