use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dashtail_logs::{ArcLogRecord, DEFAULT_MAX_RECORDS, LogBuffer};
use dashtail_stream::LogBackend;
use dashtail_types::{LogRecord, QueryRequest, TailTarget};

use crate::error::TailError;
use crate::session::{Session, StatusHub, TailStatus};
use crate::state::{TailEvent, TailState};

/// Default backfill limit per stream (re)connect
const DEFAULT_STREAM_LIMIT: usize = 200;

/// Default window of the validation query
const DEFAULT_LOOKBACK: Duration = Duration::from_secs(60 * 60);

/// Default row limit of the validation query
const DEFAULT_VALIDATION_LIMIT: usize = 500;

/// Live tail settings
#[derive(Clone, Debug)]
pub struct TailConfig {
    /// Backfill limit sent with each stream request
    pub limit: usize,

    /// Maximum retained records per session
    pub max_records: usize,

    /// Run a one-shot query before the first stream of a target
    pub validate: bool,

    /// Window of the validation query
    pub lookback: Duration,

    pub validation_limit: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_STREAM_LIMIT,
            max_records: DEFAULT_MAX_RECORDS,
            validate: true,
            lookback: DEFAULT_LOOKBACK,
            validation_limit: DEFAULT_VALIDATION_LIMIT,
        }
    }
}

/// A running session as seen by the controller
struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    buffer: LogBuffer,
}

/// Controller of a live tail against one target
pub struct LiveTail {
    backend: Arc<dyn LogBackend>,
    config: TailConfig,
    target: TailTarget,

    hub: Arc<StatusHub>,
    status_rx: watch::Receiver<TailStatus>,

    session: Option<ActiveSession>,
    next_session: u64,

    /// Records of the current target kept from a validation query or a
    /// stopped session
    results: Option<Vec<LogRecord>>,

    records_tx: Option<mpsc::UnboundedSender<ArcLogRecord>>,
}

impl LiveTail {
    /// Create a controller with no target selected
    pub fn new(backend: Arc<dyn LogBackend>, config: TailConfig) -> Self {
        let (hub, status_rx) = StatusHub::new();
        Self {
            backend,
            config,
            target: TailTarget::default(),
            hub,
            status_rx,
            session: None,
            next_session: 1,
            results: None,
            records_tx: None,
        }
    }

    /// Forward every newly accepted record to `tx`, in arrival order
    pub fn set_record_sink(&mut self, tx: mpsc::UnboundedSender<ArcLogRecord>) {
        self.records_tx = Some(tx);
    }

    /// Current status
    pub fn status(&self) -> TailStatus {
        self.hub.snapshot()
    }

    /// Receiver notified on every status change
    pub fn watch_status(&self) -> watch::Receiver<TailStatus> {
        self.status_rx.clone()
    }

    pub fn target(&self) -> &TailTarget {
        &self.target
    }

    /// Whether a session task is still running
    pub fn is_live(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Read view of the running session's buffer
    pub fn buffer(&self) -> Option<LogBuffer> {
        self.session.as_ref().map(|s| s.buffer.clone())
    }

    /// Records retained for the current target while no session runs
    pub fn results(&self) -> Option<&[LogRecord]> {
        self.results.as_deref()
    }

    /// Select a new query; stops a running tail but keeps its error visible
    ///
    /// The tail is not restarted.
    pub fn set_query(&mut self, query: impl Into<String>) {
        let query = query.into();
        if query == self.target.query {
            return;
        }
        if self.session.is_some() {
            info!("query changed, stopping live tail");
            self.stop(true);
        }
        self.results = None;
        self.target.query = query;
    }

    /// Select a new datasource; stops a running tail
    pub fn set_datasource(&mut self, datasource_id: impl Into<String>) {
        let datasource_id = datasource_id.into();
        if datasource_id == self.target.datasource_id {
            return;
        }
        if self.session.is_some() {
            info!("datasource changed, stopping live tail");
            self.stop(false);
        }
        self.results = None;
        self.target.datasource_id = datasource_id;
    }

    /// Start tailing the current target
    ///
    /// Runs the validation query first when the target has no results yet;
    /// its failure is returned and no stream is opened.
    pub async fn start(&mut self) -> Result<(), TailError> {
        self.reap_finished();
        if self.session.is_some() {
            return Err(TailError::AlreadyRunning);
        }
        if self.target.datasource_id.trim().is_empty() {
            return Err(TailError::MissingDatasource);
        }
        if self.target.trimmed_query().is_empty() {
            return Err(TailError::MissingQuery);
        }

        let state = TailState::Idle.transition(TailEvent::Open)?;

        let seed = match self.results.take() {
            Some(records) => records,
            None if self.config.validate => {
                self.hub.announce(state);
                match self.validate().await {
                    Ok(records) => records,
                    Err(e) => {
                        self.hub.end_with_error(e.to_string());
                        return Err(e);
                    }
                }
            }
            None => Vec::new(),
        };

        let id = self.next_session;
        self.next_session += 1;

        let buffer = LogBuffer::new(self.config.max_records);
        let seeded = buffer.seed(seed);
        let cancel = CancellationToken::new();

        self.hub.begin(id, state);
        info!(session = id, datasource = %self.target.datasource_id, seeded, "starting live tail");

        let session = Session {
            id,
            target: self.target.clone(),
            limit: self.config.limit,
            backend: Arc::clone(&self.backend),
            buffer: buffer.clone(),
            hub: Arc::clone(&self.hub),
            cancel: cancel.clone(),
            records_tx: self.records_tx.clone(),
        };
        let task = tokio::spawn(session.run());

        self.session = Some(ActiveSession {
            id,
            cancel,
            task,
            buffer,
        });
        Ok(())
    }

    async fn validate(&self) -> Result<Vec<LogRecord>, TailError> {
        let end = chrono::Utc::now().timestamp();
        let request = QueryRequest::logs(
            self.target.trimmed_query(),
            end,
            self.config.lookback.as_secs() as i64,
            self.config.validation_limit,
        );
        debug!(start = request.start, end = request.end, "validate: running query");

        self.backend
            .query_logs(&self.target, &request)
            .await
            .map_err(|e| {
                warn!(error = %e, "validate: query failed");
                TailError::Validation(e)
            })
    }

    /// Stop the live tail
    ///
    /// Cancels the in-flight stream and any pending reconnect. The surfaced
    /// error is cleared unless `preserve_error` is set.
    pub fn stop(&mut self, preserve_error: bool) {
        // Release ownership first so nothing from the session lands after this
        self.hub.end(preserve_error);
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.task.abort();
            debug!(session = session.id, "stop: session cancelled");

            self.results = Some(
                session
                    .buffer
                    .all()
                    .iter()
                    .map(|r| LogRecord::clone(r))
                    .collect(),
            );
            session.buffer.clear();
        }
    }

    /// Clean up a session whose task ended on its own (fatal error)
    fn reap_finished(&mut self) {
        if self.session.as_ref().is_some_and(|s| s.task.is_finished()) {
            self.stop(true);
        }
    }
}

impl Drop for LiveTail {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use dashtail_stream::{StreamError, StreamHandler, pump};
    use dashtail_types::{ConnectionState, StreamRequest};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    const BASE: i64 = 1_767_225_600;

    /// How one scripted stream attempt behaves
    enum Attempt {
        /// Deliver chunks, then close the body
        Close(Vec<String>),
        /// Deliver chunks, then stay open until cancelled
        Hang(Vec<String>),
        /// Fail before any body
        Fail(StreamError),
    }

    #[derive(Default)]
    struct ScriptedBackend {
        query: Mutex<Option<Result<Vec<LogRecord>, StreamError>>>,
        query_delay: Mutex<Option<Duration>>,
        queries: Mutex<usize>,
        attempts: Mutex<VecDeque<Attempt>>,
        calls: Mutex<Vec<(Instant, StreamRequest)>>,
    }

    impl ScriptedBackend {
        fn with_attempts(attempts: Vec<Attempt>) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(attempts.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<(Instant, StreamRequest)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl LogBackend for ScriptedBackend {
        async fn query_logs(
            &self,
            _target: &TailTarget,
            _request: &QueryRequest,
        ) -> Result<Vec<LogRecord>, StreamError> {
            *self.queries.lock() += 1;
            let delay = *self.query_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.query.lock().take().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn open_stream(
            &self,
            _target: &TailTarget,
            request: &StreamRequest,
            handler: &mut (dyn StreamHandler + Send),
            cancel: &CancellationToken,
        ) -> Result<(), StreamError> {
            self.calls.lock().push((Instant::now(), request.clone()));
            let attempt = self
                .attempts
                .lock()
                .pop_front()
                .unwrap_or(Attempt::Hang(Vec::new()));

            let (chunks, hang) = match attempt {
                Attempt::Close(chunks) => (chunks, false),
                Attempt::Hang(chunks) => (chunks, true),
                Attempt::Fail(e) => return Err(e),
            };
            let body = futures::stream::iter(chunks.into_iter().map(Ok::<String, std::io::Error>));
            if hang {
                pump(body.chain(futures::stream::pending()), handler, cancel, None).await
            } else {
                pump(body, handler, cancel, None).await
            }
        }
    }

    fn log_frame(secs: i64, line: &str) -> String {
        format!(
            "event: log\ndata: {{\"timestamp\":\"{}\",\"line\":\"{}\",\"level\":\"info\",\"labels\":{{}}}}\n\n",
            rfc3339_at(secs),
            line
        )
    }

    fn connected_frame() -> String {
        "event: status\ndata: {\"status\":\"connected\"}\n\n".to_string()
    }

    fn rfc3339_at(secs: i64) -> String {
        format!("2026-01-01T00:{:02}:{:02}Z", secs / 60, secs % 60)
    }

    fn record(secs: i64, line: &str) -> LogRecord {
        LogRecord::new(rfc3339_at(secs), line).with_level("info")
    }

    fn tail(backend: Arc<ScriptedBackend>, validate: bool) -> LiveTail {
        let mut tail = LiveTail::new(
            backend,
            TailConfig {
                validate,
                ..Default::default()
            },
        );
        tail.set_datasource("ds-1");
        tail.set_query("{app=\"api\"}");
        tail
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_connected_then_log() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Hang(vec![
            connected_frame(),
            log_frame(0, "hello"),
        ])]);
        let mut tail = tail(backend.clone(), false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tail.set_record_sink(tx);

        tail.start().await.unwrap();
        let received = rx.recv().await.unwrap();

        assert_eq!(received.line, "hello");
        assert_eq!(tail.buffer().unwrap().len(), 1);
        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.attempt, 0);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_growth_without_connected() {
        let mut attempts: Vec<Attempt> = (0..7)
            .map(|_| Attempt::Fail(StreamError::open_failed(502, "Bad Gateway")))
            .collect();
        attempts.push(Attempt::Hang(Vec::new()));
        let backend = ScriptedBackend::with_attempts(attempts);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| backend.calls().len() >= 8).await;

        let calls = backend.calls();
        let gaps: Vec<u128> = calls
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).as_millis())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 15000, 15000, 15000]);

        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.last_error.as_deref(), Some("Bad Gateway"));
        tail.stop(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_with_overlap() {
        let backend = ScriptedBackend::with_attempts(vec![
            Attempt::Close(vec![connected_frame(), log_frame(10, "a")]),
            Attempt::Hang(vec![connected_frame(), log_frame(10, "a"), log_frame(11, "b")]),
        ]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| backend.calls().len() >= 2).await;
        let buffer = tail.buffer().unwrap();
        wait_until(|| buffer.len() >= 2).await;

        let calls = backend.calls();
        assert_eq!(calls[1].1.start, BASE + 10 - 5);
        // Attempt counter was reset by the connected status
        assert_eq!((calls[1].0 - calls[0].0).as_millis(), 1000);
        // Overlapping record absorbed by dedup
        assert_eq!(buffer.len(), 2);
        assert_eq!(tail.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_stream_without_records_starts_near_now() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Hang(Vec::new())]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| !backend.calls().is_empty()).await;

        let start = backend.calls()[0].1.start;
        let expected = chrono::Utc::now().timestamp() - 5;
        assert!((start - expected).abs() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_silent() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Hang(vec![connected_frame()])]);
        let mut tail = tail(backend.clone(), false);
        let mut status_rx = tail.watch_status();

        tail.start().await.unwrap();
        wait_until(|| tail.status().state == ConnectionState::Connected).await;
        tail.stop(false);

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(backend.calls().len(), 1);
        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.last_error, None);
        assert!(!tail.is_live());
        assert!(status_rx.borrow_and_update().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_connecting_is_silent() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Hang(Vec::new())]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| !backend.calls().is_empty()).await;
        assert_eq!(tail.status().state, ConnectionState::Connecting);
        tail.stop(false);

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(backend.calls().len(), 1);
        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.last_error, None);
        assert!(!tail.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_frame_reason_kept_while_reconnecting() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Close(vec![
            connected_frame(),
            "event: error\ndata: {\"error\":\"failed to create datasource client: dial tcp\"}\n\n"
                .to_string(),
        ])]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| tail.status().state == ConnectionState::Reconnecting).await;

        let status = tail.status();
        assert_eq!(
            status.last_error.as_deref(),
            Some("failed to create datasource client: dial tcp")
        );
        assert_eq!(status.retry_in, Some(Duration::from_millis(1000)));
        tail.stop(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_shown_during_validation() {
        let backend = ScriptedBackend::with_attempts(Vec::new());
        *backend.query.lock() = Some(Err(StreamError::open_failed(
            400,
            r#"{"status":"error","error":"parse error"}"#,
        )));
        *backend.query_delay.lock() = Some(Duration::from_secs(5));
        let mut tail = tail(backend.clone(), true);
        let mut status_rx = tail.watch_status();

        let (result, seen) = tokio::join!(tail.start(), async {
            let status = status_rx
                .wait_for(|s| s.state == ConnectionState::Connecting)
                .await
                .unwrap()
                .clone();
            (status, backend.calls().len())
        });

        let (during, calls) = seen;
        assert_eq!(during.session, None);
        assert_eq!(calls, 0);
        assert!(result.is_err());
        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.last_error.as_deref(), Some("parse error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels_retry() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Close(Vec::new())]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| tail.status().state == ConnectionState::Reconnecting).await;
        assert_eq!(tail.status().retry_in, Some(Duration::from_millis(1000)));
        tail.stop(false);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.calls().len(), 1);
        assert_eq!(tail.status().state, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_surfaces_and_opens_nothing() {
        let backend = ScriptedBackend::with_attempts(Vec::new());
        *backend.query.lock() = Some(Err(StreamError::open_failed(
            400,
            r#"{"status":"error","error":"parse error"}"#,
        )));
        let mut tail = tail(backend.clone(), true);

        let err = tail.start().await.unwrap_err();

        assert!(matches!(err, TailError::Validation(_)));
        assert_eq!(err.to_string(), "parse error");
        assert!(!tail.is_live());
        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.last_error.as_deref(), Some("parse error"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_seeds_buffer_and_resume_point() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Hang(vec![
            connected_frame(),
            log_frame(20, "seeded"),
            log_frame(21, "fresh"),
        ])]);
        *backend.query.lock() = Some(Ok(vec![record(20, "seeded")]));
        let mut tail = tail(backend.clone(), true);

        tail.start().await.unwrap();
        let buffer = tail.buffer().unwrap();
        assert_eq!(buffer.len(), 1);
        wait_until(|| buffer.len() >= 2).await;

        assert_eq!(backend.calls()[0].1.start, BASE + 20 - 5);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reuses_results_without_query() {
        let backend = ScriptedBackend::with_attempts(Vec::new());
        *backend.query.lock() = Some(Ok(vec![record(1, "a")]));
        let mut tail = tail(backend.clone(), true);

        tail.start().await.unwrap();
        wait_until(|| !backend.calls().is_empty()).await;
        tail.stop(false);
        assert_eq!(tail.results().map(|r| r.len()), Some(1));

        tail.start().await.unwrap();
        assert_eq!(*backend.queries.lock(), 1);
        assert_eq!(tail.buffer().unwrap().len(), 1);
        tail.stop(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_change_stops_and_keeps_error() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Close(Vec::new())]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| tail.status().state == ConnectionState::Reconnecting).await;
        tail.set_query("{app=\"web\"}");

        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.last_error.as_deref(), Some("Live stream disconnected"));
        assert!(!tail.is_live());
        assert!(tail.results().is_none());

        // No automatic restart
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_datasource_change_clears_error() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Close(Vec::new())]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| tail.status().last_error.is_some()).await;
        tail.set_datasource("ds-2");

        assert_eq!(tail.status().last_error, None);
        assert_eq!(tail.target().datasource_id, "ds-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_unsupported_is_fatal() {
        let backend =
            ScriptedBackend::with_attempts(vec![Attempt::Fail(StreamError::StreamingUnsupported)]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| !tail.is_live()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(backend.calls().len(), 1);
        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(status.last_error.is_some());

        // A new start is allowed after the fatal stop
        tail.start().await.unwrap();
        wait_until(|| backend.calls().len() == 2).await;
        tail.stop(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_informational_status_and_error_frames() {
        let backend = ScriptedBackend::with_attempts(vec![Attempt::Hang(vec![
            connected_frame(),
            "event: status\ndata: {\"status\":\"degraded\",\"message\":\"lagging\"}\n\n".to_string(),
        ])]);
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        wait_until(|| tail.status().last_error.is_some()).await;

        let status = tail.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.last_error.as_deref(), Some("lagging"));
        tail.stop(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_target() {
        let backend = ScriptedBackend::with_attempts(Vec::new());
        let mut tail = LiveTail::new(backend.clone(), TailConfig::default());

        assert!(matches!(tail.start().await, Err(TailError::MissingDatasource)));
        tail.set_datasource("ds-1");
        tail.set_query("   ");
        assert!(matches!(tail.start().await, Err(TailError::MissingQuery)));
        assert_eq!(*backend.queries.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_rejected() {
        let backend = ScriptedBackend::with_attempts(Vec::new());
        let mut tail = tail(backend.clone(), false);

        tail.start().await.unwrap();
        assert!(matches!(tail.start().await, Err(TailError::AlreadyRunning)));
        tail.stop(false);
    }
}
