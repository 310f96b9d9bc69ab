//! Backend seam used by the tail controller
//!
//! `LogBackend` is implemented over HTTP by [`HttpBackend`]; tests drive the
//! controller with scripted implementations instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dashtail_types::{LogRecord, QueryRequest, QueryResult, StreamRequest, TailTarget};

use crate::error::StreamError;
use crate::transport::{StreamHandler, StreamTransport};

/// Default backend base URL
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// Silence after which a stream is considered dead (backend heartbeats every 10s)
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for one-shot queries
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Queries and streams logs for a target
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Run a one-shot log query
    async fn query_logs(
        &self,
        target: &TailTarget,
        request: &QueryRequest,
    ) -> Result<Vec<LogRecord>, StreamError>;

    /// Open one stream attempt and feed it to `handler` until it ends
    ///
    /// Resolves `Ok(())` only when `cancel` fired.
    async fn open_stream(
        &self,
        target: &TailTarget,
        request: &StreamRequest,
        handler: &mut (dyn StreamHandler + Send),
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>;
}

/// Connection settings for [`HttpBackend`]
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://localhost:8080`
    pub url: String,

    /// Extra headers sent with every request
    pub headers: Vec<(String, String)>,

    /// `None` disables the idle watchdog
    pub idle_timeout: Option<Duration>,

    pub query_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            headers: Vec::new(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// HTTP implementation of [`LogBackend`] against the datasource API
#[derive(Clone, Debug)]
pub struct HttpBackend {
    http: Client,
    base_url: String,
    transport: StreamTransport,
    query_timeout: Duration,
}

impl HttpBackend {
    /// Create a backend client from configuration
    pub fn new(config: &BackendConfig) -> Result<Self, StreamError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| StreamError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| StreamError::InvalidHeader(name.as_str().to_string()))?;
            headers.insert(name, value);
        }

        // No client-wide timeout: it would cap the lifetime of every stream
        let http = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            transport: StreamTransport::new(config.idle_timeout),
            query_timeout: config.query_timeout,
        })
    }

    fn endpoint(&self, target: &TailTarget, action: &str) -> String {
        format!(
            "{}/api/datasources/{}/{}",
            self.base_url, target.datasource_id, action
        )
    }
}

#[async_trait]
impl LogBackend for HttpBackend {
    async fn query_logs(
        &self,
        target: &TailTarget,
        request: &QueryRequest,
    ) -> Result<Vec<LogRecord>, StreamError> {
        let url = self.endpoint(target, "query");
        debug!(%url, limit = request.limit, "query_logs: called");

        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.query_timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::open_failed(status.as_u16(), &body));
        }

        let result: QueryResult = response.json().await?;
        if result.is_error() {
            return Err(StreamError::Query(
                result.error.unwrap_or_else(|| "query failed".to_string()),
            ));
        }

        let logs = result.into_logs();
        debug!(count = logs.len(), "query_logs: complete");
        Ok(logs)
    }

    async fn open_stream(
        &self,
        target: &TailTarget,
        request: &StreamRequest,
        handler: &mut (dyn StreamHandler + Send),
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let url = self.endpoint(target, "stream");
        debug!(%url, start = request.start, limit = request.limit, "open_stream: called");

        let http_request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(request);

        self.transport.open(http_request, handler, cancel).await
    }
}
