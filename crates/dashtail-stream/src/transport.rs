use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use dashtail_types::{LogRecord, StreamFrame};

use crate::decoder::FrameReader;
use crate::error::StreamError;
use crate::parser::FrameParser;

/// Reported through `on_error` when a `log` frame is not a valid record
pub const MALFORMED_PAYLOAD: &str = "Received malformed stream payload";

/// Reported through `on_error` when an `error` frame carries no message
pub const STREAM_FAILED: &str = "Live stream failed";

const EVENT_STREAM: &str = "text/event-stream";

/// Receiver of decoded stream events, called in frame order
pub trait StreamHandler {
    fn on_record(&mut self, record: LogRecord);

    fn on_heartbeat(&mut self) {}

    fn on_status(&mut self, _status: &str, _message: Option<&str>) {}

    fn on_error(&mut self, _message: &str) {}
}

#[derive(Default, Deserialize)]
struct StatusPayload {
    status: Option<String>,
    message: Option<String>,
}

#[derive(Default, Deserialize)]
struct ErrorPayload {
    error: Option<String>,
    message: Option<String>,
}

/// Route one frame to the matching handler method
pub fn dispatch_frame<H>(frame: StreamFrame, handler: &mut H)
where
    H: StreamHandler + ?Sized,
{
    match frame.event_name.as_str() {
        "log" => match serde_json::from_str::<LogRecord>(&frame.payload) {
            Ok(record) => handler.on_record(record),
            Err(e) => {
                warn!(error = %e, "dispatch_frame: malformed log payload");
                handler.on_error(MALFORMED_PAYLOAD);
            }
        },
        "heartbeat" => handler.on_heartbeat(),
        "status" => {
            let payload = serde_json::from_str::<StatusPayload>(&frame.payload).unwrap_or_default();
            let status = payload.status.unwrap_or_else(|| "unknown".to_string());
            handler.on_status(&status, payload.message.as_deref());
        }
        "error" => {
            let payload = serde_json::from_str::<ErrorPayload>(&frame.payload).unwrap_or_default();
            let message = payload
                .error
                .or(payload.message)
                .unwrap_or_else(|| STREAM_FAILED.to_string());
            handler.on_error(&message);
        }
        other => {
            trace!(event = other, "dispatch_frame: ignoring unknown event");
        }
    }
}

/// Drive a response body until it ends or `cancel` fires
///
/// Returns `Ok(())` only on cancellation. A body that ends on its own yields
/// [`StreamError::Disconnected`].
pub async fn pump<S, B, E, H>(
    mut body: S,
    handler: &mut H,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> Result<(), StreamError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<StreamError>,
    H: StreamHandler + ?Sized,
{
    let mut reader = FrameReader::new();

    loop {
        let next = async {
            match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, body.next())
                    .await
                    .map_err(|_| StreamError::Idle(limit)),
                None => Ok(body.next().await),
            }
        };

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pump: cancelled");
                return Ok(());
            }
            item = next => item?,
        };

        let chunk = match item {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(e.into()),
            None => {
                debug!(pending = reader.pending_len(), "pump: body ended");
                return Err(StreamError::Disconnected);
            }
        };

        for raw in reader.push(chunk.as_ref()) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Some(frame) = FrameParser::parse(&raw) {
                dispatch_frame(frame, handler);
            }
        }
    }
}

/// Streaming request executor
#[derive(Clone, Debug)]
pub struct StreamTransport {
    idle_timeout: Option<Duration>,
}

impl StreamTransport {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    /// Send `request` and feed its body to `handler`
    ///
    /// The response is owned by this call and dropped on every return path.
    pub async fn open<H>(
        &self,
        request: reqwest::RequestBuilder,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>
    where
        H: StreamHandler + ?Sized,
    {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            response = request.header(reqwest::header::ACCEPT, EVENT_STREAM).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                body = response.text() => body.unwrap_or_default(),
            };
            debug!(status = status.as_u16(), "open: non-success response");
            return Err(StreamError::open_failed(status.as_u16(), &body));
        }

        if !is_event_stream(response.headers().get(CONTENT_TYPE)) {
            return Err(StreamError::StreamingUnsupported);
        }

        debug!(status = status.as_u16(), "open: stream established");
        pump(Box::pin(response.bytes_stream()), handler, cancel, self.idle_timeout).await
    }
}

/// A missing content type is accepted, anything other than an event stream is not
fn is_event_stream(content_type: Option<&reqwest::header::HeaderValue>) -> bool {
    match content_type.and_then(|v| v.to_str().ok()) {
        Some(value) => value.trim().to_ascii_lowercase().starts_with(EVENT_STREAM),
        None => true,
    }
}
