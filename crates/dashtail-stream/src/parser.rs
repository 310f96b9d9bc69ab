use dashtail_types::{DEFAULT_EVENT_NAME, StreamFrame};

/// Decoder for single `text/event-stream` frames
pub struct FrameParser;

impl FrameParser {
    /// Parse one complete frame (without its trailing blank line)
    ///
    /// Returns `None` when the frame carries no `data:` line.
    pub fn parse(raw: &str) -> Option<StreamFrame> {
        let mut event_name: Option<String> = None;
        let mut data: Vec<&str> = Vec::new();

        for line in raw.split('\n') {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                event_name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        if data.is_empty() {
            return None;
        }

        Some(StreamFrame {
            event_name: event_name.unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            payload: data.join("\n"),
        })
    }
}
