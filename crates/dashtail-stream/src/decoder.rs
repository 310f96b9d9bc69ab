//! Incremental decoding of a streamed response body into raw frames

/// Frame separator of the event stream
const FRAME_SEPARATOR: &str = "\n\n";

/// Turns body chunks into complete raw frames
///
/// Holds back incomplete UTF-8 sequences and a trailing `\r` until the next
/// chunk, so neither a multi-byte character nor a `\r\n` pair is split.
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Undecoded bytes of an incomplete UTF-8 sequence
    partial: Vec<u8>,

    /// A `\r` seen at the end of the previous chunk
    pending_cr: bool,

    /// Decoded text not yet terminated by a frame separator
    text: String,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let decoded = self.decode(chunk);
        self.append_normalized(&decoded);

        let mut frames = Vec::new();
        while let Some(idx) = self.text.find(FRAME_SEPARATOR) {
            frames.push(self.text[..idx].to_string());
            self.text.drain(..idx + FRAME_SEPARATOR.len());
        }
        frames
    }

    /// Bytes and text still waiting for a separator
    pub fn pending_len(&self) -> usize {
        self.partial.len() + self.text.len() + usize::from(self.pending_cr)
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        self.partial.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.partial.len());
        let mut pos = 0;
        while pos < self.partial.len() {
            match std::str::from_utf8(&self.partial[pos..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    pos = self.partial.len();
                }
                Err(e) => {
                    let valid_end = pos + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.partial[pos..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            pos = valid_end + len;
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more bytes
                            pos = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.partial.drain(..pos);
        out
    }

    fn append_normalized(&mut self, decoded: &str) {
        let mut chunk = String::with_capacity(decoded.len() + 1);
        if std::mem::take(&mut self.pending_cr) {
            chunk.push('\r');
        }
        chunk.push_str(decoded);

        if chunk.ends_with('\r') {
            chunk.pop();
            self.pending_cr = true;
        }

        self.text.push_str(&chunk.replace("\r\n", "\n"));
    }
}
