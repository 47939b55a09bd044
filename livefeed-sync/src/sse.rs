//! Incremental decoder for the `text/event-stream` framing.
//!
//! The HTTP body arrives in arbitrary slices: a boundary may fall inside a
//! line, inside a UTF-8 sequence, or between the `\r` and `\n` of a CRLF.
//! [`SseDecoder`] buffers the partial line and yields an [`SseEvent`] every
//! time a blank line closes an event block.
//!
//! ```text
//! event: chunk          ─┐
//! id: 17                 │  one event
//! data: {"chunkId":…}    │
//!                       ─┘  blank line dispatches
//! ```

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Event name; `None` means the default `message` type
    pub event: Option<String>,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream
    pub id: Option<String>,
    /// Reconnection hint in milliseconds, reported once after it is sent
    pub retry: Option<u64>,
}

impl SseEvent {
    /// A default-typed event carrying `data`.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// An event with an explicit name.
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Effective event type.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Longest line kept by default. Large messages are expected to arrive as
/// fragments well below this.
pub const DEFAULT_MAX_LINE: usize = 8 * 1024 * 1024;

/// Line-oriented SSE parser with cross-chunk state.
#[derive(Debug)]
pub struct SseDecoder {
    /// Bytes of the current, unterminated line
    line: Vec<u8>,
    max_line: usize,
    /// The current line overflowed `max_line`; skip to the next break
    discarding: bool,
    /// Previous byte was `\r`; a following `\n` belongs to the same break
    after_cr: bool,
    /// First line has been seen (BOM handling)
    started: bool,
    data: String,
    event: Option<String>,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that drops any line longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            max_line: max_line.max(1),
            discarding: false,
            after_cr: false,
            started: false,
            data: String::new(),
            event: None,
            last_id: None,
            retry: None,
        }
    }

    /// Feed a slice of the body and collect every event it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    if std::mem::take(&mut self.discarding) {
                        continue;
                    }
                    let line = std::mem::take(&mut self.line);
                    if let Some(event) = self.process_line(&line) {
                        events.push(event);
                    }
                }
                _ => {
                    self.after_cr = false;
                    if self.discarding {
                        continue;
                    }
                    if self.line.len() >= self.max_line {
                        log::warn!(
                            "[sse] line exceeds {} bytes, dropping it",
                            self.max_line
                        );
                        self.line = Vec::new();
                        self.discarding = true;
                        continue;
                    }
                    self.line.push(byte);
                }
            }
        }
        events
    }

    /// Last event id seen, kept across events.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    fn process_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        let mut line = line;
        if !self.started {
            self.started = true;
            line = line.strip_prefix(BOM).unwrap_or(line);
        }

        if line.is_empty() {
            return self.dispatch();
        }
        if line[0] == b':' {
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line.as_ref(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                self.retry = value.parse().ok();
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event: event.filter(|name| !name.is_empty()),
            data,
            id: self.last_id.clone(),
            retry: self.retry.take(),
        })
    }
}
