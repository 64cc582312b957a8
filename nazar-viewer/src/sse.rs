use bytes::{Buf, BytesMut};
use log::{debug, trace};

const BOM: &[u8] = b"\xEF\xBB\xBF";
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("event stream line longer than {} bytes", MAX_LINE)]
pub struct LineTooLong;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `None` means the default `message` type.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether `EventSource.onmessage` would see this event.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental `text/event-stream` decoder, following the EventSource rules.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    bom_checked: bool,
    // a `\r` ended the previous chunk, a leading `\n` belongs to it
    skip_lf: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, LineTooLong> {
        self.buf.extend_from_slice(bytes);

        if !self.bom_checked {
            if self.buf.len() < BOM.len() && BOM.starts_with(&self.buf) {
                return Ok(Vec::new());
            }
            if self.buf.starts_with(BOM) {
                self.buf.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        let mut events = Vec::new();
        loop {
            if self.skip_lf && !self.buf.is_empty() {
                if self.buf[0] == b'\n' {
                    self.buf.advance(1);
                }
                self.skip_lf = false;
            }

            let Some(end) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };
            let line = self.buf.split_to(end);
            if self.buf[0] == b'\r' {
                self.skip_lf = true;
            }
            self.buf.advance(1);

            if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }

        if self.buf.len() > MAX_LINE {
            return Err(LineTooLong);
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            trace!("sse comment: {line:?}");
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_id = Some(value.to_owned()),
            // the reconnect delay is fixed, a server hint is only logged
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                debug!("server suggested a {value} ms retry interval, ignoring");
            }
            _ => trace!("ignoring sse field {field:?}"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;

        Some(SseEvent {
            event: event.filter(|e| !e.is_empty()),
            data: std::mem::take(&mut self.data),
            id: self.last_id.clone(),
        })
    }
}
