//! Record framing for the provider's streaming response body
//!
//! The body is a sequence of records separated by a blank line. Each record
//! is `data: <payload>` where the payload is either the `[DONE]` sentinel or
//! a JSON object carrying `chunk` or `error`:
//!
//! ```text
//! data: {"chunk": "Once upon"}
//!
//! data: {"chunk": " a time"}
//!
//! data: [DONE]
//!
//! ```
//!
//! [`RecordDecoder`] reassembles records from arbitrary byte boundaries
//! (including boundaries inside a multi-byte UTF-8 character) and
//! [`decode_record`] classifies each one.

use bytes::{Buf, BytesMut};
use serde::Deserialize;

/// Prefix every data record starts with
pub const RECORD_PREFIX: &str = "data: ";

/// Payload marking the provider-side end of transmission
pub const DONE_SENTINEL: &str = "[DONE]";

/// Classification of a single record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRecord {
    /// A text delta to append
    Chunk(String),
    /// The provider reported a failure
    Error(String),
    /// End-of-stream sentinel
    Done,
    /// Not a data record, or a data record with nothing to contribute
    Ignored,
    /// A data record whose payload is not valid JSON
    Malformed {
        /// The offending payload
        payload: String,
        /// Parser diagnostic
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Classify one record (the text between two blank-line separators)
///
/// An `error` field wins over a `chunk` field in the same object. Empty
/// chunks and objects carrying neither field (status pings) are ignored.
///
/// # Examples
///
/// ```
/// use storyrelay::upstream::wire::{decode_record, WireRecord};
///
/// assert_eq!(decode_record(r#"data: {"chunk":"Hi"}"#), WireRecord::Chunk("Hi".into()));
/// assert_eq!(decode_record("data: [DONE]"), WireRecord::Done);
/// assert_eq!(decode_record(": keep-alive"), WireRecord::Ignored);
/// ```
pub fn decode_record(record: &str) -> WireRecord {
    let record = record.trim_matches(|c| c == '\r' || c == '\n');
    let payload = match record.strip_prefix(RECORD_PREFIX) {
        Some(p) => p.trim(),
        None => return WireRecord::Ignored,
    };

    if payload == DONE_SENTINEL {
        return WireRecord::Done;
    }

    match serde_json::from_str::<Payload>(payload) {
        Ok(Payload {
            error: Some(message),
            ..
        }) => WireRecord::Error(message),
        Ok(Payload {
            chunk: Some(text), ..
        }) if !text.is_empty() => WireRecord::Chunk(text),
        Ok(_) => WireRecord::Ignored,
        Err(e) => WireRecord::Malformed {
            payload: payload.to_string(),
            reason: e.to_string(),
        },
    }
}

/// Incremental record reassembler
///
/// Feed raw body bytes with [`push`](Self::push) and drain complete records
/// with [`next_record`](Self::next_record). Both `\n\n` and `\r\n\r\n`
/// terminate a record.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buffer: BytesMut,
    /// Bytes already searched for a separator
    scanned: usize,
}

impl RecordDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the body
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete record, if one is buffered
    pub fn next_record(&mut self) -> Option<String> {
        // step back far enough to catch a separator split across pushes
        let start = self.scanned.saturating_sub(3);
        let Some((pos, separator_len)) = find_separator(&self.buffer, start) else {
            self.scanned = self.buffer.len();
            return None;
        };
        let record = self.buffer.split_to(pos);
        self.buffer.advance(separator_len);
        self.scanned = 0;
        Some(String::from_utf8_lossy(&record).into_owned())
    }

    /// Take whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            self.scanned = 0;
            return None;
        }
        self.scanned = 0;
        let rest = self.buffer.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Number of bytes waiting for a separator
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find_separator(buffer: &[u8], start: usize) -> Option<(usize, usize)> {
    (start..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}
