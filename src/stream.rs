//! Bounded output collection.
//!
//! Each execution owns one [`OutputCollector`] per captured stream. The
//! collector accumulates raw bytes up to a hard cap, optionally forwarding
//! decoded chunks (or whole lines) to a listener as they arrive. Crossing the
//! cap refuses the write and surfaces [`ExecutionError::BufferOverflow`],
//! which aborts the owning execution — there is no backpressure to the child.

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, Result};

/// Text encodings the engine knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    /// Parse a configured encoding name. Returns `None` for names outside
    /// the known set.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Encoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Some(Encoding::Latin1),
            _ => None,
        }
    }

    /// Decode bytes, replacing invalid sequences rather than failing.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

type ChunkListener = Box<dyn FnMut(&str) + Send>;

/// Append-only byte buffer with a hard size cap and optional live listeners.
pub struct OutputCollector {
    buf: Vec<u8>,
    limit: usize,
    encoding: Encoding,
    on_chunk: Option<ChunkListener>,
    on_line: Option<ChunkListener>,
    line_buf: Vec<u8>,
}

impl std::fmt::Debug for OutputCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCollector")
            .field("len", &self.buf.len())
            .field("limit", &self.limit)
            .field("encoding", &self.encoding)
            .field("has_chunk_listener", &self.on_chunk.is_some())
            .field("has_line_listener", &self.on_line.is_some())
            .finish()
    }
}

impl OutputCollector {
    pub fn new(limit: usize, encoding: Encoding) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            encoding,
            on_chunk: None,
            on_line: None,
            line_buf: Vec::new(),
        }
    }

    /// Install a listener invoked synchronously with each decoded chunk.
    pub fn on_chunk(mut self, listener: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(listener));
        self
    }

    /// Install a listener invoked once per `\n`-terminated logical line.
    ///
    /// Lines split across chunks are buffered and delivered whole; bytes
    /// still pass through to the main buffer untouched.
    pub fn on_line(mut self, listener: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_line = Some(Box::new(listener));
        self
    }

    /// Append a chunk. Refuses the write (leaving the buffer unchanged) when
    /// it would cross the cap.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(ExecutionError::BufferOverflow { limit: self.limit });
        }
        self.buf.extend_from_slice(chunk);

        if let Some(listener) = self.on_chunk.as_mut() {
            listener(&self.encoding.decode(chunk));
        }
        if self.on_line.is_some() {
            self.feed_lines(chunk);
        }
        Ok(())
    }

    fn feed_lines(&mut self, chunk: &[u8]) {
        self.line_buf.extend_from_slice(chunk);
        while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let rest = self.line_buf.split_off(pos + 1);
            let line_bytes = std::mem::replace(&mut self.line_buf, rest);
            let line = self.encoding.decode(&line_bytes[..line_bytes.len() - 1]);
            if let Some(listener) = self.on_line.as_mut() {
                listener(&line);
            }
        }
    }

    /// Decode the accumulated bytes with the configured encoding.
    pub fn text(&self) -> String {
        self.encoding.decode(&self.buf)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Clear the buffer (and any pending partial line) for reuse across
    /// retries.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.line_buf.clear();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn collects_and_decodes() {
        let mut c = OutputCollector::new(64, Encoding::Utf8);
        c.write(b"hello ").unwrap();
        c.write(b"world").unwrap();
        assert_eq!(c.text(), "hello world");
        assert_eq!(c.bytes(), b"hello world");
    }

    #[test]
    fn refuses_write_crossing_the_cap() {
        let mut c = OutputCollector::new(8, Encoding::Utf8);
        c.write(b"12345678").unwrap();
        let err = c.write(b"9").unwrap_err();
        match err {
            ExecutionError::BufferOverflow { limit } => assert_eq!(limit, 8),
            other => panic!("unexpected error: {other:?}"),
        }
        // The refused write left the buffer intact.
        assert_eq!(c.text(), "12345678");
    }

    #[test]
    fn reset_clears_everything() {
        let mut c = OutputCollector::new(64, Encoding::Utf8);
        c.write(b"data").unwrap();
        c.reset();
        assert_eq!(c.text(), "");
        assert!(c.is_empty());
    }

    #[test]
    fn chunk_listener_sees_each_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut c = OutputCollector::new(64, Encoding::Utf8)
            .on_chunk(move |s| sink.lock().unwrap().push(s.to_string()));
        c.write(b"a").unwrap();
        c.write(b"bc").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "bc"]);
    }

    #[test]
    fn line_listener_joins_split_lines() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut c = OutputCollector::new(64, Encoding::Utf8)
            .on_line(move |s| sink.lock().unwrap().push(s.to_string()));
        c.write(b"par").unwrap();
        c.write(b"tial\nsecond\nthi").unwrap();
        c.write(b"rd\n").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["partial", "second", "third"]);
        // Bytes still pass through untouched.
        assert_eq!(c.text(), "partial\nsecond\nthird\n");
    }

    #[test]
    fn latin1_decodes_high_bytes() {
        let mut c = OutputCollector::new(16, Encoding::Latin1);
        c.write(&[0x63, 0x61, 0x66, 0xe9]).unwrap();
        assert_eq!(c.text(), "caf\u{e9}");
    }

    #[test]
    fn encoding_names() {
        assert_eq!(Encoding::parse("utf-8"), Some(Encoding::Utf8));
        assert_eq!(Encoding::parse("UTF8"), Some(Encoding::Utf8));
        assert_eq!(Encoding::parse("latin1"), Some(Encoding::Latin1));
        assert_eq!(Encoding::parse("utf-16"), None);
    }
}
