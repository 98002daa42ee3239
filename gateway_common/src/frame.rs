//! Newline framing for stdio JSON-RPC streams.
//!
//! [`FrameDecoder`] turns an unbounded byte stream into complete lines. It is a
//! [`tokio_util::codec::Decoder`], so wrapping a child's stdout (or the relay's
//! own stdin) in a `FramedRead` yields a lazy, one-pass stream of frames:
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use gateway_common::frame::FrameDecoder;
//! use tokio_util::codec::FramedRead;
//!
//! # async fn example(stdout: tokio::process::ChildStdout) {
//! let mut frames = FramedRead::new(stdout, FrameDecoder::new());
//! while let Some(Ok(frame)) = frames.next().await {
//!     println!("frame: {frame}");
//! }
//! # }
//! ```
//!
//! Lines end with `\n` or `\r\n`. Blank and whitespace-only lines are dropped.
//! An incomplete trailing segment stays buffered until its terminator arrives,
//! so the yielded frames do not depend on how the bytes were chunked.

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::warn;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits a byte stream into newline-delimited frames.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    /// Offset into the buffer already searched for a terminator.
    next_index: usize,
    /// Longest accepted line, in bytes (terminator excluded).
    max_length: Option<usize>,
    /// Set while skipping the remainder of an overlong line.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that drops (with a warning) any line longer than `max_length` bytes.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
            ..Self::default()
        }
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Whether `line` is too long, not counting a trailing `\r`.
    fn exceeds_max(&self, line: &[u8]) -> bool {
        let len = line.strip_suffix(b"\r").unwrap_or(line).len();
        self.max_length.is_some_and(|max| len > max)
    }

    /// Turn one raw line (without `\n`) into a frame. Blank lines yield `None`.
    fn to_frame(line: &[u8]) -> Option<String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line);
        if text.trim().is_empty() {
            None
        } else {
            Some(text.into_owned())
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if self.exceeds_max(&buf[..]) {
                    if !self.discarding {
                        warn!(
                            buffered = buf.len(),
                            max_length = ?self.max_length,
                            "Discarding overlong line from stream"
                        );
                    }
                    self.discarding = true;
                    buf.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let line = buf.split_to(end + 1);

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if self.exceeds_max(&line[..end]) {
                warn!(
                    length = end,
                    max_length = ?self.max_length,
                    "Discarding overlong line from stream"
                );
                continue;
            }
            if let Some(frame) = Self::to_frame(&line[..end]) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        // The stream ended, so the unterminated tail can never be completed.
        let rest = buf.split_to(buf.len());
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) || self.exceeds_max(&rest) {
            return Ok(None);
        }
        Ok(Self::to_frame(&rest))
    }
}
