// src/core/message.rs

//! The wire representation of a single protocol line and the
//! corresponding `Encoder`/`Decoder` for network communication.
//!
//! The protocol is line-oriented: every message is one line, terminated by
//! CR+LF on emission. Ingest tolerates bare LF. Leading and trailing
//! whitespace inside a line is significant for string-mode variables and
//! is never trimmed.

use crate::core::RouterError;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted line length in bytes, excluding the terminator. Chosen
/// to exceed the largest observed PSX lines (lexicon and CDU payloads) by
/// a wide margin.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A single parsed protocol line: either a `key=value` variable update or
/// a bare signal token such as `load1` or `bang`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeyValue { key: String, value: String },
    Signal(String),
}

impl Message {
    /// Parses a line. A `=` anywhere splits key from value; everything
    /// else is a signal. The split never trims whitespace.
    pub fn parse(line: &str) -> Self {
        match line.split_once('=') {
            Some((key, value)) => Message::KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            },
            None => Message::Signal(line.to_string()),
        }
    }

    /// The keyword of a variable update, or the signal name.
    pub fn key(&self) -> &str {
        match self {
            Message::KeyValue { key, .. } => key,
            Message::Signal(name) => name,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Message::KeyValue { value, .. } => Some(value),
            Message::Signal(_) => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeyValue { key, value } => write!(f, "{key}={value}"),
            Message::Signal(name) => write!(f, "{name}"),
        }
    }
}

/// A `tokio_util::codec` implementation framing the PSX line protocol.
///
/// Over-long input does not kill the connection: the decoder enters
/// discard mode, swallows bytes until the next terminator, reports the
/// dropped line as an error once, and resumes.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// True while swallowing the remainder of an over-long line.
    discarding: bool,
    /// Scan position into the buffer, so unscanned bytes are not
    /// re-examined on the next call.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = RouterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, RouterError> {
        loop {
            let read_to = src.len();
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|pos| self.next_index + pos);

            if self.discarding {
                match newline {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.next_index = 0;
                        self.discarding = false;
                        return Err(RouterError::LineTooLong(MAX_LINE_LENGTH));
                    }
                    None => {
                        src.clear();
                        self.next_index = 0;
                        return Ok(None);
                    }
                }
            }

            match newline {
                Some(pos) => {
                    let mut line = src.split_to(pos + 1);
                    self.next_index = 0;
                    // Strip LF, then an optional CR.
                    line.truncate(line.len() - 1);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.len() > MAX_LINE_LENGTH {
                        return Err(RouterError::LineTooLong(MAX_LINE_LENGTH));
                    }
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                None if src.len() > MAX_LINE_LENGTH => {
                    // No terminator within the limit: drop what we have and
                    // keep dropping until the line ends.
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    continue;
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, RouterError> {
        // A partial line at EOF carries no terminator and is discarded, as
        // the real PSX server does.
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<&str> for LineCodec {
    type Error = RouterError;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> Result<(), RouterError> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
