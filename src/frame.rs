//! Event frame parsing for line-delimited server-sent-event streams.
//!
//! A streamed completion arrives as lines of text:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! [`lines`] adapts the HTTP body into a stream of lines, buffering across
//! network chunk boundaries, and [`parse_frame`] turns each line into a
//! [`Frame`]. Anything that is not a `data: ` line is skipped, and a frame
//! whose payload is not JSON is logged and skipped so one corrupt frame never
//! aborts the stream.

use crate::{Error, Result};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::pin::Pin;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Prefix that marks a data frame
pub const DATA_PREFIX: &str = "data: ";

/// Payload that terminates the stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded line of the stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The server finished sending events
    Done,
    /// A decoded JSON payload, usually an event object
    Event(Value),
}

/// Decodes a single stream line.
///
/// Returns `None` for blank lines, non-data lines, and data frames whose payload
/// does not decode as JSON.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let payload = line.strip_prefix(DATA_PREFIX)?;

    if payload.trim() == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => Some(Frame::Event(value)),
        Err(e) => {
            tracing::error!(error = %e, payload, "failed to parse stream frame, skipping");
            None
        }
    }
}

/// Boxed stream of text lines
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Splits a streaming HTTP response body into lines.
///
/// Lines may span several network chunks; `\r\n` endings are normalised and a
/// final line without a trailing newline is still yielded at EOF. Transport
/// failures end the stream with an [`Error::Http`], or [`Error::Timeout`] once
/// the request timeout has passed.
pub fn lines(response: reqwest::Response) -> LineStream {
    let bytes = response
        .bytes_stream()
        .map_err(std::io::Error::other);
    line_stream(bytes)
}

/// Line splitting over any byte-chunk stream. Shared by [`lines`] and the tests.
pub(crate) fn line_stream<S, B>(chunks: S) -> LineStream
where
    S: Stream<Item = std::io::Result<B>> + Send + 'static,
    B: bytes::Buf + Send + 'static,
{
    let reader = StreamReader::new(chunks);
    let framed = FramedRead::new(reader, LinesCodec::new()).map(|line| {
        line.map_err(|e| match e {
            tokio_util::codec::LinesCodecError::Io(io) => read_error(io),
            other => Error::stream(other.to_string()),
        })
    });
    Box::pin(framed)
}

/// Recovers the transport error wrapped by [`lines`].
fn read_error(io: std::io::Error) -> Error {
    if !io.get_ref().is_some_and(|inner| inner.is::<reqwest::Error>()) {
        return Error::Io(io);
    }
    match io.into_inner().map(|inner| inner.downcast::<reqwest::Error>()) {
        Some(Ok(http)) => Error::from_transport(*http),
        _ => Error::stream("transport error without a source"),
    }
}
