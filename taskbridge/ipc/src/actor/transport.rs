//! Transport channel - socket connection and message framing
//!
//! Knows nothing about payloads: a connector produces a duplex byte stream and
//! [`LineChannel`] turns it into newline-delimited frames.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::UnixStream;
use tracing::warn;

use crate::constants::MAX_FRAME_BYTES;

/// Opens a stream to the server's socket path.
///
/// Production code uses [`UnixConnector`]; tests plug in in-memory streams.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self, path: &Path) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connects over a Unix domain socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixConnector;

impl Connector for UnixConnector {
    type Stream = UnixStream;

    async fn connect(&self, path: &Path) -> io::Result<UnixStream> {
        UnixStream::connect(path).await
    }
}

/// Newline-delimited framing over one duplex stream.
///
/// A frame longer than the limit is never held in full: once it passes the
/// limit its bytes are dropped up to the next newline.
pub struct LineChannel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    /// Bytes of a frame still being read. Kept across calls so that a
    /// `read_frame` cancelled inside `select!` loses nothing.
    line: Vec<u8>,
    /// Skipping the rest of an oversized frame.
    discarding: bool,
    max_frame_bytes: usize,
}

impl<S: AsyncRead + AsyncWrite> LineChannel<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_bytes(stream, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(stream: S, max_frame_bytes: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            line: Vec::new(),
            discarding: false,
            max_frame_bytes,
        }
    }

    /// Next non-empty frame, or `None` once the peer closes the stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                // End of stream; an unterminated last line still counts
                let line = std::mem::take(&mut self.line);
                let discarded = std::mem::replace(&mut self.discarding, false);
                if discarded || line.is_empty() {
                    return Ok(None);
                }
                if let Some(frame) = decode_frame(line) {
                    return Ok(Some(frame));
                }
                return Ok(None);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = match newline {
                Some(i) => &available[..i],
                None => available,
            };
            let consumed = chunk.len() + usize::from(newline.is_some());
            buffer_capped(
                &mut self.line,
                &mut self.discarding,
                chunk,
                self.max_frame_bytes,
            );
            self.reader.consume(consumed);

            if newline.is_none() {
                continue;
            }
            let line = std::mem::take(&mut self.line);
            if std::mem::replace(&mut self.discarding, false) {
                continue;
            }
            if let Some(frame) = decode_frame(line) {
                return Ok(Some(frame));
            }
        }
    }

    /// Write one frame followed by a newline and flush it.
    pub async fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

/// Append `chunk` to `line` unless that would pass `limit`, in which case the
/// frame so far is dropped and the rest of it will be skipped.
fn buffer_capped(line: &mut Vec<u8>, discarding: &mut bool, chunk: &[u8], limit: usize) {
    if *discarding {
        return;
    }
    if line.len() + chunk.len() > limit {
        warn!(
            "Discarding oversized frame (over {} bytes, limit {})",
            line.len() + chunk.len(),
            limit
        );
        line.clear();
        line.shrink_to_fit();
        *discarding = true;
        return;
    }
    line.extend_from_slice(chunk);
}

/// Trimmed frame text, or `None` for blank and non-UTF-8 lines.
fn decode_frame(line: Vec<u8>) -> Option<String> {
    let Ok(line) = String::from_utf8(line) else {
        warn!("Discarding frame that is not valid UTF-8");
        return None;
    };
    let frame = line.trim();
    if frame.is_empty() {
        return None;
    }
    Some(frame.to_string())
}

/// Bounded, linearly scaled reconnection schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base_delay * attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// True once `attempts` consecutive failures have used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}
