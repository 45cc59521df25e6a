//! Newline-delimited JSON framing for every stream Toolmux speaks.
//!
//! Provides:
//! - `NdJsonCodec`, a `tokio_util` codec that buffers partial lines across
//!   reads and yields one message per complete line
//! - `MessageSink`, a shared write half that flushes before returning

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use futures::SinkExt;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::error::{Result, ToolmuxError};

/// Default maximum line length (16 MB). Screenshots travel inline.
pub const DEFAULT_MAX_LINE: usize = 16 * 1024 * 1024;

/// Newline-delimited JSON codec.
///
/// Messages are separated by `\n` (a trailing `\r` is tolerated). A line that
/// fails to parse is logged and dropped; the stream keeps going. A line longer
/// than `max_length` is discarded up to its terminator.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
    max_length: usize,
    /// Bytes of the buffer already searched for a terminator
    next_index: usize,
    discarding: bool,
    dropped: u64,
}

impl<T> NdJsonCodec<T> {
    /// Create a new codec with default max length.
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE)
    }

    /// Create a new codec with custom max length.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
            next_index: 0,
            discarding: false,
            dropped: 0,
        }
    }

    /// Get the max message length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of lines dropped as malformed or oversized.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice(line) {
            Ok(message) => Some(message),
            Err(e) => {
                self.dropped += 1;
                log::warn!(
                    "Dropping malformed message ({} bytes): {}",
                    line.len(),
                    e
                );
                None
            }
        }
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NdJsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_length(self.max_length)
    }
}

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = T;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            let start = self.next_index.min(src.len());
            let Some(offset) = src[start..].iter().position(|&b| b == b'\n') else {
                self.next_index = src.len();
                if src.len() > self.max_length {
                    if !self.discarding {
                        self.dropped += 1;
                        log::warn!("Discarding oversized message (> {} bytes)", self.max_length);
                    }
                    self.discarding = true;
                    src.clear();
                    self.next_index = 0;
                }
                return Ok(None);
            };

            self.next_index = 0;
            let line = src.split_to(start + offset);
            src.advance(1);

            if self.discarding {
                // Tail of an oversized line
                self.discarding = false;
                continue;
            }

            if line.len() > self.max_length {
                self.dropped += 1;
                log::warn!("Discarding oversized message ({} bytes)", line.len());
                continue;
            }

            if let Some(message) = self.parse_line(&line) {
                return Ok(Some(message));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated final line
        let line = src.split();
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }
        Ok(self.parse_line(&line))
    }
}

impl<T: Serialize> Encoder<T> for NdJsonCodec<T> {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        // Compact JSON never contains a raw newline
        let json = serde_json::to_vec(&item).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;

        if json.len() > self.max_length {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Message too large: {} > {}", json.len(), self.max_length),
            ));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');

        Ok(())
    }
}

/// Framed reader yielding parsed messages.
pub type MessageStream<R, T> = FramedRead<R, NdJsonCodec<T>>;

/// Wrap a read half in the message codec.
pub fn message_stream<R: AsyncRead, T: DeserializeOwned>(reader: R) -> MessageStream<R, T> {
    FramedRead::new(reader, NdJsonCodec::new())
}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Shared, serialized write half of a connection.
///
/// Every `send` writes the full line and flushes before returning. The first
/// write failure marks the sink closed; later sends fail fast.
pub struct MessageSink<T> {
    inner: Mutex<FramedWrite<BoxedWriter, NdJsonCodec<T>>>,
    open: AtomicBool,
}

impl<T: Serialize> MessageSink<T> {
    pub fn new<W: AsyncWrite + Send + 'static>(writer: W) -> Self {
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            inner: Mutex::new(FramedWrite::new(writer, NdJsonCodec::new())),
            open: AtomicBool::new(true),
        }
    }

    /// Write one message and flush.
    pub async fn send(&self, message: T) -> Result<()> {
        if !self.is_open() {
            return Err(ToolmuxError::Ipc("Connection is closed".into()));
        }
        let mut framed = self.inner.lock().await;
        if let Err(e) = framed.send(message).await {
            self.open.store(false, Ordering::SeqCst);
            return Err(ToolmuxError::Ipc(format!("Failed to write: {}", e)));
        }
        Ok(())
    }

    /// Whether the transport is still writable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Mark the sink unwritable without touching the stream.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Flush and shut down the write half.
    pub async fn close(&self) {
        self.mark_closed();
        let mut framed = self.inner.lock().await;
        let _ = SinkExt::<T>::close(&mut *framed).await;
    }
}
