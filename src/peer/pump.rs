use super::error::PeerError;
use super::message::{Decoded, Message};
use crate::bandwidth::BandwidthLimiter;
use crate::constants::{READ_BUFFER_SIZE, WRITE_TIMEOUT};
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

/// Incremental framing over a stream of received bytes.
///
/// The buffer holds only undecoded bytes. Decoded frames are split off the
/// front; when the front does not start a valid message a single byte is
/// dropped and scanning resumes, so one corrupt byte cannot desynchronize
/// the connection for good.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    skipped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_capacity(READ_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            skipped: 0,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting to be decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes discarded as garbage so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Decodes the next whole message, if the buffer holds one.
    pub fn next_message(&mut self) -> Option<Message> {
        while !self.buf.is_empty() {
            match Message::try_decode(&mut self.buf) {
                Decoded::Message(message) => return Some(message),
                Decoded::Incomplete => return None,
                Decoded::Invalid => {
                    self.buf.advance(1);
                    self.skipped += 1;
                }
            }
        }
        None
    }

    /// Makes room for at least `additional` more bytes. Once every decoded
    /// frame has been released this reuses the front of the allocation
    /// instead of growing it.
    fn reserve(&mut self, additional: usize) -> &mut BytesMut {
        self.buf.reserve(additional);
        &mut self.buf
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a peer connection.
pub struct PumpReader<R> {
    reader: R,
    decoder: FrameDecoder,
    limiter: Arc<BandwidthLimiter>,
}

impl<R: AsyncRead + Unpin> PumpReader<R> {
    pub fn new(reader: R, limiter: Arc<BandwidthLimiter>) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            limiter,
        }
    }

    /// Performs one read and returns every message it completed, in stream
    /// order. May return an empty list when the read ended mid-frame.
    pub async fn read_messages(&mut self) -> Result<Vec<Message>, PeerError> {
        let n = self
            .reader
            .read_buf(self.decoder.reserve(READ_BUFFER_SIZE))
            .await?;

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }

        self.limiter.on_bytes_read(n).await;

        let mut messages = Vec::new();
        while let Some(message) = self.decoder.next_message() {
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }
}

/// Write side of a peer connection.
pub struct PumpWriter<W> {
    writer: W,
    buf: BytesMut,
    limiter: Arc<BandwidthLimiter>,
}

impl<W: AsyncWrite + Unpin> PumpWriter<W> {
    pub fn new(writer: W, limiter: Arc<BandwidthLimiter>) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            limiter,
        }
    }

    /// Encodes `messages` back to back and sends them in a single write.
    /// Returns the number of bytes written.
    pub async fn write_batch(&mut self, messages: &[Message]) -> Result<usize, PeerError> {
        self.buf.clear();
        for message in messages {
            message.encode_into(&mut self.buf);
        }

        let n = self.buf.len();
        self.limiter.on_bytes_written(n).await;

        timeout(WRITE_TIMEOUT, async {
            self.writer.write_all(&self.buf).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;

        Ok(n)
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<usize, PeerError> {
        self.write_batch(std::slice::from_ref(message)).await
    }

    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Splits a duplex stream into its pump halves.
pub fn split_stream<S>(
    stream: S,
    limiter: Arc<BandwidthLimiter>,
) -> (PumpReader<ReadHalf<S>>, PumpWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = split(stream);
    (
        PumpReader::new(reader, limiter.clone()),
        PumpWriter::new(writer, limiter),
    )
}
