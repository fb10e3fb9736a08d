//! Single-reader, single-writer framed I/O over a duplex byte stream.
//!
//! [`FramedPipe`] owns its transport and hands out whole [`Frame`]s. One
//! read and one write may be in flight at a time; a second concurrent caller
//! is a programming error and fails immediately rather than queueing.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::frame::{codec::FrameCodec, Frame, FrameError};

/// Byte stream usable as a frame transport.
///
/// Blanket-implemented for every `AsyncRead + AsyncWrite` stream, so TCP
/// sockets, serial ports and in-memory duplex pipes all qualify.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Errors raised by [`FramedPipe`] operations.
#[derive(Debug, Error)]
pub enum PipeError {
    /// A read was attempted while another read was in flight.
    #[error("concurrent read attempted on framed pipe")]
    ConcurrentRead,
    /// A write was attempted while another write was in flight.
    #[error("concurrent write attempted on framed pipe")]
    ConcurrentWrite,
    /// The pipe was disposed.
    #[error("framed pipe disposed")]
    Disposed,
    /// The codec rejected inbound bytes or the transport failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Frame-oriented view over a duplex byte stream.
pub struct FramedPipe {
    reader: Mutex<FramedRead<ReadHalf<Box<dyn ByteStream>>, FrameCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<Box<dyn ByteStream>>, FrameCodec>>,
    disposed: AtomicBool,
}

impl FramedPipe {
    /// Wrap a byte stream in a framed pipe, taking ownership of the stream.
    #[must_use]
    pub fn new(stream: impl ByteStream + 'static) -> Self {
        let boxed: Box<dyn ByteStream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, FrameCodec)),
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` at end of stream. A decode failure leaves the pipe
    /// usable: the offending bytes have been consumed and the next call
    /// resumes at the following frame boundary. Cancelling the returned
    /// future never discards buffered bytes.
    ///
    /// # Errors
    /// [`PipeError::ConcurrentRead`] if another read is in flight,
    /// [`PipeError::Disposed`] after disposal, and [`PipeError::Frame`] for
    /// codec or I/O failures.
    pub async fn read_frame(&self) -> Result<Option<Frame>, PipeError> {
        if self.is_disposed() {
            return Err(PipeError::Disposed);
        }
        let mut reader = self
            .reader
            .try_lock()
            .map_err(|_| PipeError::ConcurrentRead)?;
        match reader.next().await {
            Some(result) => Ok(Some(result?)),
            None => Ok(None),
        }
    }

    /// Write one frame and flush it.
    ///
    /// The frame's bytes are buffered in full before the transport write
    /// starts, so a frame is never interleaved or truncated.
    ///
    /// # Errors
    /// [`PipeError::ConcurrentWrite`] if another write is in flight,
    /// [`PipeError::Disposed`] after disposal, and [`PipeError::Frame`] for
    /// I/O failures.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), PipeError> {
        if self.is_disposed() {
            return Err(PipeError::Disposed);
        }
        let mut writer = self
            .writer
            .try_lock()
            .map_err(|_| PipeError::ConcurrentWrite)?;
        writer.send(frame).await?;
        Ok(())
    }

    /// Mark the pipe disposed; subsequent operations fail fast.
    pub fn dispose(&self) { self.disposed.store(true, Ordering::SeqCst); }

    /// Whether [`FramedPipe::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool { self.disposed.load(Ordering::SeqCst) }
}

impl std::fmt::Debug for FramedPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedPipe")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pipe() {
        let (near, far) = tokio::io::duplex(256);
        let pipe = FramedPipe::new(near);
        let mut far = far;
        far.write_all(b"*1*1*33##").await.expect("write");

        let frame = pipe
            .read_frame()
            .await
            .expect("read")
            .expect("one frame");
        assert_eq!(frame.to_string(), "*1*1*33##");

        let out = Frame::parse("*#*1##").expect("ack");
        pipe.write_frame(&out).await.expect("write frame");
        let mut buf = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut buf)
            .await
            .expect("read back");
        assert_eq!(&buf, b"*#*1##");
    }

    #[tokio::test]
    async fn second_concurrent_read_fails_fast() {
        let (near, _far) = tokio::io::duplex(64);
        let pipe = Arc::new(FramedPipe::new(near));
        let blocked = Arc::clone(&pipe);
        let pending = tokio::spawn(async move { blocked.read_frame().await });
        tokio::task::yield_now().await;

        let err = pipe.read_frame().await.expect_err("second read");
        assert!(matches!(err, PipeError::ConcurrentRead));
        pending.abort();
    }

    #[tokio::test]
    async fn disposed_pipe_rejects_io() {
        let (near, _far) = tokio::io::duplex(64);
        let pipe = FramedPipe::new(near);
        pipe.dispose();
        assert!(matches!(
            pipe.read_frame().await,
            Err(PipeError::Disposed)
        ));
        let frame = Frame::parse("*#*1##").expect("ack");
        assert!(matches!(
            pipe.write_frame(&frame).await,
            Err(PipeError::Disposed)
        ));
    }

    #[tokio::test]
    async fn decode_error_does_not_poison_the_pipe() {
        let (near, far) = tokio::io::duplex(256);
        let pipe = FramedPipe::new(near);
        let mut far = far;
        far.write_all(b"*1*x##*#*1##").await.expect("write");

        let err = pipe.read_frame().await.expect_err("malformed frame");
        assert!(matches!(err, PipeError::Frame(_)));
        let frame = pipe
            .read_frame()
            .await
            .expect("recovered read")
            .expect("one frame");
        assert_eq!(frame.to_string(), "*#*1##");
    }
}
