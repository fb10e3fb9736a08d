//! Byte-stream transports towards a gateway.
//!
//! A [`Connection`] opens the transport named by a gateway's descriptor —
//! a TCP socket with Nagle disabled and tuned keep-alive, or a serial port
//! configured from the descriptor's four knobs — drops whatever the peer
//! buffered before we arrived, and exposes the stream as a [`FramedPipe`].

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};
use tracing::debug;

use crate::{
    frame::Frame,
    gateway::{Gateway, Transport},
    pipe::{ByteStream, FramedPipe, PipeError},
};

/// TCP keep-alive idle time before probing.
const KEEPALIVE_TIME: Duration = Duration::from_secs(2);
/// TCP keep-alive probe interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// TCP keep-alive probe budget.
const KEEPALIVE_RETRIES: u32 = 2;

/// Errors raised while opening a transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serial port setup failed.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// One open byte pipe towards a gateway.
#[derive(Debug)]
pub struct Connection {
    pipe: FramedPipe,
}

impl Connection {
    /// Open the transport named by the gateway's descriptor.
    ///
    /// # Errors
    /// [`ConnectionError`] when the socket or serial port cannot be opened
    /// or tuned.
    pub async fn open(gateway: &Gateway) -> Result<Self, ConnectionError> {
        match gateway.transport() {
            Transport::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                let keepalive = TcpKeepalive::new()
                    .with_time(KEEPALIVE_TIME)
                    .with_interval(KEEPALIVE_INTERVAL)
                    .with_retries(KEEPALIVE_RETRIES);
                SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
                debug!(gateway = gateway.name(), %host, port = *port, "tcp transport open");
                Ok(Self::from_stream(stream))
            }
            Transport::Serial {
                path,
                baud_rate,
                parity,
                data_bits,
                stop_bits,
            } => {
                let port = tokio_serial::new(path.as_str(), *baud_rate)
                    .parity(*parity)
                    .data_bits(*data_bits)
                    .stop_bits(*stop_bits)
                    .open_native_async()?;
                port.clear(ClearBuffer::All)?;
                debug!(gateway = gateway.name(), %path, baud_rate = *baud_rate, "serial transport open");
                Ok(Self::from_stream(port))
            }
        }
    }

    /// Adopt an already-open byte stream (in-memory pipes in tests, for
    /// instance).
    #[must_use]
    pub fn from_stream(stream: impl ByteStream + 'static) -> Self {
        Self {
            pipe: FramedPipe::new(stream),
        }
    }

    /// Receive the next frame; `Ok(None)` at end of stream.
    ///
    /// # Errors
    /// As [`FramedPipe::read_frame`].
    pub async fn receive(&self) -> Result<Option<Frame>, PipeError> {
        self.pipe.read_frame().await
    }

    /// Send one frame.
    ///
    /// # Errors
    /// As [`FramedPipe::write_frame`].
    pub async fn send(&self, frame: &Frame) -> Result<(), PipeError> {
        self.pipe.write_frame(frame).await
    }

    /// Release the transport; pending and future operations fail fast.
    pub fn dispose(&self) { self.pipe.dispose(); }

    /// Whether the connection has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool { self.pipe.is_disposed() }
}
