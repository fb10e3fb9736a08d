//! Negotiated, authenticated, typed channels over one connection.
//!
//! A [`Session`] owns its [`Connection`], publishes a hot stream of decoded
//! inbound messages, and serialises outbound traffic through a write permit:
//! exactly one send may be outstanding, and a second concurrent caller is a
//! programming error that fails fast. Each send walks the protocol's
//! acknowledgement state machine — write, await ACK/NACK/BUSY, optionally
//! await the end device's action validation, then hold the inter-frame
//! silence before releasing the permit.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionError},
    frame::FrameError,
    gateway::{Gateway, TransmissionOptions},
    message::{Category, Message, MessageError, MessageType, Mode, Protocol},
    pipe::PipeError,
};

pub mod auth;
mod negotiation;

/// Inbound fan-out buffer depth per subscriber.
const INBOUND_BUFFER: usize = 256;

/// WHO of a Nitoo action validation confirming the change.
const VALID_ACTION_WHO: &str = "1000";
/// WHO of a Nitoo action validation rejecting the change.
const INVALID_ACTION_WHO: &str = "1001";

/// Process-unique session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self { Self(value) }

    /// The raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 { self.0 }
}

/// The three negotiated channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    /// Accepts commands and their replies (`*99*9##`).
    Command,
    /// The general-purpose channel used by Nitoo and Zigbee gateways.
    Generic,
    /// Read-only event firehose (`*99*1##`).
    Event,
}

/// Errors raised by session negotiation and sends.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A send was attempted while another send was in flight.
    #[error("concurrent send attempted on session")]
    ConcurrentSend,
    /// The session was disposed or its transport failed.
    #[error("session disposed")]
    Disposed,
    /// The gateway answered with a busy negative acknowledgement.
    #[error("gateway busy")]
    GatewayBusy,
    /// The gateway answered with a negative acknowledgement.
    #[error("frame rejected by gateway")]
    InvalidFrame,
    /// No acknowledgement arrived within `frame_ack_timeout`.
    #[error("no acknowledgement received")]
    NoAcknowledgement,
    /// No action validation arrived within `action_validation_timeout`.
    #[error("no action validation received")]
    NoAction,
    /// The end device rejected the action.
    #[error("action rejected by the end device")]
    InvalidAction,
    /// The gateway demands authentication but no password is configured.
    #[error("gateway requires a password")]
    AuthenticationRequired,
    /// The gateway proposed a digest method this client does not speak.
    #[error("authentication method {0} unsupported")]
    AuthenticationMethodUnsupported(String),
    /// The handshake failed: wrong password, mismatched digest, or the
    /// gateway walked away mid-exchange.
    #[error("authentication failed")]
    AuthenticationInvalid,
    /// The handshake did not complete within its budget.
    #[error("session negotiation timed out")]
    NegotiationTimeout,
    /// The peer sent something the handshake grammar does not allow.
    #[error("unexpected frame during negotiation: {0}")]
    UnexpectedFrame(&'static str),
    /// Transport-level failure.
    #[error(transparent)]
    Pipe(#[from] PipeError),
    /// Classification failure.
    #[error(transparent)]
    Message(#[from] MessageError),
    /// Transport setup failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self { Self::Pipe(PipeError::Frame(err)) }
}

/// A negotiated channel over one connection.
pub struct Session {
    id: SessionId,
    gateway: Arc<Gateway>,
    session_type: SessionType,
    connection: Arc<Connection>,
    inbound: broadcast::Sender<Message>,
    permit: Arc<Mutex<()>>,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl Session {
    /// Run the handshake for `session_type` and promote the connection to a
    /// live session.
    ///
    /// The whole negotiation shares one budget
    /// (`connection_negotiation_timeout`); on failure or timeout the
    /// connection is disposed.
    ///
    /// # Errors
    /// [`SessionError::NegotiationTimeout`] when the budget elapses, the
    /// authentication errors for handshake failures, and transport errors
    /// otherwise.
    pub async fn negotiate(
        gateway: Arc<Gateway>,
        session_type: SessionType,
        connection: Connection,
    ) -> Result<Self, SessionError> {
        let budget = gateway.options().connection_negotiation_timeout;
        match timeout(budget, negotiation::run(&gateway, session_type, &connection)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                connection.dispose();
                return Err(err);
            }
            Err(_) => {
                connection.dispose();
                return Err(SessionError::NegotiationTimeout);
            }
        }
        let id = SessionId::next();
        let connection = Arc::new(connection);
        let (inbound, _) = broadcast::channel(INBOUND_BUFFER);
        let (closed_tx, closed) = watch::channel(false);
        let reader = tokio::spawn(read_loop(
            Arc::clone(&connection),
            gateway.protocol(),
            inbound.clone(),
            closed_tx,
        ));
        info!(
            gateway = gateway.name(),
            session = id.as_u64(),
            kind = ?session_type,
            "session negotiated"
        );
        Ok(Self {
            id,
            gateway,
            session_type,
            connection,
            inbound,
            permit: Arc::new(Mutex::new(())),
            closed,
            reader,
        })
    }

    /// The session identity.
    #[must_use]
    pub const fn id(&self) -> SessionId { self.id }

    /// The gateway this session talks to.
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> { &self.gateway }

    /// The negotiated channel type.
    #[must_use]
    pub const fn session_type(&self) -> SessionType { self.session_type }

    /// Subscribe to decoded inbound messages.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> { self.inbound.subscribe() }

    /// Watch for session death; the flag flips (or the channel errors) when
    /// the read loop exits.
    #[must_use]
    pub fn closed(&self) -> watch::Receiver<bool> { self.closed.clone() }

    /// Transmit one message and walk the acknowledgement state machine.
    ///
    /// The wire write runs on its own task, so cancelling this future never
    /// truncates a frame. Action validation is waited on only when the
    /// options request it *and* the message qualifies: Nitoo protocol, a
    /// BUS COMMAND or DIMENSION SET, unicast mode, address present.
    ///
    /// # Errors
    /// [`SessionError::ConcurrentSend`] when another send holds the permit,
    /// plus every outcome of the state machine: `InvalidFrame` on NACK,
    /// `GatewayBusy` on BUSY, `NoAcknowledgement` and `NoAction` on
    /// timeouts, `InvalidAction` on a rejecting validation.
    pub async fn send(
        &self,
        message: &Message,
        options: TransmissionOptions,
    ) -> Result<(), SessionError> {
        if self.connection.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let permit = Arc::clone(&self.permit)
            .try_lock_owned()
            .map_err(|_| SessionError::ConcurrentSend)?;
        let awaits_action = options.awaits_action() && action_validation_applies(message);
        let mut replies = self.inbound.subscribe();

        let connection = Arc::clone(&self.connection);
        let frame = message.frame().clone();
        debug!(session = self.id.as_u64(), %frame, "sending frame");
        let write = tokio::spawn(async move { connection.send(&frame).await });
        write.await.map_err(|_| SessionError::Disposed)??;

        let options_bundle = self.gateway.options();
        if options.awaits_acknowledgement() {
            await_acknowledgement(&mut replies, options_bundle.frame_ack_timeout).await?;
        }
        if awaits_action {
            await_action(
                &mut replies,
                options_bundle.action_validation_timeout,
                message,
            )
            .await?;
        }
        tokio::time::sleep(options_bundle.post_send_delay).await;
        drop(permit);
        Ok(())
    }

    /// Tear the session down: dispose the connection and stop the reader.
    pub fn dispose(&self) {
        self.connection.dispose();
        self.reader.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) { self.dispose(); }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("gateway", &self.gateway.name())
            .field("session_type", &self.session_type)
            .finish_non_exhaustive()
    }
}

/// Whether a message qualifies for end-device action validation.
fn action_validation_applies(message: &Message) -> bool {
    message.protocol() == Protocol::Nitoo
        && matches!(
            message.kind(),
            MessageType::BusCommand | MessageType::DimensionSet
        )
        && message.mode() == Some(Mode::Unicast)
        && message.address().is_some()
}

async fn await_acknowledgement(
    replies: &mut broadcast::Receiver<Message>,
    budget: Duration,
) -> Result<(), SessionError> {
    let wait = async {
        loop {
            match replies.recv().await {
                Ok(message) => match message.kind() {
                    MessageType::Acknowledgement => return Ok(()),
                    MessageType::NegativeAcknowledgement => {
                        return Err(SessionError::InvalidFrame);
                    }
                    MessageType::BusyNegativeAcknowledgement => {
                        return Err(SessionError::GatewayBusy);
                    }
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "acknowledgement watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SessionError::Disposed);
                }
            }
        }
    };
    timeout(budget, wait)
        .await
        .map_err(|_| SessionError::NoAcknowledgement)?
}

async fn await_action(
    replies: &mut broadcast::Receiver<Message>,
    budget: Duration,
    request: &Message,
) -> Result<(), SessionError> {
    let wait = async {
        loop {
            match replies.recv().await {
                Ok(message) => {
                    if message.kind() != MessageType::BusCommand
                        || message.address() != request.address()
                    {
                        continue;
                    }
                    match message.category().map(Category::who) {
                        Some(VALID_ACTION_WHO) => return Ok(()),
                        Some(INVALID_ACTION_WHO) => return Err(SessionError::InvalidAction),
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "action validation watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SessionError::Disposed);
                }
            }
        }
    };
    timeout(budget, wait)
        .await
        .map_err(|_| SessionError::NoAction)?
}

/// Decode inbound frames until the transport goes away.
///
/// Classification and recoverable codec failures are logged and skipped so
/// one bad frame never kills the session; only I/O errors and end of stream
/// end the loop.
async fn read_loop(
    connection: Arc<Connection>,
    protocol: Protocol,
    inbound: broadcast::Sender<Message>,
    closed: watch::Sender<bool>,
) {
    loop {
        match connection.receive().await {
            Ok(Some(frame)) => match Message::from_frame(protocol, frame) {
                Ok(message) => {
                    debug!(%message, "frame received");
                    let _ = inbound.send(message);
                }
                Err(err) => warn!(%err, "discarding unclassifiable frame"),
            },
            Ok(None) => {
                debug!("gateway closed the stream");
                break;
            }
            Err(PipeError::Frame(FrameError::Io(err))) => {
                warn!(%err, "session transport failed");
                break;
            }
            Err(PipeError::Frame(err)) => warn!(%err, "discarding malformed frame"),
            Err(_) => break,
        }
    }
    let _ = closed.send(true);
}
