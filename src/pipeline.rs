//! In-process notification bus with strict per-producer ordering.
//!
//! Producers [`publish`](Pipeline::publish) into an unbounded ingress queue;
//! a single forwarder task, bound by [`connect`](Pipeline::connect), drains
//! it into a broadcast channel in publish order. Fan-out is per-subscriber
//! buffered: a slow subscriber observes an overflow error for the
//! notifications it missed while every other subscriber keeps its complete,
//! ordered view. Notifications published before `connect` queue up.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    gateway::{Gateway, TransmissionOptions},
    message::Message,
    session::{SessionId, SessionType},
};

/// Fan-out buffer depth per subscriber.
const SUBSCRIBER_BUFFER: usize = 256;

/// Correlation id connecting an outbound submission to its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Mint a fresh, process-unique transaction id.
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 { self.0 }
}

/// Everything that travels on the bus.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A client submitted a message for transmission.
    MessageReady {
        /// Target gateway.
        gateway: Arc<Gateway>,
        /// The message to transmit.
        message: Message,
        /// Per-call transmission options.
        options: TransmissionOptions,
        /// Correlation id echoed by the outcome notification.
        transaction: TransactionId,
    },
    /// A worker transmitted the message and the gateway accepted it.
    MessageSent {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// Session that carried the message.
        session: SessionId,
        /// The transmitted message.
        message: Message,
        /// Correlation id of the submission.
        transaction: TransactionId,
    },
    /// A session decoded an inbound message.
    MessageReceived {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// Session that received the message.
        session: SessionId,
        /// Type of the receiving session.
        session_type: SessionType,
        /// The decoded message.
        message: Message,
    },
    /// The gateway answered with a busy negative acknowledgement.
    GatewayBusy {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// The rejected message.
        message: Message,
        /// Correlation id of the submission.
        transaction: TransactionId,
    },
    /// The end device rejected the action.
    InvalidAction {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// The rejected message.
        message: Message,
        /// Correlation id of the submission.
        transaction: TransactionId,
    },
    /// The gateway answered with a negative acknowledgement.
    InvalidFrame {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// The rejected message.
        message: Message,
        /// Correlation id of the submission.
        transaction: TransactionId,
    },
    /// No acknowledgement arrived within its timeout.
    NoAcknowledgmentReceived {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// The unacknowledged message.
        message: Message,
        /// Correlation id of the submission.
        transaction: TransactionId,
    },
    /// No action validation arrived within its timeout.
    NoActionReceived {
        /// Originating gateway.
        gateway: Arc<Gateway>,
        /// The unvalidated message.
        message: Message,
        /// Correlation id of the submission.
        transaction: TransactionId,
    },
}

impl Notification {
    /// The transaction this notification answers, for outcome variants.
    #[must_use]
    pub const fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::MessageReady { transaction, .. }
            | Self::MessageSent { transaction, .. }
            | Self::GatewayBusy { transaction, .. }
            | Self::InvalidAction { transaction, .. }
            | Self::InvalidFrame { transaction, .. }
            | Self::NoAcknowledgmentReceived { transaction, .. }
            | Self::NoActionReceived { transaction, .. } => Some(*transaction),
            Self::MessageReceived { .. } => None,
        }
    }
}

/// Errors raised by pipeline operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The subscriber fell behind and missed this many notifications.
    #[error("subscriber overflowed, {0} notifications dropped")]
    Overflowed(u64),
    /// The pipeline has completed.
    #[error("pipeline closed")]
    Closed,
    /// `connect` was called twice.
    #[error("pipeline already connected")]
    AlreadyConnected,
}

struct Inner {
    ingress: mpsc::UnboundedSender<Notification>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    egress: broadcast::Sender<Notification>,
    shutdown: CancellationToken,
}

/// Handle to the notification bus; cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Default for Pipeline {
    fn default() -> Self { Self::new() }
}

impl Pipeline {
    /// Create an unconnected pipeline; published notifications queue until
    /// [`Pipeline::connect`] binds the forwarder.
    #[must_use]
    pub fn new() -> Self {
        let (ingress, rx) = mpsc::unbounded_channel();
        let (egress, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Arc::new(Inner {
                ingress,
                pending: Mutex::new(Some(rx)),
                egress,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Publish a notification in this producer's order.
    ///
    /// # Errors
    /// [`PipelineError::Closed`] once the pipeline has shut down.
    pub fn publish(&self, notification: Notification) -> Result<(), PipelineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Closed);
        }
        self.inner
            .ingress
            .send(notification)
            .map_err(|_| PipelineError::Closed)
    }

    /// Bind the upstream reader and start fanning notifications out.
    ///
    /// The forwarder runs until `lifetime` is cancelled, at which point
    /// every subscriber observes completion.
    ///
    /// # Errors
    /// [`PipelineError::AlreadyConnected`] on a second call.
    pub fn connect(&self, lifetime: &CancellationToken) -> Result<(), PipelineError> {
        let mut rx = self
            .inner
            .pending
            .lock()
            .map_err(|_| PipelineError::Closed)?
            .take()
            .ok_or(PipelineError::AlreadyConnected)?;
        let inner = Arc::clone(&self.inner);
        let lifetime = lifetime.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = lifetime.cancelled() => break,
                    next = rx.recv() => match next {
                        // A send error only means no subscriber is listening
                        // right now; order is preserved regardless.
                        Some(notification) => {
                            let _ = inner.egress.send(notification);
                        }
                        None => break,
                    },
                }
            }
            debug!("pipeline forwarder stopped");
            inner.shutdown.cancel();
        });
        Ok(())
    }

    /// Subscribe to every notification published after this call.
    #[must_use]
    pub fn subscribe(&self) -> PipelineSubscription {
        PipelineSubscription {
            rx: self.inner.egress.subscribe(),
            shutdown: self.inner.shutdown.clone(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// One subscriber's ordered view of the bus.
pub struct PipelineSubscription {
    rx: broadcast::Receiver<Notification>,
    shutdown: CancellationToken,
}

impl PipelineSubscription {
    /// Receive the next notification; `Ok(None)` once the pipeline
    /// completes.
    ///
    /// # Errors
    /// [`PipelineError::Overflowed`] when this subscriber lagged; the next
    /// call resumes with the oldest retained notification.
    pub async fn recv(&mut self) -> Result<Option<Notification>, PipelineError> {
        tokio::select! {
            () = self.shutdown.cancelled() => Ok(None),
            next = self.rx.recv() => match next {
                Ok(notification) => Ok(Some(notification)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    Err(PipelineError::Overflowed(missed))
                }
                Err(broadcast::error::RecvError::Closed) => Ok(None),
            },
        }
    }
}

impl std::fmt::Debug for PipelineSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSubscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::{Gateway, Transport},
        message::{Message, Protocol},
    };

    fn test_gateway() -> Arc<Gateway> {
        Arc::new(Gateway::new(
            "test",
            Protocol::Scs,
            Transport::Tcp {
                host: "localhost".to_owned(),
                port: 20000,
            },
        ))
    }

    fn received(n: u64) -> Notification {
        Notification::MessageReceived {
            gateway: test_gateway(),
            session: SessionId::from_raw(n),
            session_type: SessionType::Command,
            message: Message::acknowledgement(Protocol::Scs),
        }
    }

    fn session_of(notification: &Notification) -> u64 {
        match notification {
            Notification::MessageReceived { session, .. } => session.as_u64(),
            _ => panic!("unexpected notification"),
        }
    }

    #[tokio::test]
    async fn preserves_publish_order_before_and_after_connect() {
        let pipeline = Pipeline::new();
        pipeline.publish(received(1)).expect("publish");
        pipeline.publish(received(2)).expect("publish");

        let mut sub = pipeline.subscribe();
        let lifetime = CancellationToken::new();
        pipeline.connect(&lifetime).expect("connect");
        pipeline.publish(received(3)).expect("publish");

        for expected in 1..=3 {
            let notification = sub
                .recv()
                .await
                .expect("recv")
                .expect("notification");
            assert_eq!(session_of(&notification), expected);
        }
        lifetime.cancel();
    }

    #[tokio::test]
    async fn second_connect_fails() {
        let pipeline = Pipeline::new();
        let lifetime = CancellationToken::new();
        pipeline.connect(&lifetime).expect("first connect");
        assert_eq!(
            pipeline.connect(&lifetime),
            Err(PipelineError::AlreadyConnected)
        );
        lifetime.cancel();
    }

    #[tokio::test]
    async fn cancellation_completes_subscribers() {
        let pipeline = Pipeline::new();
        let lifetime = CancellationToken::new();
        pipeline.connect(&lifetime).expect("connect");
        let mut sub = pipeline.subscribe();
        lifetime.cancel();
        assert_eq!(
            sub.recv().await.expect("recv completes").map(|_| ()),
            None
        );
    }

    #[tokio::test]
    async fn slow_subscriber_overflows_alone() {
        let pipeline = Pipeline::new();
        let lifetime = CancellationToken::new();
        pipeline.connect(&lifetime).expect("connect");
        let mut slow = pipeline.subscribe();
        for n in 0..(SUBSCRIBER_BUFFER as u64 + 16) {
            pipeline.publish(received(n)).expect("publish");
        }
        // Give the forwarder time to drain the ingress queue.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut fresh = pipeline.subscribe();
        pipeline.publish(received(9999)).expect("publish");

        let result = slow.recv().await;
        assert!(matches!(result, Err(PipelineError::Overflowed(_))));
        let notification = fresh
            .recv()
            .await
            .expect("fresh recv")
            .expect("notification");
        assert_eq!(session_of(&notification), 9999);
        lifetime.cancel();
    }
}
