//! Per-gateway supervisors that keep sessions alive and move traffic.
//!
//! The pool spawns one long-lived task per required session type per
//! gateway. Each task negotiates its session, pumps inbound messages onto
//! the pipeline as `MessageReceived`, and — when its session type is the
//! routing target for the gateway's protocol — picks up matching
//! `MessageReady` notifications, transmits them, and publishes the outcome
//! carrying the submitter's transaction. Fatal session errors tear the
//! session down and rebuild it under exponential backoff.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionError},
    gateway::{Gateway, GatewayCapabilities, TransmissionOptions},
    message::{Message, Protocol},
    pipeline::{Notification, Pipeline, PipelineError, PipelineSubscription, TransactionId},
    session::{Session, SessionError, SessionType},
};

/// Opens the byte transport for a gateway.
///
/// The pool ships with [`TransportConnector`]; tests plug in-memory duplex
/// streams through their own implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh transport towards `gateway`.
    async fn connect(&self, gateway: &Gateway) -> Result<Connection, ConnectionError>;
}

/// The production connector: TCP sockets and serial ports per the
/// gateway's transport descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, gateway: &Gateway) -> Result<Connection, ConnectionError> {
        Connection::open(gateway).await
    }
}

/// First reconnect delay after a session failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The session type that carries outbound traffic for a protocol.
#[must_use]
pub const fn routed_session_type(protocol: Protocol) -> SessionType {
    match protocol {
        Protocol::Scs => SessionType::Command,
        Protocol::Nitoo | Protocol::Zigbee => SessionType::Generic,
    }
}

/// The session types a gateway needs workers for: the protocol's routing
/// target plus whatever its capability set enables on top.
#[must_use]
pub fn required_session_types(gateway: &Gateway) -> Vec<SessionType> {
    let mut types = vec![routed_session_type(gateway.protocol())];
    let capabilities = gateway.capabilities();
    if capabilities.contains(GatewayCapabilities::COMMAND_SESSION)
        && !types.contains(&SessionType::Command)
    {
        types.push(SessionType::Command);
    }
    if capabilities.contains(GatewayCapabilities::GENERIC_SESSION)
        && !types.contains(&SessionType::Generic)
    {
        types.push(SessionType::Generic);
    }
    if capabilities.contains(GatewayCapabilities::EVENT_SESSION) {
        types.push(SessionType::Event);
    }
    types
}

/// Supervisor for every configured gateway.
pub struct WorkerPool {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the workers for `gateways` over real transports.
    ///
    /// Workers stop when `lifetime` is cancelled.
    #[must_use]
    pub fn start(
        gateways: &[Arc<Gateway>],
        pipeline: &Pipeline,
        lifetime: &CancellationToken,
    ) -> Self {
        Self::start_with(gateways, pipeline, Arc::new(TransportConnector), lifetime)
    }

    /// Spawn the workers with a custom [`Connector`].
    #[must_use]
    pub fn start_with(
        gateways: &[Arc<Gateway>],
        pipeline: &Pipeline,
        connector: Arc<dyn Connector>,
        lifetime: &CancellationToken,
    ) -> Self {
        let token = lifetime.child_token();
        let mut tasks = Vec::new();
        for gateway in gateways {
            for session_type in required_session_types(gateway) {
                // Subscribe before spawning so a submission published right
                // after start cannot slip past the worker.
                let submissions = pipeline.subscribe();
                tasks.push(tokio::spawn(worker_loop(
                    Arc::clone(gateway),
                    session_type,
                    pipeline.clone(),
                    submissions,
                    Arc::clone(&connector),
                    token.clone(),
                )));
            }
        }
        info!(workers = tasks.len(), "worker pool started");
        Self { token, tasks }
    }

    /// Stop every worker and wait for them to wind down.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

async fn worker_loop(
    gateway: Arc<Gateway>,
    session_type: SessionType,
    pipeline: Pipeline,
    // Held across renegotiations so submissions arriving while the session
    // is being (re)built are buffered, not lost.
    mut submissions: PipelineSubscription,
    connector: Arc<dyn Connector>,
    token: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    while !token.is_cancelled() {
        let session = match connect(&gateway, session_type, connector.as_ref()).await {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!(
                    gateway = gateway.name(),
                    kind = ?session_type,
                    %err,
                    "session negotiation failed, backing off"
                );
                tokio::select! {
                    () = token.cancelled() => return,
                    () = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        let pump = tokio::spawn(pump_inbound(Arc::clone(&session), pipeline.clone()));
        let alive = serve_outbound(&session, &pipeline, &mut submissions, &token).await;
        pump.abort();
        session.dispose();
        if !alive {
            return;
        }
        debug!(
            gateway = gateway.name(),
            kind = ?session_type,
            "session ended, renegotiating"
        );
    }
}

async fn connect(
    gateway: &Arc<Gateway>,
    session_type: SessionType,
    connector: &dyn Connector,
) -> Result<Session, SessionError> {
    let connection = connector.connect(gateway).await?;
    Session::negotiate(Arc::clone(gateway), session_type, connection).await
}

/// Forward decoded inbound messages onto the pipeline.
async fn pump_inbound(session: Arc<Session>, pipeline: Pipeline) {
    let mut inbound = session.subscribe();
    loop {
        match inbound.recv().await {
            Ok(message) => {
                let published = pipeline.publish(Notification::MessageReceived {
                    gateway: Arc::clone(session.gateway()),
                    session: session.id(),
                    session_type: session.session_type(),
                    message,
                });
                if published.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "inbound pump lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Serve outbound submissions until the session dies, the pipeline closes
/// or the pool shuts down. Returns whether the worker should renegotiate.
async fn serve_outbound(
    session: &Arc<Session>,
    pipeline: &Pipeline,
    submissions: &mut PipelineSubscription,
    token: &CancellationToken,
) -> bool {
    let mut closed = session.closed();
    let routes = session.session_type() == routed_session_type(session.gateway().protocol());
    if !routes {
        // Event sessions (and any extra capability session) are read-only.
        tokio::select! {
            () = token.cancelled() => return false,
            _ = closed.changed() => return true,
        }
    }
    loop {
        tokio::select! {
            () = token.cancelled() => return false,
            _ = closed.changed() => return true,
            next = submissions.recv() => match next {
                Ok(Some(Notification::MessageReady {
                    gateway,
                    message,
                    options,
                    transaction,
                })) if gateway.name() == session.gateway().name() => {
                    let fatal =
                        transmit(session, pipeline, message, options, transaction).await;
                    if fatal {
                        return !token.is_cancelled();
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return false,
                Err(PipelineError::Overflowed(missed)) => {
                    warn!(missed, "outbound worker lagged, submissions dropped");
                }
                Err(_) => return false,
            },
        }
    }
}

/// Send one submission and publish its outcome. Returns whether the session
/// failed fatally and must be rebuilt.
async fn transmit(
    session: &Arc<Session>,
    pipeline: &Pipeline,
    message: Message,
    options: TransmissionOptions,
    transaction: TransactionId,
) -> bool {
    let gateway = Arc::clone(session.gateway());
    let (notification, fatal) = match session.send(&message, options).await {
        Ok(()) => (
            Notification::MessageSent {
                gateway,
                session: session.id(),
                message,
                transaction,
            },
            false,
        ),
        Err(SessionError::GatewayBusy) => (
            Notification::GatewayBusy {
                gateway,
                message,
                transaction,
            },
            false,
        ),
        Err(SessionError::InvalidFrame) => (
            Notification::InvalidFrame {
                gateway,
                message,
                transaction,
            },
            false,
        ),
        Err(SessionError::InvalidAction) => (
            Notification::InvalidAction {
                gateway,
                message,
                transaction,
            },
            false,
        ),
        Err(SessionError::NoAcknowledgement) => (
            Notification::NoAcknowledgmentReceived {
                gateway,
                message,
                transaction,
            },
            false,
        ),
        Err(SessionError::NoAction) => (
            Notification::NoActionReceived {
                gateway,
                message,
                transaction,
            },
            false,
        ),
        Err(err) => {
            warn!(%err, "send failed, rebuilding session");
            (
                Notification::NoAcknowledgmentReceived {
                    gateway,
                    message,
                    transaction,
                },
                true,
            )
        }
    };
    let _ = pipeline.publish(notification);
    fatal
}
