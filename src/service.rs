//! Client-facing operations over the pipeline.
//!
//! Every outbound operation mints a fresh transaction, subscribes for the
//! outcome notifications carrying it *before* publishing `MessageReady`,
//! and maps the outcome onto a typed error. The retry policy of the target
//! gateway wraps the whole submission, so every attempt gets its own
//! transaction. Reply-bearing operations additionally watch
//! `MessageReceived` traffic, applying the session-type policy: SCS replies
//! ride Command sessions, Nitoo and Zigbee replies ride Generic sessions.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    gateway::{Gateway, TransmissionOptions},
    message::{
        address::Address, Category, Command, Dimension, Medium, Message, MessageError,
        MessageType, Mode, Protocol,
    },
    pipeline::{Notification, Pipeline, PipelineError, PipelineSubscription, TransactionId},
    retry::{self, RetryableFailures},
    session::SessionError,
    worker::routed_session_type,
};

/// Errors surfaced by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No configured gateway matches the requested protocol or name.
    #[error("no gateway configured for the requested protocol")]
    UnsupportedProtocol,
    /// No worker picked up the submission within its window.
    #[error("no worker picked up the message")]
    NoWorkerAvailable,
    /// No dimension reply arrived within `unique_dimension_reply_timeout`.
    #[error("no dimension reply received")]
    NoDimensionReceived,
    /// No status reply arrived within `unique_status_reply_timeout`.
    #[error("no status reply received")]
    NoStatusReceived,
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// The worker reported a send failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Message construction failed.
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The pipeline rejected the submission.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Where a message should land: address, medium and delivery mode.
#[derive(Debug, Default, Clone)]
pub struct Destination {
    /// Target address, when the operation has one.
    pub address: Option<Address>,
    /// Medium, when the protocol distinguishes several.
    pub medium: Option<Medium>,
    /// Delivery mode, for Nitoo and Zigbee.
    pub mode: Option<Mode>,
}

impl Destination {
    /// Destination with only an address.
    #[must_use]
    pub fn to(address: Address) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }

    /// Set the medium.
    #[must_use]
    pub fn with_medium(mut self, medium: Medium) -> Self {
        self.medium = Some(medium);
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Predicate narrowing which replies satisfy a reply-bearing operation.
pub type ReplyFilter<'a> = Option<&'a (dyn Fn(&Message) -> bool + Send + Sync)>;

/// The client surface of the runtime.
pub struct OpenNettyService {
    pipeline: Pipeline,
    gateways: Vec<Arc<Gateway>>,
}

impl OpenNettyService {
    /// Create a service over an already-connected pipeline and the
    /// configured gateways.
    #[must_use]
    pub fn new(pipeline: Pipeline, gateways: Vec<Arc<Gateway>>) -> Self {
        Self { pipeline, gateways }
    }

    /// Resolve the target gateway by name, or by protocol when unnamed.
    fn resolve(
        &self,
        protocol: Protocol,
        name: Option<&str>,
    ) -> Result<Arc<Gateway>, ServiceError> {
        self.gateways
            .iter()
            .find(|g| {
                name.map_or(g.protocol() == protocol, |n| {
                    g.name() == n && g.protocol() == protocol
                })
            })
            .cloned()
            .ok_or(ServiceError::UnsupportedProtocol)
    }

    /// Build and transmit a BUS COMMAND, returning once the gateway accepts
    /// it.
    #[allow(clippy::too_many_arguments, reason = "mirrors the protocol surface")]
    pub async fn execute_command(
        &self,
        protocol: Protocol,
        command: &Command,
        destination: &Destination,
        gateway: Option<&str>,
        options: TransmissionOptions,
        token: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let gateway = self.resolve(protocol, gateway)?;
        let message = Message::bus_command(
            protocol,
            command,
            destination.address.as_ref(),
            destination.medium,
            destination.mode,
        )?;
        self.submit(&gateway, message, options, token).await
    }

    /// Build and transmit a DIMENSION SET; `values` must not be empty.
    #[allow(clippy::too_many_arguments, reason = "mirrors the protocol surface")]
    pub async fn set_dimension<S: AsRef<str>>(
        &self,
        protocol: Protocol,
        dimension: &Dimension,
        values: &[S],
        destination: &Destination,
        gateway: Option<&str>,
        options: TransmissionOptions,
        token: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let gateway = self.resolve(protocol, gateway)?;
        let message = Message::dimension_set(
            protocol,
            dimension,
            values,
            destination.address.as_ref(),
            destination.medium,
            destination.mode,
        )?;
        self.submit(&gateway, message, options, token).await
    }

    /// Request a dimension and return the values of the first matching
    /// DIMENSION READ reply.
    ///
    /// The default filter accepts replies carrying the identical dimension
    /// category and code; the reply must also originate at the request's
    /// address.
    #[allow(clippy::too_many_arguments, reason = "mirrors the protocol surface")]
    pub async fn get_dimension(
        &self,
        protocol: Protocol,
        dimension: &Dimension,
        destination: &Destination,
        gateway: Option<&str>,
        options: TransmissionOptions,
        filter: ReplyFilter<'_>,
        token: &CancellationToken,
    ) -> Result<Vec<String>, ServiceError> {
        let gateway = self.resolve(protocol, gateway)?;
        let request = Message::dimension_request(
            protocol,
            dimension,
            destination.address.as_ref(),
            destination.medium,
            destination.mode,
        )?;
        let mut replies = self.pipeline.subscribe();
        self.submit(&gateway, request.clone(), options, token).await?;

        let budget = gateway.options().unique_dimension_reply_timeout;
        let accept = |message: &Message| {
            message.kind() == MessageType::DimensionRead
                && message.address() == request.address()
                && filter.map_or_else(
                    || same_dimension(message, &request),
                    |predicate| predicate(message),
                )
        };
        let reply = self
            .await_reply(&gateway, &mut replies, budget, &accept, token)
            .await?
            .ok_or(ServiceError::NoDimensionReceived)?;
        Ok(reply.values().to_vec())
    }

    /// Request a status and return the first matching BUS COMMAND reply.
    ///
    /// The default filter accepts replies of the requested category.
    #[allow(clippy::too_many_arguments, reason = "mirrors the protocol surface")]
    pub async fn get_status(
        &self,
        protocol: Protocol,
        category: &Category,
        destination: &Destination,
        gateway: Option<&str>,
        options: TransmissionOptions,
        filter: ReplyFilter<'_>,
        token: &CancellationToken,
    ) -> Result<Message, ServiceError> {
        let gateway = self.resolve(protocol, gateway)?;
        let request = Message::status_request(
            protocol,
            category,
            destination.address.as_ref(),
            destination.medium,
            destination.mode,
        )?;
        let mut replies = self.pipeline.subscribe();
        self.submit(&gateway, request.clone(), options, token).await?;

        let budget = gateway.options().unique_status_reply_timeout;
        let wanted = category.who().to_owned();
        let accept = |message: &Message| {
            message.kind() == MessageType::BusCommand
                && filter.map_or_else(
                    || message.category().is_some_and(|c| c.who() == wanted),
                    |predicate| predicate(message),
                )
        };
        self.await_reply(&gateway, &mut replies, budget, &accept, token)
            .await?
            .ok_or(ServiceError::NoStatusReceived)
    }

    /// Request a dimension and collect every DIMENSION READ reply until the
    /// gateway's terminating acknowledgement.
    ///
    /// The outbound request runs with acknowledgement validation disabled:
    /// here the ACK is the semantic end-of-enumeration marker, not a
    /// transport receipt. A NACK or BUSY NACK mid-stream aborts; a silent
    /// gap of `multiple_dimension_reply_timeout` completes the enumeration
    /// normally.
    #[allow(clippy::too_many_arguments, reason = "mirrors the protocol surface")]
    pub async fn enumerate_dimensions(
        &self,
        protocol: Protocol,
        dimension: &Dimension,
        destination: &Destination,
        gateway: Option<&str>,
        options: TransmissionOptions,
        filter: ReplyFilter<'_>,
        token: &CancellationToken,
    ) -> Result<Vec<Message>, ServiceError> {
        let gateway = self.resolve(protocol, gateway)?;
        let request = Message::dimension_request(
            protocol,
            dimension,
            destination.address.as_ref(),
            destination.medium,
            destination.mode,
        )?;
        let accept = |message: &Message| {
            message.kind() == MessageType::DimensionRead
                && filter.map_or_else(
                    || same_dimension(message, &request),
                    |predicate| predicate(message),
                )
        };
        let gap = gateway.options().multiple_dimension_reply_timeout;
        self.enumerate(&gateway, request.clone(), options, gap, &accept, token)
            .await
    }

    /// Request a status and collect every BUS COMMAND reply until the
    /// gateway's terminating acknowledgement, with the same termination
    /// rules as [`OpenNettyService::enumerate_dimensions`].
    #[allow(clippy::too_many_arguments, reason = "mirrors the protocol surface")]
    pub async fn enumerate_statuses(
        &self,
        protocol: Protocol,
        category: &Category,
        destination: &Destination,
        gateway: Option<&str>,
        options: TransmissionOptions,
        filter: ReplyFilter<'_>,
        token: &CancellationToken,
    ) -> Result<Vec<Message>, ServiceError> {
        let gateway = self.resolve(protocol, gateway)?;
        let request = Message::status_request(
            protocol,
            category,
            destination.address.as_ref(),
            destination.medium,
            destination.mode,
        )?;
        let wanted = category.who().to_owned();
        let accept = |message: &Message| {
            message.kind() == MessageType::BusCommand
                && filter.map_or_else(
                    || message.category().is_some_and(|c| c.who() == wanted),
                    |predicate| predicate(message),
                )
        };
        let gap = gateway.options().multiple_status_reply_timeout;
        self.enumerate(&gateway, request.clone(), options, gap, &accept, token)
            .await
    }

    /// Observe BUS COMMAND traffic for a protocol, optionally narrowed to
    /// one category or one gateway.
    #[must_use]
    pub fn observe_statuses(
        &self,
        protocol: Protocol,
        category: Option<Category>,
        gateway: Option<&str>,
    ) -> Observation {
        let gateway = gateway.map(ToOwned::to_owned);
        self.observe(move |message, gateway_name| {
            message.protocol() == protocol
                && message.kind() == MessageType::BusCommand
                && category
                    .as_ref()
                    .is_none_or(|c| message.category().is_some_and(|mc| mc.who() == c.who()))
                && gateway.as_deref().is_none_or(|g| g == gateway_name)
        })
    }

    /// Observe DIMENSION READ traffic for a protocol, optionally narrowed
    /// to one category or one gateway.
    #[must_use]
    pub fn observe_dimensions(
        &self,
        protocol: Protocol,
        category: Option<Category>,
        gateway: Option<&str>,
    ) -> Observation {
        let gateway = gateway.map(ToOwned::to_owned);
        self.observe(move |message, gateway_name| {
            message.protocol() == protocol
                && message.kind() == MessageType::DimensionRead
                && category
                    .as_ref()
                    .is_none_or(|c| message.category().is_some_and(|mc| mc.who() == c.who()))
                && gateway.as_deref().is_none_or(|g| g == gateway_name)
        })
    }

    /// Observe every non-acknowledgement message for a protocol.
    #[must_use]
    pub fn observe_events(&self, protocol: Protocol, gateway: Option<&str>) -> Observation {
        let gateway = gateway.map(ToOwned::to_owned);
        self.observe(move |message, gateway_name| {
            message.protocol() == protocol
                && !message.is_acknowledgement_kind()
                && gateway.as_deref().is_none_or(|g| g == gateway_name)
        })
    }

    /// Route a caller-built message through the workers.
    pub async fn send_message(
        &self,
        message: Message,
        gateway: Option<&str>,
        options: TransmissionOptions,
        token: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let gateway = self.resolve(message.protocol(), gateway)?;
        self.submit(&gateway, message, options, token).await
    }

    fn observe(
        &self,
        predicate: impl Fn(&Message, &str) -> bool + Send + Sync + 'static,
    ) -> Observation {
        Observation {
            subscription: self.pipeline.subscribe(),
            filter: Box::new(move |notification| match notification {
                Notification::MessageReceived {
                    gateway,
                    session_type,
                    message,
                    ..
                } if *session_type == routed_session_type(gateway.protocol())
                    && predicate(message, gateway.name()) =>
                {
                    Some(message.clone())
                }
                _ => None,
            }),
        }
    }

    /// Submit under the gateway's retry policy; every attempt gets a fresh
    /// transaction.
    async fn submit(
        &self,
        gateway: &Arc<Gateway>,
        message: Message,
        options: TransmissionOptions,
        token: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let single_shot = options.contains(TransmissionOptions::DISALLOW_RETRANSMISSIONS);
        retry::execute(
            &gateway.options().retry,
            single_shot,
            classify_retryable,
            || self.submit_once(gateway, message.clone(), options, token),
        )
        .await
    }

    async fn submit_once(
        &self,
        gateway: &Arc<Gateway>,
        message: Message,
        options: TransmissionOptions,
        token: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let transaction = TransactionId::next();
        let mut outcomes = self.pipeline.subscribe();
        self.pipeline.publish(Notification::MessageReady {
            gateway: Arc::clone(gateway),
            message,
            options,
            transaction,
        })?;

        // Worker pickup is not separately observable, so the safeguard
        // window spans pickup plus the send state machine.
        let bundle = gateway.options();
        let deadline = bundle.outgoing_message_processing_timeout
            + bundle.frame_ack_timeout
            + bundle.action_validation_timeout
            + bundle.post_send_delay;
        let wait = async {
            loop {
                match outcomes.recv().await {
                    Ok(Some(notification)) => {
                        if let Some(outcome) = outcome_of(&notification, transaction) {
                            return outcome;
                        }
                    }
                    Ok(None) => return Err(ServiceError::Pipeline(PipelineError::Closed)),
                    Err(err) => warn!(%err, "outcome watch overflowed"),
                }
            }
        };
        tokio::select! {
            () = token.cancelled() => Err(ServiceError::Cancelled),
            result = timeout(deadline, wait) => {
                result.map_err(|_| ServiceError::NoWorkerAvailable)?
            }
        }
    }

    /// Wait for the first accepted `MessageReceived` reply within `budget`.
    async fn await_reply(
        &self,
        gateway: &Arc<Gateway>,
        replies: &mut PipelineSubscription,
        budget: Duration,
        accept: &(dyn Fn(&Message) -> bool + Sync),
        token: &CancellationToken,
    ) -> Result<Option<Message>, ServiceError> {
        let wait = async {
            loop {
                match replies.recv().await {
                    Ok(Some(notification)) => {
                        if let Some(message) = reply_of(&notification, gateway) {
                            if accept(&message) {
                                return Ok(Some(message));
                            }
                        }
                    }
                    Ok(None) => return Ok(None),
                    Err(err) => warn!(%err, "reply watch overflowed"),
                }
            }
        };
        tokio::select! {
            () = token.cancelled() => Err(ServiceError::Cancelled),
            result = timeout(budget, wait) => match result {
                Ok(reply) => reply,
                Err(_) => Ok(None),
            },
        }
    }

    /// Run a multi-reply request terminated by the gateway's ACK.
    async fn enumerate(
        &self,
        gateway: &Arc<Gateway>,
        request: Message,
        options: TransmissionOptions,
        gap: Duration,
        accept: &(dyn Fn(&Message) -> bool + Sync),
        token: &CancellationToken,
    ) -> Result<Vec<Message>, ServiceError> {
        let mut replies = self.pipeline.subscribe();
        let options = options | TransmissionOptions::DISABLE_ACKNOWLEDGEMENT_VALIDATION;
        self.submit(gateway, request, options, token).await?;

        let mut items = Vec::new();
        loop {
            let next = tokio::select! {
                () = token.cancelled() => return Err(ServiceError::Cancelled),
                next = timeout(gap, replies.recv()) => next,
            };
            let Ok(received) = next else {
                // The stream went quiet; the enumeration is complete.
                return Ok(items);
            };
            match received {
                Ok(Some(notification)) => {
                    let Some(message) = reply_of(&notification, gateway) else {
                        continue;
                    };
                    match message.kind() {
                        MessageType::Acknowledgement => return Ok(items),
                        MessageType::NegativeAcknowledgement => {
                            return Err(SessionError::InvalidFrame.into());
                        }
                        MessageType::BusyNegativeAcknowledgement => {
                            return Err(SessionError::GatewayBusy.into());
                        }
                        _ if accept(&message) => items.push(message),
                        _ => {}
                    }
                }
                Ok(None) => return Ok(items),
                Err(err) => warn!(%err, "enumeration watch overflowed"),
            }
        }
    }
}

impl std::fmt::Debug for OpenNettyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenNettyService")
            .field("gateways", &self.gateways.len())
            .finish_non_exhaustive()
    }
}

/// A filtered, retrying view of inbound traffic.
pub struct Observation {
    subscription: PipelineSubscription,
    filter: Box<dyn Fn(&Notification) -> Option<Message> + Send + Sync>,
}

impl Observation {
    /// The next matching message, or `None` once the pipeline completes.
    /// Overflow is logged and the observation resumes.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.subscription.recv().await {
                Ok(Some(notification)) => {
                    if let Some(message) = (self.filter)(&notification) {
                        return Some(message);
                    }
                }
                Ok(None) => return None,
                Err(err) => warn!(%err, "observation overflowed, resubscribing"),
            }
        }
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation").finish_non_exhaustive()
    }
}

/// Map a notification onto the outcome of `transaction`, if it is one.
fn outcome_of(
    notification: &Notification,
    transaction: TransactionId,
) -> Option<Result<(), ServiceError>> {
    if matches!(notification, Notification::MessageReady { .. })
        || notification.transaction() != Some(transaction)
    {
        return None;
    }
    Some(match notification {
        Notification::MessageSent { .. } => Ok(()),
        Notification::GatewayBusy { .. } => Err(SessionError::GatewayBusy.into()),
        Notification::InvalidAction { .. } => Err(SessionError::InvalidAction.into()),
        Notification::InvalidFrame { .. } => Err(SessionError::InvalidFrame.into()),
        Notification::NoAcknowledgmentReceived { .. } => {
            Err(SessionError::NoAcknowledgement.into())
        }
        Notification::NoActionReceived { .. } => Err(SessionError::NoAction.into()),
        Notification::MessageReady { .. } | Notification::MessageReceived { .. } => {
            return None;
        }
    })
}

/// Extract the message of a `MessageReceived` that followed the session-type
/// routing policy for `gateway`.
fn reply_of(notification: &Notification, gateway: &Arc<Gateway>) -> Option<Message> {
    match notification {
        Notification::MessageReceived {
            gateway: origin,
            session_type,
            message,
            ..
        } if origin.name() == gateway.name()
            && *session_type == routed_session_type(gateway.protocol()) =>
        {
            Some(message.clone())
        }
        _ => None,
    }
}

/// Compare the dimension identity (category and code) of a reply against
/// the request's.
fn same_dimension(reply: &Message, request: &Message) -> bool {
    let identity =
        |m: &Message| m.dimension().map(|d| (d.category().who().to_owned(), d.code().to_owned()));
    identity(reply) == identity(request)
}

fn classify_retryable(err: &ServiceError) -> Option<RetryableFailures> {
    match err {
        ServiceError::Session(SessionError::GatewayBusy) => {
            Some(RetryableFailures::GATEWAY_BUSY)
        }
        ServiceError::Session(SessionError::NoAcknowledgement) => {
            Some(RetryableFailures::NO_ACKNOWLEDGEMENT)
        }
        ServiceError::Session(SessionError::NoAction) => Some(RetryableFailures::NO_ACTION),
        _ => None,
    }
}
