//! Shared stub-gateway harness for the integration suite.
//!
//! Tests talk to gateways made of in-memory duplex pipes: a
//! [`StubConnector`] hands each worker a fresh stream whose far end runs a
//! scripted gateway, and the handshake helpers speak the gateway side of
//! the negotiation so scripts only deal with the traffic under test.

#![allow(dead_code, reason = "each test binary uses a subset of the harness")]

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use opennetty::{
    connection::{Connection, ConnectionError},
    frame::Frame,
    gateway::{Gateway, GatewayCapabilities, GatewayOptions, Transport},
    message::Protocol,
    pipe::FramedPipe,
    pipeline::Pipeline,
    retry::RetryOptions,
    service::OpenNettyService,
    worker::{Connector, WorkerPool},
};

type ServeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ServeFn = Arc<dyn Fn(FramedPipe, Protocol) -> ServeFuture + Send + Sync>;

/// Hands every worker connection to a scripted gateway task.
pub struct StubConnector {
    serve: ServeFn,
}

impl StubConnector {
    /// Run `serve` for every connection a worker opens.
    pub fn new<F, Fut>(serve: F) -> Arc<Self>
    where
        F: Fn(FramedPipe, Protocol) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            serve: Arc::new(move |pipe, protocol| Box::pin(serve(pipe, protocol))),
        })
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, gateway: &Gateway) -> Result<Connection, ConnectionError> {
        let (near, far) = tokio::io::duplex(4096);
        let serve = Arc::clone(&self.serve);
        let protocol = gateway.protocol();
        tokio::spawn(async move { serve(FramedPipe::new(far), protocol).await });
        Ok(Connection::from_stream(near))
    }
}

/// Gateway options tuned for fast tests; one send attempt by default so
/// failure timings stay predictable.
pub fn fast_options() -> GatewayOptions {
    GatewayOptions {
        frame_ack_timeout: Duration::from_millis(200),
        action_validation_timeout: Duration::from_millis(200),
        connection_negotiation_timeout: Duration::from_secs(2),
        unique_status_reply_timeout: Duration::from_millis(300),
        unique_dimension_reply_timeout: Duration::from_millis(300),
        multiple_status_reply_timeout: Duration::from_millis(200),
        multiple_dimension_reply_timeout: Duration::from_millis(200),
        outgoing_message_processing_timeout: Duration::from_millis(500),
        post_send_delay: Duration::from_millis(1),
        supervision: false,
        retry: RetryOptions {
            max_attempts: 1,
            delay: Duration::from_millis(5),
            ..RetryOptions::default()
        },
    }
}

/// A named test gateway with [`fast_options`].
pub fn test_gateway(name: &str, protocol: Protocol) -> Arc<Gateway> {
    Arc::new(
        Gateway::new(
            name,
            protocol,
            Transport::Tcp {
                host: "localhost".to_owned(),
                port: 20000,
            },
        )
        .with_options(fast_options())
        .with_capabilities(GatewayCapabilities::OPENWEBNET_GATEWAY),
    )
}

/// Read the next frame the client sent, panicking on stream end.
pub async fn read_frame(pipe: &FramedPipe) -> Frame {
    pipe.read_frame()
        .await
        .expect("stub read")
        .expect("client closed the stream")
}

/// Write one frame given as text.
pub async fn send_text(pipe: &FramedPipe, text: &str) {
    let frame = Frame::parse(text).expect("stub frame");
    pipe.write_frame(&frame).await.expect("stub write");
}

/// Gateway side of the Command-session handshake (no authentication).
pub async fn accept_command_session(pipe: &FramedPipe) {
    send_text(pipe, "*#*1##").await;
    let selection = read_frame(pipe).await;
    assert_eq!(selection.to_string(), "*99*9##");
    send_text(pipe, "*#*1##").await;
}

/// Gateway side of the Event-session handshake (no authentication).
pub async fn accept_event_session(pipe: &FramedPipe) {
    send_text(pipe, "*#*1##").await;
    let selection = read_frame(pipe).await;
    assert_eq!(selection.to_string(), "*99*1##");
    send_text(pipe, "*#*1##").await;
}

/// Gateway side of the non-supervised Generic-session handshake.
pub async fn accept_generic_session(pipe: &FramedPipe, protocol: Protocol) {
    let probe = read_frame(pipe).await;
    assert_eq!(probe.to_string(), "*#13**16##");
    send_text(pipe, "*#13**16*2*1*40##").await;
    if protocol != Protocol::Nitoo {
        send_text(pipe, "*#*1##").await;
    }
}

/// A connected pipeline, a worker pool over `connector`, and the service.
/// The returned pipeline handle lets tests watch the bus directly.
pub fn start_stack(
    gateways: Vec<Arc<Gateway>>,
    connector: Arc<StubConnector>,
) -> (OpenNettyService, WorkerPool, CancellationToken, Pipeline) {
    let lifetime = CancellationToken::new();
    let pipeline = Pipeline::new();
    pipeline.connect(&lifetime).expect("pipeline connect");
    let pool = WorkerPool::start_with(&gateways, &pipeline, connector, &lifetime);
    let service = OpenNettyService::new(pipeline.clone(), gateways);
    (service, pool, lifetime, pipeline)
}
