//! End-to-end service flows over a worker pool and scripted gateways.

mod common;

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{
    accept_command_session, accept_generic_session, read_frame, send_text, start_stack,
    test_gateway, StubConnector,
};
use opennetty::{
    gateway::TransmissionOptions,
    message::{address::Address, Category, Command, Dimension, Message, MessageType, Mode, Protocol},
    pipeline::{Notification, Pipeline, TransactionId},
    service::{Destination, OpenNettyService, ServiceError},
    session::SessionError,
};
use tokio_util::sync::CancellationToken;

fn lighting_off() -> Command {
    Command::new(Category::lighting(), "0").expect("command")
}

fn area_destination() -> Destination {
    Destination::to(Address::scs_area(7).expect("area"))
}

/// Collect the transactions of `MessageReady` and `MessageSent` seen on the
/// bus while `work` runs.
async fn sent_transactions(
    pipeline: &Pipeline,
    work: impl std::future::Future<Output = ()>,
) -> (Vec<TransactionId>, Vec<TransactionId>) {
    let mut sub = pipeline.subscribe();
    work.await;
    let mut ready = Vec::new();
    let mut sent = Vec::new();
    while let Ok(Ok(Some(notification))) =
        tokio::time::timeout(Duration::from_millis(100), sub.recv()).await
    {
        match notification {
            Notification::MessageReady { transaction, .. } => ready.push(transaction),
            Notification::MessageSent { transaction, .. } => sent.push(transaction),
            _ => {}
        }
    }
    (ready, sent)
}

#[tokio::test]
async fn executed_command_reaches_the_wire_and_reports_sent() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let request = read_frame(&pipe).await;
        assert_eq!(request.to_string(), "*1*0*7##");
        send_text(&pipe, "*#*1##").await;
    });
    let (service, pool, lifetime, pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let token = CancellationToken::new();
    let (ready, sent) = sent_transactions(&pipeline, async {
        service
            .execute_command(
                Protocol::Scs,
                &lighting_off(),
                &area_destination(),
                None,
                TransmissionOptions::default(),
                &token,
            )
            .await
            .expect("command accepted");
    })
    .await;

    assert_eq!(sent.len(), 1, "exactly one MessageSent");
    assert_eq!(ready, sent, "the outcome echoes the submission transaction");
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn set_dimension_writes_the_marked_frame() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let request = read_frame(&pipe).await;
        assert_eq!(request.to_string(), "*#1*7*#1*100##");
        send_text(&pipe, "*#*1##").await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let dimension = Dimension::new(Category::lighting(), "1").expect("dimension");
    service
        .set_dimension(
            Protocol::Scs,
            &dimension,
            &["100"],
            &area_destination(),
            None,
            TransmissionOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("dimension written");
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn get_dimension_returns_the_matching_reply_values() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let request = read_frame(&pipe).await;
        assert_eq!(request.to_string(), "*#1*7*1##");
        send_text(&pipe, "*#*1##").await;
        send_text(&pipe, "*#1*7*1*42*13##").await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let dimension = Dimension::new(Category::lighting(), "1").expect("dimension");
    let values = service
        .get_dimension(
            Protocol::Scs,
            &dimension,
            &area_destination(),
            None,
            TransmissionOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("dimension reply");
    assert_eq!(values, ["42", "13"]);
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn get_dimension_without_reply_fails_with_no_dimension_received() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let _ = read_frame(&pipe).await;
        send_text(&pipe, "*#*1##").await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let dimension = Dimension::new(Category::lighting(), "1").expect("dimension");
    let err = service
        .get_dimension(
            Protocol::Scs,
            &dimension,
            &area_destination(),
            None,
            TransmissionOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("no reply scripted");
    assert!(matches!(err, ServiceError::NoDimensionReceived));
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn get_status_returns_the_matching_bus_command() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let request = read_frame(&pipe).await;
        assert_eq!(request.to_string(), "*#1*7##");
        send_text(&pipe, "*#*1##").await;
        send_text(&pipe, "*1*1*7##").await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let status = service
        .get_status(
            Protocol::Scs,
            &Category::lighting(),
            &area_destination(),
            None,
            TransmissionOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("status reply");
    assert_eq!(status.kind(), MessageType::BusCommand);
    assert_eq!(status.command().expect("command").what(), "1");
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn enumeration_collects_replies_until_the_acknowledgement() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let _ = read_frame(&pipe).await;
        send_text(&pipe, "*#1*11*1*100##").await;
        send_text(&pipe, "*#1*12*1*50##").await;
        send_text(&pipe, "*#*1##").await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let dimension = Dimension::new(Category::lighting(), "1").expect("dimension");
    let replies = service
        .enumerate_dimensions(
            Protocol::Scs,
            &dimension,
            &Destination::default(),
            None,
            TransmissionOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("enumeration");
    let values: Vec<&[String]> = replies.iter().map(Message::values).collect();
    assert_eq!(values, [&["100".to_owned()][..], &["50".to_owned()][..]]);
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn enumeration_aborts_on_a_negative_acknowledgement() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let _ = read_frame(&pipe).await;
        send_text(&pipe, "*#1*11*1*100##").await;
        send_text(&pipe, "*#*0##").await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let dimension = Dimension::new(Category::lighting(), "1").expect("dimension");
    let err = service
        .enumerate_dimensions(
            Protocol::Scs,
            &dimension,
            &Destination::default(),
            None,
            TransmissionOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("NACK mid-stream");
    assert!(matches!(
        err,
        ServiceError::Session(SessionError::InvalidFrame)
    ));
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn silent_enumeration_completes_empty() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        let _ = read_frame(&pipe).await;
        // No replies at all; the enumeration must end on the gap timeout.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let replies = service
        .enumerate_statuses(
            Protocol::Scs,
            &Category::lighting(),
            &Destination::default(),
            None,
            TransmissionOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("quiet enumeration completes");
    assert!(replies.is_empty());
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn busy_gateway_is_retried_until_it_accepts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let connector = StubConnector::new(move |pipe, protocol| {
        let seen = Arc::clone(&seen);
        async move {
            accept_generic_session(&pipe, protocol).await;
            loop {
                let Ok(Some(_)) = pipe.read_frame().await else { break };
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    send_text(&pipe, "*#*6##").await;
                } else {
                    send_text(&pipe, "*#*1##").await;
                }
            }
        }
    });
    let gateway = Arc::new(
        Arc::unwrap_or_clone(test_gateway("play", Protocol::Zigbee)).with_options({
            let mut options = common::fast_options();
            options.retry.max_attempts = 3;
            options
        }),
    );
    let (service, pool, lifetime, _pipeline) = start_stack(vec![gateway], connector);

    let target = Address::from_zigbee(12345, 7).expect("address");
    service
        .execute_command(
            Protocol::Zigbee,
            &Command::new(Category::lighting(), "1").expect("command"),
            &Destination::to(target).with_mode(Mode::Unicast),
            None,
            TransmissionOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("retry wins");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn disallowed_retransmissions_stop_after_one_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let connector = StubConnector::new(move |pipe, protocol| {
        let seen = Arc::clone(&seen);
        async move {
            accept_generic_session(&pipe, protocol).await;
            loop {
                let Ok(Some(_)) = pipe.read_frame().await else { break };
                seen.fetch_add(1, Ordering::SeqCst);
                send_text(&pipe, "*#*6##").await;
            }
        }
    });
    let gateway = Arc::new(
        Arc::unwrap_or_clone(test_gateway("play", Protocol::Zigbee)).with_options({
            let mut options = common::fast_options();
            options.retry.max_attempts = 3;
            options
        }),
    );
    let (service, pool, lifetime, _pipeline) = start_stack(vec![gateway], connector);

    let target = Address::from_zigbee(12345, 7).expect("address");
    let err = service
        .execute_command(
            Protocol::Zigbee,
            &Command::new(Category::lighting(), "1").expect("command"),
            &Destination::to(target).with_mode(Mode::Unicast),
            None,
            TransmissionOptions::DISALLOW_RETRANSMISSIONS,
            &CancellationToken::new(),
        )
        .await
        .expect_err("single attempt only");
    assert!(matches!(
        err,
        ServiceError::Session(SessionError::GatewayBusy)
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    lifetime.cancel();
    pool.shutdown().await;
}

#[tokio::test]
async fn submission_without_workers_reports_no_worker_available() {
    let lifetime = CancellationToken::new();
    let pipeline = Pipeline::new();
    pipeline.connect(&lifetime).expect("connect");
    let service = OpenNettyService::new(
        pipeline,
        vec![test_gateway("lonely", Protocol::Scs)],
    );

    let err = service
        .execute_command(
            Protocol::Scs,
            &lighting_off(),
            &area_destination(),
            None,
            TransmissionOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("nobody serves the gateway");
    assert!(matches!(err, ServiceError::NoWorkerAvailable));
    lifetime.cancel();
}

#[tokio::test]
async fn observations_follow_the_session_policy_filters() {
    let connector = StubConnector::new(|pipe, _| async move {
        accept_command_session(&pipe).await;
        // Leave the observers time to subscribe, then push unsolicited
        // traffic: one status, one dimension read, one ack.
        tokio::time::sleep(Duration::from_millis(200)).await;
        send_text(&pipe, "*1*1*21##").await;
        send_text(&pipe, "*#1*21*1*80##").await;
        send_text(&pipe, "*#*1##").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let (service, pool, lifetime, _pipeline) =
        start_stack(vec![test_gateway("attic", Protocol::Scs)], connector);

    let mut statuses = service.observe_statuses(Protocol::Scs, Some(Category::lighting()), None);
    let mut events = service.observe_events(Protocol::Scs, None);

    let status = tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("status in time")
        .expect("one status");
    assert_eq!(status.kind(), MessageType::BusCommand);

    // Events see both non-acknowledgement messages, never the ACK.
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("an event");
        assert!(!event.is_acknowledgement_kind());
    }
    lifetime.cancel();
    pool.shutdown().await;
}
