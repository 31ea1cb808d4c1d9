//! Connection state machine behavior under concurrent callbacks
//!
//! Callbacks arrive from the broker client's background task while the
//! session side reads and claims the state; every observed snapshot must be
//! one the machine could legitimately be in.

use iotcore_device::device::{
    BackoffCounter, ConnectionSnapshot, ConnectionState, ConnectionStateMachine,
    ReconnectionDecision,
};
use iotcore_device::error::DeviceError;
use iotcore_device::testing::{ConnectBehavior, MockBroker};
use iotcore_device::transport::{BrokerClient, ConnectCode, DisconnectReason};
use iotcore_device::device::{DeviceEventSink, InboundHandler, SessionStats};
use iotcore_device::protocol::TopicSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

fn assert_consistent(snapshot: &ConnectionSnapshot) {
    match snapshot.state {
        ConnectionState::Connected => {
            assert!(!snapshot.backoff.should_backoff(), "{snapshot:?}");
            assert_eq!(snapshot.backoff.min_backoff_secs(), 1, "{snapshot:?}");
        }
        ConnectionState::Disconnected => {
            assert!(
                snapshot.backoff.should_backoff() || snapshot.backoff == BackoffCounter::new(),
                "{snapshot:?}"
            );
        }
        ConnectionState::Connecting => {}
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_callbacks_never_tear_state() {
    let state_machine = Arc::new(ConnectionStateMachine::new("d1", Span::none()));
    let mut watcher = state_machine.subscribe();

    let mut writers = Vec::new();
    for worker in 0..4 {
        let state_machine = state_machine.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..500 {
                if (i + worker) % 2 == 0 {
                    // Confirmations only count for a claimed attempt; a
                    // rejected or exhausted claim leaves a stale one
                    let _ = state_machine.begin_attempt();
                    state_machine.on_connect(ConnectCode::Accepted);
                } else {
                    state_machine.on_disconnect(&DisconnectReason::NetworkError(
                        "connection reset".to_string(),
                    ));
                }
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let reader = {
        let state_machine = state_machine.clone();
        tokio::spawn(async move {
            for _ in 0..2000 {
                assert_consistent(&state_machine.snapshot());
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();

    assert_consistent(&watcher.borrow_and_update());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_attempt_in_flight() {
    let state_machine = Arc::new(ConnectionStateMachine::new("d1", Span::none()));

    let mut claims = Vec::new();
    for _ in 0..16 {
        let state_machine = state_machine.clone();
        claims.push(tokio::spawn(async move { state_machine.begin_attempt() }));
    }

    let mut granted = 0;
    for claim in claims {
        match claim.await.unwrap() {
            Ok(decision) => {
                assert_eq!(decision, ReconnectionDecision::Immediate);
                granted += 1;
            }
            Err(DeviceError::ConnectRejected { state }) => {
                assert_eq!(state, ConnectionState::Connecting)
            }
            Err(other) => panic!("Unexpected error: {other}"),
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(state_machine.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_refusing_broker_backs_off_then_gives_up() {
    let broker = Arc::new(MockBroker::with_script(vec![
        ConnectBehavior::Refuse(ConnectCode::ServiceUnavailable);
        10
    ]));
    let state_machine = Arc::new(ConnectionStateMachine::new("d1", Span::none()));
    broker
        .set_event_sink(Arc::new(DeviceEventSink::new(
            state_machine.clone(),
            InboundHandler::new(TopicSet::for_device("d1")),
            Arc::new(SessionStats::new()),
            Span::none(),
        )))
        .await;

    let started = tokio::time::Instant::now();
    let error = loop {
        if let Err(e) = state_machine.connect(broker.as_ref(), "localhost", 8883).await {
            break e;
        }
        state_machine
            .wait_for_connected(Duration::from_secs(5))
            .await
            .unwrap();
    };

    assert!(matches!(
        error,
        DeviceError::BackoffExhausted {
            min_backoff_secs: 64,
            ..
        }
    ));
    // Attempts after 0, 1, 2, 4, 8, 16 and 32 seconds of backoff (plus jitter)
    assert_eq!(broker.connect_count(), 7);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(63), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(69), "{elapsed:?}");
    assert_eq!(state_machine.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connected_only_after_confirmation() {
    let broker = Arc::new(MockBroker::with_script(vec![ConnectBehavior::Silent]));
    let state_machine = Arc::new(ConnectionStateMachine::new("d1", Span::none()));

    state_machine
        .connect(broker.as_ref(), "localhost", 8883)
        .await
        .unwrap();

    // The connect call returned, but nothing confirmed it
    assert_eq!(state_machine.state(), ConnectionState::Connecting);

    state_machine.on_connect(ConnectCode::Accepted);
    assert_eq!(state_machine.state(), ConnectionState::Connected);
}
