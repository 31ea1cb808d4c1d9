//! Connection state machine
//!
//! Owns the `{state, backoff}` pair of one device. Broker callbacks write it
//! from the adapter's background task while the session driver reads it;
//! both go through a single `watch` channel so every reader observes a
//! consistent snapshot of the pair.

use super::backoff::{BackoffCounter, ReconnectionDecision};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::{BrokerClient, ConnectCode, DisconnectReason};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Span};

/// Connectivity of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// State and backoff, always read and written together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub backoff: BackoffCounter,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: BackoffCounter::new(),
        }
    }
}

/// How a connect attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The broker confirmed the connection
    Connected,
    /// The broker refused, or the session dropped before confirmation
    Failed,
}

/// Connection state machine for one device
pub struct ConnectionStateMachine {
    device_id: String,
    snapshot: watch::Sender<ConnectionSnapshot>,
    span: Span,
}

impl ConnectionStateMachine {
    pub fn new(device_id: impl Into<String>, span: Span) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            device_id: device_id.into(),
            snapshot,
            span,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch every state transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Claim the single in-flight attempt and decide its backoff
    ///
    /// On success the state is already `Connecting`, so a concurrent caller
    /// is rejected for the whole duration of the backoff sleep as well.
    pub fn begin_attempt(&self) -> DeviceResult<ReconnectionDecision> {
        let mut outcome = Ok(ReconnectionDecision::Immediate);

        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state != ConnectionState::Disconnected {
                outcome = Err(DeviceError::ConnectRejected {
                    state: snapshot.state,
                });
                return false;
            }

            match snapshot.backoff.next_attempt(&mut rand::thread_rng()) {
                ReconnectionDecision::GiveUp { min_backoff_secs } => {
                    outcome = Err(DeviceError::BackoffExhausted {
                        device_id: self.device_id.clone(),
                        min_backoff_secs,
                    });
                    false
                }
                decision => {
                    snapshot.state = ConnectionState::Connecting;
                    outcome = Ok(decision);
                    true
                }
            }
        });

        outcome
    }

    /// Run the reconnect algorithm and issue one connect call
    ///
    /// Returning `Ok` only means the call was issued; confirmation arrives
    /// through [`on_connect`](Self::on_connect).
    pub async fn connect(
        &self,
        broker: &dyn BrokerClient,
        host: &str,
        port: u16,
    ) -> DeviceResult<()> {
        if let ReconnectionDecision::Delay { delay, base_secs } = self.begin_attempt()? {
            info!(
                parent: &self.span,
                delay_ms = delay.as_millis() as u64,
                base_secs,
                "Waiting before reconnecting"
            );
            tokio::time::sleep(delay).await;
        }

        if let Err(e) = broker.connect(host, port).await {
            warn!(parent: &self.span, error = %e, "Connect call failed");
            self.record_failure();
            return Err(e.into());
        }

        Ok(())
    }

    /// Wait until the pending attempt resolves
    ///
    /// On timeout the attempt is abandoned and the state returns to
    /// `Disconnected` with backoff armed.
    pub async fn wait_for_connected(&self, timeout: Duration) -> DeviceResult<AttemptOutcome> {
        let mut rx = self.subscribe();
        let resolved = tokio::time::timeout(
            timeout,
            rx.wait_for(|snapshot| snapshot.state != ConnectionState::Connecting),
        )
        .await
        .map(|changed| changed.map(|snapshot| snapshot.state));

        match resolved {
            Ok(Ok(ConnectionState::Connected)) => Ok(AttemptOutcome::Connected),
            Ok(_) => Ok(AttemptOutcome::Failed),
            Err(_) => {
                warn!(parent: &self.span, ?timeout, "Timed out waiting for connection");
                self.record_failure();
                Err(DeviceError::ConnectTimeout { timeout })
            }
        }
    }

    /// Connection acknowledgment callback
    ///
    /// Only a pending attempt can be confirmed. An acknowledgment that
    /// arrives after the attempt was abandoned leaves the state untouched;
    /// a late refusal still arms backoff while disconnected.
    pub fn on_connect(&self, code: ConnectCode) {
        let mut stale = None;
        self.snapshot.send_if_modified(|snapshot| match snapshot.state {
            ConnectionState::Connecting => {
                if code.is_success() {
                    snapshot.backoff.on_connected();
                    snapshot.state = ConnectionState::Connected;
                } else {
                    snapshot.backoff.on_disconnected();
                    snapshot.state = ConnectionState::Disconnected;
                }
                true
            }
            ConnectionState::Disconnected if !code.is_success() => {
                snapshot.backoff.on_disconnected();
                true
            }
            state => {
                stale = Some(state);
                false
            }
        });

        if let Some(state) = stale {
            warn!(parent: &self.span, %state, "Ignoring stale on_connect {}", code);
            return;
        }

        if code.is_success() {
            info!(parent: &self.span, "on_connect {}", code);
        } else {
            warn!(parent: &self.span, "on_connect {}", code);
        }
    }

    /// Session-ended callback
    pub fn on_disconnect(&self, reason: &DisconnectReason) {
        self.record_failure();
        info!(parent: &self.span, %reason, "on_disconnect");
    }

    /// Graceful disconnect requested by the device
    pub async fn disconnect(&self, broker: &dyn BrokerClient) -> DeviceResult<()> {
        let result = broker.disconnect().await;
        self.snapshot.send_if_modified(|snapshot| {
            let changed = snapshot.state != ConnectionState::Disconnected;
            snapshot.state = ConnectionState::Disconnected;
            snapshot.backoff.on_disconnected();
            changed
        });
        debug!(parent: &self.span, "Disconnected");
        result.map_err(DeviceError::from)
    }

    fn record_failure(&self) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.backoff.on_disconnected();
            snapshot.state = ConnectionState::Disconnected;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{ConnectBehavior, MockBroker};
    use crate::transport::{BrokerEventSink, InboundMessage};
    use rumqttc::QoS;
    use std::sync::Arc;

    /// Forwards only the connectivity callbacks
    struct StateSink(Arc<ConnectionStateMachine>);

    impl BrokerEventSink for StateSink {
        fn on_connect(&self, code: ConnectCode) {
            self.0.on_connect(code);
        }
        fn on_disconnect(&self, reason: DisconnectReason) {
            self.0.on_disconnect(&reason);
        }
        fn on_publish_ack(&self, _message_id: u16) {}
        fn on_subscribe_ack(&self, _message_id: u16, _granted: Vec<Option<QoS>>) {}
        fn on_message(&self, _message: InboundMessage) {}
    }

    fn machine() -> ConnectionStateMachine {
        ConnectionStateMachine::new("d1", Span::none())
    }

    async fn wired(broker: &MockBroker) -> Arc<ConnectionStateMachine> {
        let sm = Arc::new(machine());
        broker.set_event_sink(Arc::new(StateSink(sm.clone()))).await;
        sm
    }

    #[test]
    fn test_initial_state() {
        let sm = machine();
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(!sm.snapshot().backoff.should_backoff());
    }

    #[test]
    fn test_second_attempt_rejected_while_connecting() {
        let sm = machine();
        assert_eq!(sm.begin_attempt().unwrap(), ReconnectionDecision::Immediate);
        assert_eq!(sm.state(), ConnectionState::Connecting);

        let err = sm.begin_attempt().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ConnectRejected {
                state: ConnectionState::Connecting
            }
        ));

        sm.on_connect(ConnectCode::Accepted);
        assert!(matches!(
            sm.begin_attempt(),
            Err(DeviceError::ConnectRejected {
                state: ConnectionState::Connected
            })
        ));
    }

    #[test]
    fn test_refusal_arms_backoff() {
        let sm = machine();
        sm.begin_attempt().unwrap();
        sm.on_connect(ConnectCode::NotAuthorized);

        let snapshot = sm.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.backoff.should_backoff());
        assert!(matches!(
            sm.begin_attempt().unwrap(),
            ReconnectionDecision::Delay { base_secs: 1, .. }
        ));
    }

    #[test]
    fn test_success_after_failures_resets_backoff() {
        let sm = machine();
        for _ in 0..2 {
            sm.begin_attempt().unwrap();
            sm.on_disconnect(&DisconnectReason::NetworkError("reset".to_string()));
        }
        sm.begin_attempt().unwrap();
        sm.on_connect(ConnectCode::Accepted);

        let snapshot = sm.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.backoff, BackoffCounter::new());

        sm.on_disconnect(&DisconnectReason::BrokerInitiated);
        assert!(matches!(
            sm.begin_attempt().unwrap(),
            ReconnectionDecision::Delay { base_secs: 1, .. }
        ));
    }

    #[test]
    fn test_give_up_does_not_claim_attempt() {
        let sm = machine();
        for _ in 0..6 {
            sm.on_disconnect(&DisconnectReason::BrokerInitiated);
            sm.begin_attempt().unwrap();
        }
        sm.on_disconnect(&DisconnectReason::BrokerInitiated);

        let err = sm.begin_attempt().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::BackoffExhausted {
                min_backoff_secs: 64,
                ..
            }
        ));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_wait() {
        let broker = Arc::new(MockBroker::new());
        let sm = wired(&broker).await;

        sm.connect(broker.as_ref(), "localhost", 8883).await.unwrap();
        let outcome = sm.wait_for_connected(Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Connected);
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_broker_times_out() {
        let broker = Arc::new(MockBroker::with_script(vec![ConnectBehavior::Silent]));
        let sm = wired(&broker).await;

        sm.connect(broker.as_ref(), "localhost", 8883).await.unwrap();
        let err = sm
            .wait_for_connected(Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, DeviceError::ConnectTimeout { .. }));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.snapshot().backoff.should_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acknowledgment_after_timeout_is_ignored() {
        let sm = machine();
        sm.begin_attempt().unwrap();
        let err = sm
            .wait_for_connected(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ConnectTimeout { .. }));

        // CONNACK of the abandoned attempt arrives after all
        sm.on_connect(ConnectCode::Accepted);

        let snapshot = sm.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.backoff.should_backoff());
    }

    #[test]
    fn test_acknowledgment_without_attempt_is_ignored() {
        let sm = machine();
        sm.on_connect(ConnectCode::Accepted);
        assert_eq!(sm.snapshot(), ConnectionSnapshot::default());

        sm.begin_attempt().unwrap();
        sm.on_connect(ConnectCode::Accepted);
        sm.on_connect(ConnectCode::ServiceUnavailable);
        let snapshot = sm.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert!(!snapshot.backoff.should_backoff());
    }

    #[test]
    fn test_late_refusal_arms_backoff_while_disconnected() {
        let sm = machine();
        sm.on_connect(ConnectCode::NotAuthorized);

        let snapshot = sm.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.backoff.should_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleep_before_reconnect() {
        let broker = Arc::new(MockBroker::with_script(vec![
            ConnectBehavior::Refuse(ConnectCode::ServiceUnavailable),
            ConnectBehavior::Accept,
        ]));
        let sm = wired(&broker).await;

        sm.connect(broker.as_ref(), "localhost", 8883).await.unwrap();
        assert_eq!(
            sm.wait_for_connected(Duration::from_secs(5)).await.unwrap(),
            AttemptOutcome::Failed
        );

        let started = tokio::time::Instant::now();
        sm.connect(broker.as_ref(), "localhost", 8883).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_secs(2));

        assert_eq!(
            sm.wait_for_connected(Duration::from_secs(5)).await.unwrap(),
            AttemptOutcome::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_call_records_failure() {
        let broker = Arc::new(MockBroker::with_script(vec![ConnectBehavior::FailImmediately]));
        let sm = wired(&broker).await;

        let err = sm.connect(broker.as_ref(), "localhost", 8883).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.snapshot().backoff.should_backoff());
    }

    #[tokio::test]
    async fn test_disconnect_transitions_state() {
        let broker = Arc::new(MockBroker::new());
        let sm = wired(&broker).await;

        sm.connect(broker.as_ref(), "localhost", 8883).await.unwrap();
        sm.wait_for_connected(Duration::from_secs(5)).await.unwrap();
        sm.disconnect(broker.as_ref()).await.unwrap();

        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert_eq!(broker.disconnect_count(), 1);
    }
}
