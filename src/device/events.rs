//! Broker event sink for one device
//!
//! Routes adapter callbacks to the connection state machine and the
//! inbound handler, and counts what the session saw.

use super::connection::ConnectionStateMachine;
use super::inbound::{InboundHandler, InboundOutcome};
use crate::error::DeviceError;
use crate::transport::{BrokerEventSink, ConnectCode, DisconnectReason, InboundMessage};
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn, Span};

/// Counters shared between the event sink and the session driver
#[derive(Debug, Default)]
pub struct SessionStats {
    acked: AtomicU64,
    configs: AtomicU64,
    commands: AtomicU64,
    empty: AtomicU64,
    malformed: AtomicU64,
    rejected_subscriptions: AtomicU64,
    last_config: Mutex<Option<Value>>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn configs(&self) -> u64 {
        self.configs.load(Ordering::Relaxed)
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn empty_payloads(&self) -> u64 {
        self.empty.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn rejected_subscriptions(&self) -> u64 {
        self.rejected_subscriptions.load(Ordering::Relaxed)
    }

    /// Most recent configuration document that parsed successfully
    pub fn last_config(&self) -> Option<Value> {
        self.last_config.lock().clone()
    }

    fn record(&self, outcome: InboundOutcome) {
        match outcome {
            InboundOutcome::Empty => {
                self.empty.fetch_add(1, Ordering::Relaxed);
            }
            InboundOutcome::Config(document) => {
                self.configs.fetch_add(1, Ordering::Relaxed);
                *self.last_config.lock() = Some(document);
            }
            InboundOutcome::Command { .. } => {
                self.commands.fetch_add(1, Ordering::Relaxed);
            }
            InboundOutcome::Malformed(_) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
            }
            InboundOutcome::Ignored => {}
        }
    }
}

/// The sink registered with the broker client
pub struct DeviceEventSink {
    state_machine: Arc<ConnectionStateMachine>,
    inbound: InboundHandler,
    stats: Arc<SessionStats>,
    span: Span,
}

impl DeviceEventSink {
    pub fn new(
        state_machine: Arc<ConnectionStateMachine>,
        inbound: InboundHandler,
        stats: Arc<SessionStats>,
        span: Span,
    ) -> Self {
        Self {
            state_machine,
            inbound,
            stats,
            span,
        }
    }
}

impl BrokerEventSink for DeviceEventSink {
    fn on_connect(&self, code: ConnectCode) {
        self.state_machine.on_connect(code);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        self.state_machine.on_disconnect(&reason);
    }

    fn on_publish_ack(&self, message_id: u16) {
        self.stats.acked.fetch_add(1, Ordering::Relaxed);
        debug!(parent: &self.span, message_id, "on_publish");
    }

    fn on_subscribe_ack(&self, message_id: u16, granted: Vec<Option<QoS>>) {
        for qos in granted {
            match qos {
                Some(qos) => debug!(parent: &self.span, message_id, ?qos, "Subscription granted"),
                None => {
                    self.stats
                        .rejected_subscriptions
                        .fetch_add(1, Ordering::Relaxed);
                    let error = DeviceError::SubscriptionRejected { message_id };
                    warn!(parent: &self.span, error = %error, "Continuing without subscription");
                }
            }
        }
    }

    fn on_message(&self, message: InboundMessage) {
        let _entered = self.span.enter();
        let outcome = self.inbound.handle(&message);
        self.stats.record(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::connection::ConnectionState;
    use crate::protocol::topics::TopicSet;
    use bytes::Bytes;
    use serde_json::json;

    fn sink() -> (DeviceEventSink, Arc<ConnectionStateMachine>, Arc<SessionStats>) {
        let state_machine = Arc::new(ConnectionStateMachine::new("d1", Span::none()));
        let stats = Arc::new(SessionStats::new());
        let sink = DeviceEventSink::new(
            state_machine.clone(),
            InboundHandler::new(TopicSet::for_device("d1")),
            stats.clone(),
            Span::none(),
        );
        (sink, state_machine, stats)
    }

    fn message(topic: &str, payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    #[test]
    fn test_connectivity_callbacks_reach_state_machine() {
        let (sink, state_machine, _) = sink();
        state_machine.begin_attempt().unwrap();

        sink.on_connect(ConnectCode::Accepted);
        assert_eq!(state_machine.state(), ConnectionState::Connected);

        sink.on_disconnect(DisconnectReason::BrokerInitiated);
        assert_eq!(state_machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_inbound_messages_never_touch_connection_state() {
        let (sink, state_machine, stats) = sink();
        state_machine.begin_attempt().unwrap();
        sink.on_connect(ConnectCode::Accepted);

        sink.on_message(message("/devices/d1/config", b""));
        sink.on_message(message("/devices/d1/config", b"{broken"));
        sink.on_message(message("/devices/d1/config", br#"{"version": 1}"#));
        sink.on_message(message("/devices/d1/config", br#"{"version": 2}"#));
        sink.on_message(message("/devices/d1/commands/led", br#"{"on": true}"#));

        assert_eq!(state_machine.state(), ConnectionState::Connected);
        assert_eq!(stats.empty_payloads(), 1);
        assert_eq!(stats.malformed(), 1);
        assert_eq!(stats.configs(), 2);
        assert_eq!(stats.commands(), 1);
        assert_eq!(stats.last_config(), Some(json!({"version": 2})));
    }

    #[test]
    fn test_acks_counted() {
        let (sink, _, stats) = sink();
        sink.on_publish_ack(1);
        sink.on_publish_ack(2);
        sink.on_subscribe_ack(3, vec![Some(QoS::AtLeastOnce)]);
        sink.on_subscribe_ack(4, vec![None]);

        assert_eq!(stats.acked(), 2);
        assert_eq!(stats.rejected_subscriptions(), 1);
    }
}
