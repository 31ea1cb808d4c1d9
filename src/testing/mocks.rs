//! Mock implementations for testing
//!
//! Provides a scripted [`BrokerClient`] so the device lifecycle can be
//! exercised without a broker. Like the real adapter, the mock invokes
//! sink callbacks from its own background task, one at a time.

use crate::transport::{
    BrokerClient, BrokerEventSink, ConnectCode, DisconnectReason, InboundMessage, TlsSettings,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How the mock answers one `connect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Acknowledge with success
    Accept,
    /// Acknowledge with a refusal code
    Refuse(ConnectCode),
    /// Never acknowledge
    Silent,
    /// Fail the `connect` call itself
    FailImmediately,
}

/// One recorded publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

#[derive(Debug)]
enum MockEvent {
    Connect(ConnectCode),
    Disconnect(DisconnectReason),
    PublishAck(u16),
    SubscribeAck(u16, Vec<Option<QoS>>),
    Message(InboundMessage),
}

/// Scripted broker client
///
/// Connect calls consume the script front to back; once it runs out every
/// further attempt is accepted.
#[derive(Default)]
pub struct MockBroker {
    script: Mutex<VecDeque<ConnectBehavior>>,
    events: Mutex<Option<mpsc::UnboundedSender<MockEvent>>>,
    connected: AtomicBool,
    next_message_id: AtomicU16,
    credentials: Mutex<Vec<(String, String)>>,
    tls: Mutex<Option<TlsSettings>>,
    connects: Mutex<Vec<(String, u16)>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    rejected_filters: Mutex<HashSet<String>>,
    drop_after_publishes: Mutex<Option<usize>>,
    disconnects: AtomicUsize,
    stops: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<ConnectBehavior>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    /// Answer subscribe requests for `topic` with a failure code
    pub fn reject_subscription(&self, topic: impl Into<String>) {
        self.rejected_filters.lock().insert(topic.into());
    }

    /// Drop the session once `count` messages have been published in total
    pub fn drop_connection_after(&self, count: usize) {
        *self.drop_after_publishes.lock() = Some(count);
    }

    /// Deliver a message as if the broker pushed it
    pub fn inject_message(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        self.emit(MockEvent::Message(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }));
    }

    /// Close the session from the broker side
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(MockEvent::Disconnect(DisconnectReason::BrokerInitiated));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn get_connects(&self) -> Vec<(String, u16)> {
        self.connects.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Credentials of the most recent `authenticate` call
    pub fn get_credentials(&self) -> Option<(String, String)> {
        self.credentials.lock().last().cloned()
    }

    pub fn authentication_count(&self) -> usize {
        self.credentials.lock().len()
    }

    pub fn get_tls_settings(&self) -> Option<TlsSettings> {
        self.tls.lock().clone()
    }

    pub fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    fn emit(&self, event: MockEvent) {
        if let Some(sender) = self.events.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn not_connected() -> TransportError {
        TransportError::NotConnected("mock broker session is closed".to_string())
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn set_event_sink(&self, sink: Arc<dyn BrokerEventSink>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        *self.events.lock() = Some(sender);

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    MockEvent::Connect(code) => sink.on_connect(code),
                    MockEvent::Disconnect(reason) => sink.on_disconnect(reason),
                    MockEvent::PublishAck(message_id) => sink.on_publish_ack(message_id),
                    MockEvent::SubscribeAck(message_id, granted) => {
                        sink.on_subscribe_ack(message_id, granted)
                    }
                    MockEvent::Message(message) => sink.on_message(message),
                }
            }
        });
    }

    async fn authenticate(&self, username: &str, password: &str) {
        self.credentials
            .lock()
            .push((username.to_string(), password.to_string()));
    }

    async fn configure_tls(&self, settings: TlsSettings) -> Result<(), TransportError> {
        *self.tls.lock() = Some(settings);
        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), TransportError> {
        self.connects.lock().push((host.to_string(), port));
        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ConnectBehavior::Accept);

        match behavior {
            ConnectBehavior::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                self.emit(MockEvent::Connect(ConnectCode::Accepted));
            }
            ConnectBehavior::Refuse(code) => self.emit(MockEvent::Connect(code)),
            ConnectBehavior::Silent => {}
            ConnectBehavior::FailImmediately => {
                return Err(TransportError::NotConnected(
                    "scripted connect failure".to_string(),
                ))
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(MockEvent::Disconnect(DisconnectReason::ClientRequested));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(Self::not_connected());
        }

        let published = {
            let mut messages = self.published.lock();
            messages.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            messages.len()
        };

        if qos != QoS::AtMostOnce {
            let message_id = self.next_message_id();
            self.emit(MockEvent::PublishAck(message_id));
        }

        if *self.drop_after_publishes.lock() == Some(published) {
            self.drop_connection();
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(Self::not_connected());
        }

        self.subscriptions.lock().push((topic.to_string(), qos));
        let granted = if self.rejected_filters.lock().contains(topic) {
            None
        } else {
            Some(qos)
        };
        let message_id = self.next_message_id();
        self.emit(MockEvent::SubscribeAck(message_id, vec![granted]));
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}
