//! Pure routing of MQTT events to the device's event sinks
//!
//! This module translates rumqttc events and connection errors into
//! [`EventRoute`] values, and routes are delivered to a [`BrokerEventSink`].

use crate::transport::{BrokerEventSink, ConnectCode, DisconnectReason, InboundMessage};
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet, QoS, SubscribeReasonCode};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate sink (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    EventRoute::ConnectionAcknowledged(Self::map_connect_code(connack.code))
                }
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    message_id: puback.pkid,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAnswered {
                    message_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| match code {
                            SubscribeReasonCode::Success(qos) => Some(*qos),
                            SubscribeReasonCode::Failure => None,
                        })
                        .collect(),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                }),
                Packet::Disconnect => EventRoute::Disconnected(DisconnectReason::BrokerInitiated),
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                EventRoute::Disconnected(DisconnectReason::ClientRequested)
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Route an event loop error (pure routing decision)
    ///
    /// A refused CONNACK surfaces from rumqttc as an error; it is reported
    /// as a failed connection acknowledgment rather than a disconnect.
    pub fn route_connection_error(error: &ConnectionError) -> EventRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                EventRoute::ConnectionAcknowledged(Self::map_connect_code(*code))
            }
            other => EventRoute::Disconnected(DisconnectReason::NetworkError(other.to_string())),
        }
    }

    /// Map rumqttc's CONNACK return code (pure function)
    pub fn map_connect_code(code: ConnectReturnCode) -> ConnectCode {
        match code {
            ConnectReturnCode::Success => ConnectCode::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => ConnectCode::RefusedProtocolVersion,
            ConnectReturnCode::BadClientId => ConnectCode::BadClientId,
            ConnectReturnCode::ServiceUnavailable => ConnectCode::ServiceUnavailable,
            ConnectReturnCode::BadUserNamePassword => ConnectCode::BadCredentials,
            ConnectReturnCode::NotAuthorized => ConnectCode::NotAuthorized,
        }
    }

    /// Deliver a route to the sink
    ///
    /// Returns false once the session is over and the event loop must stop
    /// polling; reconnection is decided by the device, not the client.
    pub fn dispatch(route: EventRoute, sink: &dyn BrokerEventSink) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged(code) => {
                sink.on_connect(code);
                code.is_success()
            }
            EventRoute::PublishAcknowledged { message_id } => {
                sink.on_publish_ack(message_id);
                true
            }
            EventRoute::SubscriptionAnswered {
                message_id,
                granted,
            } => {
                sink.on_subscribe_ack(message_id, granted);
                true
            }
            EventRoute::MessageReceived(message) => {
                sink.on_message(message);
                true
            }
            EventRoute::Disconnected(reason) => {
                sink.on_disconnect(reason);
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK received, or connection refused
    ConnectionAcknowledged(ConnectCode),
    /// PUBACK for a QoS 1 publish
    PublishAcknowledged { message_id: u16 },
    /// SUBACK with per-filter outcome
    SubscriptionAnswered {
        message_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// Message received on subscribed topic
    MessageReceived(InboundMessage),
    /// Session ended
    Disconnected(DisconnectReason),
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
