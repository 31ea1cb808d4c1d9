//! Inbound configuration and command handling
//!
//! Runs on the adapter's background task. Nothing here touches connection
//! state; a bad payload is reported and dropped.

use crate::error::DeviceError;
use crate::protocol::messages::parse_document;
use crate::protocol::topics::{TopicKind, TopicSet};
use crate::transport::InboundMessage;
use serde_json::Value;
use tracing::{debug, info, warn};

/// What became of one inbound message
#[derive(Debug)]
pub enum InboundOutcome {
    /// Empty payload: no configuration currently assigned
    Empty,
    Config(Value),
    Command {
        subfolder: Option<String>,
        document: Value,
    },
    /// Payload could not be parsed; logged and discarded
    Malformed(DeviceError),
    /// Topic is not one of this device's subscriptions
    Ignored,
}

/// Classifies and parses messages on the device's control topics
#[derive(Debug, Clone)]
pub struct InboundHandler {
    topics: TopicSet,
}

impl InboundHandler {
    pub fn new(topics: TopicSet) -> Self {
        Self { topics }
    }

    pub fn handle(&self, message: &InboundMessage) -> InboundOutcome {
        info!(
            topic = %message.topic,
            qos = ?message.qos,
            bytes = message.payload.len(),
            "Received message"
        );

        if message.payload.is_empty() {
            info!(topic = %message.topic, "Empty payload, no configuration assigned");
            return InboundOutcome::Empty;
        }

        let kind = self.topics.classify(&message.topic);
        if kind == TopicKind::Unknown {
            debug!(topic = %message.topic, "Ignoring message on unexpected topic");
            return InboundOutcome::Ignored;
        }

        let document = match parse_document(&message.payload) {
            Ok(document) => document,
            Err(reason) => {
                let error = DeviceError::malformed_payload(&message.topic, reason);
                warn!(error = %error, "Discarding inbound payload");
                return InboundOutcome::Malformed(error);
            }
        };

        match kind {
            TopicKind::Config => {
                info!(topic = %message.topic, "Received configuration");
                InboundOutcome::Config(document)
            }
            TopicKind::Command { subfolder } => {
                info!(topic = %message.topic, ?subfolder, "Received command");
                InboundOutcome::Command {
                    subfolder,
                    document,
                }
            }
            TopicKind::Unknown => InboundOutcome::Ignored,
        }
    }
}
