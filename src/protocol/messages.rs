//! Outbound payload formats and inbound document parsing
//!
//! Telemetry payloads are plain strings; configuration and command pushes
//! are JSON documents.

use super::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Literal payload of the final state report
pub const DEFAULT_STATE_PAYLOAD: &str = "Fake state";

/// Which topic the numbered sequence of messages goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Telemetry events on `/devices/{device}/events`
    #[default]
    Event,
    /// State reports on `/devices/{device}/state`
    State,
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "event" | "events" => Ok(MessageKind::Event),
            "state" => Ok(MessageKind::State),
            other => Err(format!(
                "Unknown message type '{other}', expected 'event' or 'state'"
            )),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Event => f.write_str("event"),
            MessageKind::State => f.write_str("state"),
        }
    }
}

/// Payload of the `sequence`-th message (1-based): `{registry}/{device}-payload-{sequence}`
pub fn telemetry_payload(identity: &DeviceIdentity, sequence: u32) -> String {
    format!(
        "{}/{}-payload-{sequence}",
        identity.registry_id(),
        identity.device_id()
    )
}

/// All payloads for a run of `count` messages, in sequence order
pub fn telemetry_payloads(
    identity: &DeviceIdentity,
    count: u32,
) -> impl Iterator<Item = String> + '_ {
    (1..=count).map(move |sequence| telemetry_payload(identity, sequence))
}

/// Parse a non-empty inbound payload as a JSON document
pub fn parse_document(payload: &[u8]) -> Result<Value, String> {
    let text = std::str::from_utf8(payload).map_err(|e| format!("Payload is not UTF-8: {e}"))?;
    serde_json::from_str(text).map_err(|e| format!("Failed to parse document: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("p1", "us-central1", "r1", "d1")
    }

    #[test]
    fn test_telemetry_payload_format() {
        assert_eq!(telemetry_payload(&identity(), 1), "r1/d1-payload-1");
        assert_eq!(telemetry_payload(&identity(), 20), "r1/d1-payload-20");
    }

    #[test]
    fn test_message_kind_parse() {
        assert_eq!("event".parse::<MessageKind>().unwrap(), MessageKind::Event);
        assert_eq!("EVENTS".parse::<MessageKind>().unwrap(), MessageKind::Event);
        assert_eq!("state".parse::<MessageKind>().unwrap(), MessageKind::State);
        assert!("telemetry".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_message_kind_default_is_event() {
        assert_eq!(MessageKind::default(), MessageKind::Event);
        assert_eq!(MessageKind::Event.to_string(), "event");
    }

    #[test]
    fn test_parse_document() {
        let value = parse_document(br#"{"fan": "on", "target": 21}"#).unwrap();
        assert_eq!(value["fan"], "on");
        assert_eq!(value["target"], 21);
    }

    #[test]
    fn test_parse_document_rejects_garbage() {
        assert!(parse_document(b"not json").is_err());
        assert!(parse_document(&[0xff, 0xfe]).is_err());
    }

    proptest! {
        #[test]
        fn payload_sequence_is_gapless(count in 0u32..200) {
            let payloads: Vec<String> = telemetry_payloads(&identity(), count).collect();
            prop_assert_eq!(payloads.len(), count as usize);
            for (index, payload) in payloads.iter().enumerate() {
                let expected = format!("r1/d1-payload-{}", index + 1);
                prop_assert_eq!(payload, &expected);
            }
        }
    }
}
