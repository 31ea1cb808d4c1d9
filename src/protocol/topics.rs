//! Per-device topic construction
//!
//! Every topic a device touches is a pure function of its device id.

use super::identity::DeviceIdentity;

/// The topics used by a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    /// Telemetry events published by the device: `/devices/{device}/events`
    pub events: String,
    /// Configuration pushed to the device: `/devices/{device}/config`
    pub config: String,
    /// Commands pushed to the device: `/devices/{device}/commands/#`
    pub commands: String,
    /// Device state reports: `/devices/{device}/state`
    pub state: String,
}

impl TopicSet {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            events: format!("/devices/{device_id}/events"),
            config: format!("/devices/{device_id}/config"),
            commands: format!("/devices/{device_id}/commands/#"),
            state: format!("/devices/{device_id}/state"),
        }
    }

    pub fn for_identity(identity: &DeviceIdentity) -> Self {
        Self::for_device(identity.device_id())
    }

    /// Prefix shared by every concrete command topic (the filter minus `#`)
    pub fn commands_prefix(&self) -> &str {
        self.commands.trim_end_matches('#').trim_end_matches('/')
    }

    /// Classify an inbound topic against this device's subscriptions
    pub fn classify(&self, topic: &str) -> TopicKind {
        if topic == self.config {
            return TopicKind::Config;
        }

        let prefix = self.commands_prefix();
        if let Some(rest) = topic.strip_prefix(prefix) {
            if rest.is_empty() {
                return TopicKind::Command { subfolder: None };
            }
            if let Some(subfolder) = rest.strip_prefix('/') {
                let subfolder = (!subfolder.is_empty()).then(|| subfolder.to_string());
                return TopicKind::Command { subfolder };
            }
        }

        TopicKind::Unknown
    }
}

/// Kind of an inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Config,
    Command { subfolder: Option<String> },
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_paths() {
        let topics = TopicSet::for_device("d1");
        assert_eq!(topics.events, "/devices/d1/events");
        assert_eq!(topics.config, "/devices/d1/config");
        assert_eq!(topics.commands, "/devices/d1/commands/#");
        assert_eq!(topics.state, "/devices/d1/state");
    }

    #[test]
    fn test_topics_from_identity() {
        let identity = DeviceIdentity::new("p1", "us-central1", "r1", "d1");
        assert_eq!(TopicSet::for_identity(&identity), TopicSet::for_device("d1"));
    }

    #[test]
    fn test_classify_config() {
        let topics = TopicSet::for_device("d1");
        assert_eq!(topics.classify("/devices/d1/config"), TopicKind::Config);
    }

    #[test]
    fn test_classify_commands() {
        let topics = TopicSet::for_device("d1");
        assert_eq!(
            topics.classify("/devices/d1/commands"),
            TopicKind::Command { subfolder: None }
        );
        assert_eq!(
            topics.classify("/devices/d1/commands/"),
            TopicKind::Command { subfolder: None }
        );
        assert_eq!(
            topics.classify("/devices/d1/commands/reboot"),
            TopicKind::Command {
                subfolder: Some("reboot".to_string())
            }
        );
    }

    #[test]
    fn test_classify_unknown() {
        let topics = TopicSet::for_device("d1");
        assert_eq!(topics.classify("/devices/d2/config"), TopicKind::Unknown);
        assert_eq!(topics.classify("/devices/d1/commandsx"), TopicKind::Unknown);
        assert_eq!(topics.classify("/devices/d1/events"), TopicKind::Unknown);
    }
}
