use serde::{Deserialize, Serialize};

/// Subscription name every relay instance reads through.
pub const DEFAULT_SUBSCRIPTION: &str = "dagotest";

/// Logical sources that publish device telemetry, one topic each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSource {
    Ftp,
    Mqtt,
    Api,
}

impl ChannelSource {
    pub const ALL: [ChannelSource; 3] = [ChannelSource::Ftp, ChannelSource::Mqtt, ChannelSource::Api];

    /// Name of the topic this source publishes to.
    pub fn topic_name(self) -> &'static str {
        match self {
            ChannelSource::Ftp => "ftp_topic",
            ChannelSource::Mqtt => "mqtt_topic",
            ChannelSource::Api => "api_topic",
        }
    }
}

impl std::fmt::Display for ChannelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic_name())
    }
}
