//! Channel (topic + subscription) configuration.

use crate::objects::{ChannelSource, DEFAULT_SUBSCRIPTION};
use serde::{Deserialize, Serialize};

/// One topic and the subscription the relay reads it through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub topic: String,
    #[serde(default = "default_subscription")]
    pub subscription: String,
}

fn default_subscription() -> String {
    DEFAULT_SUBSCRIPTION.to_string()
}

impl ChannelConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    /// The `ftp`, `mqtt` and `api` channels, all read through the default subscription.
    pub fn defaults() -> Vec<ChannelConfig> {
        ChannelSource::ALL.into_iter().map(Into::into).collect()
    }
}

impl From<ChannelSource> for ChannelConfig {
    fn from(source: ChannelSource) -> Self {
        Self::new(source.topic_name(), DEFAULT_SUBSCRIPTION)
    }
}
