//! Provisioning policy applied when a topic or subscription is created.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retention and lock settings for newly created channels.
///
/// The policy only applies at creation time. Existing topics and
/// subscriptions keep whatever they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// How long an unconsumed message is retained on the topic.
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// How long a delivered message stays locked to one receiver before
    /// the bus redelivers it.
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
}

fn default_message_ttl_secs() -> u64 {
    12 * 60 * 60
}

fn default_lock_duration_secs() -> u64 {
    60
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            message_ttl_secs: default_message_ttl_secs(),
            lock_duration_secs: default_lock_duration_secs(),
        }
    }
}

impl ChannelPolicy {
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }
}
