//! TOML file configuration structures.
//!
//! These structs map to the `lastseen.toml` file format. Every section is
//! optional; an empty file is a valid configuration.

use lastseen_core::processors::{ConsumerSettings, HeartbeatSettings, SupervisorSettings};
use lastseen_sdk::config::{ChannelConfig, ChannelPolicy};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerConfig,
    pub policy: ChannelPolicy,
    pub consumer: ConsumerConfig,
    pub heartbeat: HeartbeatConfig,
    pub supervisor: SupervisorConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            policy: ChannelPolicy::default(),
            consumer: ConsumerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            supervisor: SupervisorConfig::default(),
            channels: ChannelConfig::defaults(),
        }
    }
}

/// Server configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the health endpoints (e.g., "0.0.0.0:8080").
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub max_wait_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_wait_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long consumers get to finish their batch after shutdown.
    pub drain_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 10,
        }
    }
}

impl FileConfig {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            channels: self.channels.clone(),
            policy: self.policy,
            consumer: ConsumerSettings {
                batch_size: self.consumer.batch_size,
                max_wait: Duration::from_secs(self.consumer.max_wait_secs),
            },
            heartbeat: HeartbeatSettings {
                interval: Duration::from_secs(self.heartbeat.interval_secs),
                max_consecutive_failures: self.heartbeat.max_consecutive_failures,
            },
            drain_timeout: Duration::from_secs(self.supervisor.drain_timeout_secs),
        }
    }
}
