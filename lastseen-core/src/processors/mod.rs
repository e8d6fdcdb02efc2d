//! Long-running workers of the relay.
//!
//! - `ChannelProvisioner`: ensures topics and subscriptions exist
//! - `ChannelConsumer`: pulls one subscription, upserts presence, acknowledges
//! - `HeartbeatLoop`: stamps the liveness marker on a fixed interval
//! - `Supervisor`: provisions, fans out consumers, watches the heartbeat

pub mod channel_consumer;
pub mod channel_provisioner;
pub mod heartbeat;
pub mod supervisor;

pub use channel_consumer::{ChannelConsumer, ConsumeError, ConsumerSettings, ConsumerStats};
pub use channel_provisioner::{ChannelProvisioner, ProvisioningError};
pub use heartbeat::{HeartbeatError, HeartbeatLoop, HeartbeatSettings};
pub use supervisor::{Supervisor, SupervisorError, SupervisorSettings};
