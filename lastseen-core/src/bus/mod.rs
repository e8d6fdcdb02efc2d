//! Message bus abstraction.
//!
//! The relay needs two things from a bus: a management surface to look up and
//! create topics and subscriptions ([`ChannelManager`]), and a way to pull
//! messages from a subscription and settle them ([`SubscriptionSource`],
//! [`MessageReceiver`], [`Delivery`]). Delivery is at-least-once: a message
//! that is not completed within the subscription's lock duration comes back.

pub mod nats;

use async_trait::async_trait;
use lastseen_sdk::config::ChannelPolicy;
use std::time::Duration;
use thiserror::Error;

pub use nats::JetStreamBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("management request failed: {0}")]
    Management(String),

    #[error("failed to receive messages: {0}")]
    Receive(String),

    #[error("failed to acknowledge message: {0}")]
    Acknowledge(String),

    #[error("failed to connect to message bus: {0}")]
    Connect(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicHandle {
    pub name: String,
    /// Retention the topic was created with.
    pub message_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub name: String,
    /// Lock duration the subscription was created with.
    pub lock_duration: Duration,
}

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.name)
    }
}

#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// `Ok(None)` when the topic does not exist.
    async fn get_topic(&self, name: &str) -> Result<Option<TopicHandle>, BusError>;

    /// Fails with [`BusError::AlreadyExists`] when someone else created it first.
    async fn create_topic(&self, name: &str, policy: &ChannelPolicy)
    -> Result<TopicHandle, BusError>;

    async fn delete_topic(&self, name: &str) -> Result<(), BusError>;

    /// `Ok(None)` when the subscription does not exist on an existing topic.
    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Option<SubscriptionHandle>, BusError>;

    /// Fails with [`BusError::AlreadyExists`] when someone else created it first.
    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<SubscriptionHandle, BusError>;
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Open a receiver bound to an existing subscription.
    async fn open(
        &self,
        subscription: &SubscriptionHandle,
    ) -> Result<Box<dyn MessageReceiver>, BusError>;
}

#[async_trait]
pub trait MessageReceiver: Send {
    /// Wait up to `max_wait` for at most `max_messages` messages. An empty
    /// batch is not an error, but it must not be returned before `max_wait`
    /// has elapsed: consumers call this in a loop with no pause of their own.
    async fn receive(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Box<dyn Delivery>>, BusError>;
}

/// A message locked to this receiver until it is completed or its lock expires.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Settle the message so the bus never redelivers it.
    async fn complete(&self) -> Result<(), BusError>;
}
