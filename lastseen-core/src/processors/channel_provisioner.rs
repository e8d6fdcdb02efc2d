//! ChannelProvisioner.
//!
//! Look up, and create when missing, the topic and subscription of each
//! channel. A missing entity is the normal create path; an entity that
//! appears between our lookup and our create (another relay instance
//! provisioning the same name) is reused. The policy only applies to
//! entities we create: existing ones are returned as they are.

use crate::bus::{BusError, ChannelManager, SubscriptionHandle, TopicHandle};
use lastseen_sdk::config::{ChannelConfig, ChannelPolicy};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to provision topic {topic}: {source}")]
    Topic { topic: String, source: BusError },

    #[error("failed to provision subscription {topic}/{subscription}: {source}")]
    Subscription {
        topic: String,
        subscription: String,
        source: BusError,
    },

    #[error("failed to delete topic {topic}: {source}")]
    Delete { topic: String, source: BusError },
}

pub struct ChannelProvisioner<M: ?Sized> {
    manager: Arc<M>,
    policy: ChannelPolicy,
}

impl<M: ChannelManager + ?Sized> ChannelProvisioner<M> {
    pub fn new(manager: Arc<M>, policy: ChannelPolicy) -> Self {
        Self { manager, policy }
    }

    pub async fn ensure_topic(&self, name: &str) -> Result<TopicHandle, ProvisioningError> {
        let fail = |source| ProvisioningError::Topic {
            topic: name.to_string(),
            source,
        };

        if let Some(topic) = self.manager.get_topic(name).await.map_err(fail)? {
            debug!(topic = %name, "Topic already exists");
            return Ok(topic);
        }

        match self.manager.create_topic(name, &self.policy).await {
            Ok(topic) => {
                info!(
                    topic = %name,
                    message_ttl_secs = topic.message_ttl.as_secs(),
                    "Created topic"
                );
                Ok(topic)
            }
            Err(BusError::AlreadyExists(_)) => {
                debug!(topic = %name, "Topic was created concurrently, reusing it");
                self.manager
                    .get_topic(name)
                    .await
                    .map_err(fail)?
                    .ok_or_else(|| fail(BusError::NotFound(format!("topic {name}"))))
            }
            Err(e) => Err(fail(e)),
        }
    }

    pub async fn ensure_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionHandle, ProvisioningError> {
        let fail = |source| ProvisioningError::Subscription {
            topic: topic.to_string(),
            subscription: name.to_string(),
            source,
        };

        if let Some(subscription) = self
            .manager
            .get_subscription(topic, name)
            .await
            .map_err(fail)?
        {
            debug!(%subscription, "Subscription already exists");
            return Ok(subscription);
        }

        match self
            .manager
            .create_subscription(topic, name, &self.policy)
            .await
        {
            Ok(subscription) => {
                info!(
                    %subscription,
                    lock_duration_secs = subscription.lock_duration.as_secs(),
                    "Created subscription"
                );
                Ok(subscription)
            }
            Err(BusError::AlreadyExists(_)) => {
                debug!(topic, subscription = name, "Subscription was created concurrently, reusing it");
                self.manager
                    .get_subscription(topic, name)
                    .await
                    .map_err(fail)?
                    .ok_or_else(|| fail(BusError::NotFound(format!("subscription {topic}/{name}"))))
            }
            Err(e) => Err(fail(e)),
        }
    }

    /// Ensure the channel's topic, then its subscription.
    pub async fn ensure_channel(
        &self,
        channel: &ChannelConfig,
    ) -> Result<SubscriptionHandle, ProvisioningError> {
        self.ensure_topic(&channel.topic).await?;
        self.ensure_subscription(&channel.topic, &channel.subscription)
            .await
    }

    pub async fn delete_topic(&self, name: &str) -> Result<(), ProvisioningError> {
        self.manager
            .delete_topic(name)
            .await
            .map_err(|source| ProvisioningError::Delete {
                topic: name.to_string(),
                source,
            })?;
        info!(topic = %name, "Deleted topic");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryBus;
    use std::time::Duration;

    fn provisioner(bus: &Arc<InMemoryBus>) -> ChannelProvisioner<InMemoryBus> {
        ChannelProvisioner::new(bus.clone(), ChannelPolicy::default())
    }

    #[tokio::test]
    async fn test_ensure_twice_is_idempotent() {
        let bus = Arc::new(InMemoryBus::new());
        let provisioner = provisioner(&bus);

        let first = provisioner.ensure_topic("ftp_topic").await.unwrap();
        let second = provisioner.ensure_topic("ftp_topic").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.message_ttl, Duration::from_secs(12 * 60 * 60));

        let sub = provisioner
            .ensure_subscription("ftp_topic", "dagotest")
            .await
            .unwrap();
        let again = provisioner
            .ensure_subscription("ftp_topic", "dagotest")
            .await
            .unwrap();
        assert_eq!(sub, again);
        assert_eq!(sub.lock_duration, Duration::from_secs(60));
        assert_eq!(bus.creates(), 2);
    }

    #[tokio::test]
    async fn test_existing_policy_is_not_reconciled() {
        let bus = Arc::new(InMemoryBus::new());
        let short = ChannelPolicy {
            message_ttl_secs: 60,
            lock_duration_secs: 5,
        };
        ChannelProvisioner::new(bus.clone(), short)
            .ensure_channel(&ChannelConfig::new("mqtt_topic", "dagotest"))
            .await
            .unwrap();

        let provisioner = provisioner(&bus);
        let topic = provisioner.ensure_topic("mqtt_topic").await.unwrap();
        let sub = provisioner
            .ensure_subscription("mqtt_topic", "dagotest")
            .await
            .unwrap();
        assert_eq!(topic.message_ttl, Duration::from_secs(60));
        assert_eq!(sub.lock_duration, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lost_create_race_is_benign() {
        let bus = Arc::new(InMemoryBus::new());
        let provisioner = provisioner(&bus);
        provisioner.ensure_topic("api_topic").await.unwrap();

        bus.hide_next_lookup();
        let topic = provisioner.ensure_topic("api_topic").await.unwrap();
        assert_eq!(topic.name, "api_topic");

        provisioner
            .ensure_subscription("api_topic", "dagotest")
            .await
            .unwrap();
        bus.hide_next_lookup();
        let sub = provisioner
            .ensure_subscription("api_topic", "dagotest")
            .await
            .unwrap();
        assert_eq!(sub.name, "dagotest");
        assert_eq!(bus.creates(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_provisioning() {
        let bus = Arc::new(InMemoryBus::new());
        let channel = ChannelConfig::new("ftp_topic", "dagotest");
        let a = provisioner(&bus);
        let b = provisioner(&bus);
        let (left, right) = tokio::join!(a.ensure_channel(&channel), b.ensure_channel(&channel));
        assert_eq!(left.unwrap(), right.unwrap());
        assert_eq!(bus.creates(), 2);
    }

    #[tokio::test]
    async fn test_management_failure_is_fatal() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_management_offline(true);
        let result = provisioner(&bus).ensure_topic("ftp_topic").await;
        assert!(matches!(
            result,
            Err(ProvisioningError::Topic {
                source: BusError::Management(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_delete_topic() {
        let bus = Arc::new(InMemoryBus::new());
        let provisioner = provisioner(&bus);
        provisioner.ensure_topic("ftp_topic").await.unwrap();
        provisioner.delete_topic("ftp_topic").await.unwrap();
        assert!(bus.topic_names().is_empty());
        assert!(matches!(
            provisioner.delete_topic("ftp_topic").await,
            Err(ProvisioningError::Delete { .. })
        ));
    }
}
