use super::lock;
use crate::bus::{
    BusError, ChannelManager, Delivery, MessageReceiver, SubscriptionHandle, SubscriptionSource,
    TopicHandle,
};
use async_trait::async_trait;
use bytes::Bytes;
use lastseen_sdk::config::ChannelPolicy;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// A bus with topics, subscriptions and lock semantics held in memory.
///
/// Every subscription receives its own copy of each published message. A
/// delivery dropped without being completed goes back to the front of its
/// queue, the way an expired lock makes the real bus redeliver.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
    hide_next_lookup: AtomicBool,
    management_offline: AtomicBool,
    creates: AtomicUsize,
}

struct TopicState {
    message_ttl: Duration,
    subscriptions: HashMap<String, SubscriptionState>,
}

struct SubscriptionState {
    lock_duration: Duration,
    queue: Arc<SubscriptionQueue>,
}

#[derive(Default)]
struct SubscriptionQueue {
    pending: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    completed: AtomicUsize,
    fail_acks: AtomicBool,
    fail_receives: AtomicBool,
}

impl SubscriptionQueue {
    fn take(&self, max_messages: usize) -> Vec<Bytes> {
        let mut pending = lock(&self.pending);
        let count = max_messages.min(pending.len());
        pending.drain(..count).collect()
    }

    fn push_back(&self, payload: Bytes) {
        lock(&self.pending).push_back(payload);
        self.notify.notify_waiters();
    }

    fn push_front(&self, payload: Bytes) {
        lock(&self.pending).push_front(payload);
        self.notify.notify_waiters();
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next topic or subscription lookup miss, as if a concurrent
    /// provisioner had not created it yet.
    pub fn hide_next_lookup(&self) {
        self.hide_next_lookup.store(true, Ordering::SeqCst);
    }

    /// Fail every management call while set.
    pub fn set_management_offline(&self, offline: bool) {
        self.management_offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful topic and subscription creations.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.topics).keys().cloned().collect();
        names.sort();
        names
    }

    /// Publish a payload to every subscription on `topic`.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), BusError> {
        let topics = lock(&self.topics);
        let state = topics
            .get(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {topic}")))?;
        let payload = payload.into();
        for subscription in state.subscriptions.values() {
            subscription.queue.push_back(payload.clone());
        }
        Ok(())
    }

    /// Messages completed through the subscription.
    pub fn completed(&self, topic: &str, subscription: &str) -> usize {
        self.queue(topic, subscription)
            .map_or(0, |q| q.completed.load(Ordering::SeqCst))
    }

    /// Messages waiting for delivery on the subscription.
    pub fn pending(&self, topic: &str, subscription: &str) -> usize {
        self.queue(topic, subscription)
            .map_or(0, |q| lock(&q.pending).len())
    }

    pub fn set_ack_failure(&self, topic: &str, subscription: &str, fail: bool) {
        if let Some(queue) = self.queue(topic, subscription) {
            queue.fail_acks.store(fail, Ordering::SeqCst);
        }
    }

    pub fn set_receive_failure(&self, topic: &str, subscription: &str, fail: bool) {
        if let Some(queue) = self.queue(topic, subscription) {
            queue.fail_receives.store(fail, Ordering::SeqCst);
            queue.notify.notify_waiters();
        }
    }

    fn queue(&self, topic: &str, subscription: &str) -> Option<Arc<SubscriptionQueue>> {
        lock(&self.topics)
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(|s| s.queue.clone())
    }

    fn check_online(&self) -> Result<(), BusError> {
        if self.management_offline.load(Ordering::SeqCst) {
            Err(BusError::Management("management surface offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn lookup_hidden(&self) -> bool {
        self.hide_next_lookup.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelManager for InMemoryBus {
    async fn get_topic(&self, name: &str) -> Result<Option<TopicHandle>, BusError> {
        self.check_online()?;
        if self.lookup_hidden() {
            return Ok(None);
        }
        Ok(lock(&self.topics).get(name).map(|t| TopicHandle {
            name: name.to_string(),
            message_ttl: t.message_ttl,
        }))
    }

    async fn create_topic(
        &self,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<TopicHandle, BusError> {
        self.check_online()?;
        let mut topics = lock(&self.topics);
        if topics.contains_key(name) {
            return Err(BusError::AlreadyExists(format!("topic {name}")));
        }
        topics.insert(
            name.to_string(),
            TopicState {
                message_ttl: policy.message_ttl(),
                subscriptions: HashMap::new(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(TopicHandle {
            name: name.to_string(),
            message_ttl: policy.message_ttl(),
        })
    }

    async fn delete_topic(&self, name: &str) -> Result<(), BusError> {
        self.check_online()?;
        lock(&self.topics)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BusError::NotFound(format!("topic {name}")))
    }

    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Option<SubscriptionHandle>, BusError> {
        self.check_online()?;
        let hidden = self.lookup_hidden();
        let topics = lock(&self.topics);
        let state = topics
            .get(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {topic}")))?;
        if hidden {
            return Ok(None);
        }
        Ok(state.subscriptions.get(name).map(|s| SubscriptionHandle {
            topic: topic.to_string(),
            name: name.to_string(),
            lock_duration: s.lock_duration,
        }))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<SubscriptionHandle, BusError> {
        self.check_online()?;
        let mut topics = lock(&self.topics);
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {topic}")))?;
        if state.subscriptions.contains_key(name) {
            return Err(BusError::AlreadyExists(format!("subscription {topic}/{name}")));
        }
        state.subscriptions.insert(
            name.to_string(),
            SubscriptionState {
                lock_duration: policy.lock_duration(),
                queue: Arc::default(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            name: name.to_string(),
            lock_duration: policy.lock_duration(),
        })
    }
}

#[async_trait]
impl SubscriptionSource for InMemoryBus {
    async fn open(
        &self,
        subscription: &SubscriptionHandle,
    ) -> Result<Box<dyn MessageReceiver>, BusError> {
        let queue = self
            .queue(&subscription.topic, &subscription.name)
            .ok_or_else(|| BusError::NotFound(format!("subscription {subscription}")))?;
        Ok(Box::new(InMemoryReceiver { queue }))
    }
}

struct InMemoryReceiver {
    queue: Arc<SubscriptionQueue>,
}

impl InMemoryReceiver {
    fn batch(&self, max_messages: usize) -> Result<Vec<Box<dyn Delivery>>, BusError> {
        if self.queue.fail_receives.load(Ordering::SeqCst) {
            return Err(BusError::Receive("in-memory receiver offline".to_string()));
        }
        Ok(self
            .queue
            .take(max_messages)
            .into_iter()
            .map(|payload| {
                Box::new(InMemoryDelivery {
                    payload,
                    queue: self.queue.clone(),
                    completed: AtomicBool::new(false),
                }) as Box<dyn Delivery>
            })
            .collect())
    }
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn receive(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Box<dyn Delivery>>, BusError> {
        let notified = self.queue.notify.notified();
        let batch = self.batch(max_messages)?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(max_wait, notified).await;
        self.batch(max_messages)
    }
}

struct InMemoryDelivery {
    payload: Bytes,
    queue: Arc<SubscriptionQueue>,
    completed: AtomicBool,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn complete(&self) -> Result<(), BusError> {
        if self.queue.fail_acks.load(Ordering::SeqCst) {
            return Err(BusError::Acknowledge("in-memory ack rejected".to_string()));
        }
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(BusError::Acknowledge("message already completed".to_string()));
        }
        self.queue.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if !self.completed.load(Ordering::SeqCst) {
            self.queue.push_front(self.payload.clone());
        }
    }
}
