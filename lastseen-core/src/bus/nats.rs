//! NATS JetStream adapter.
//!
//! A topic is a stream bound to the subject of the same name, with the
//! policy's message TTL as `max_age`. A subscription is a durable pull
//! consumer on that stream with explicit acks and the policy's lock duration
//! as `ack_wait`.

use super::{
    BusError, ChannelManager, Delivery, MessageReceiver, SubscriptionHandle, SubscriptionSource,
    TopicHandle,
};
use async_nats::jetstream::{
    self, ErrorCode,
    consumer::{AckPolicy, PullConsumer, pull},
    context::{CreateStreamErrorKind, GetStreamErrorKind},
    stream::{self, ConsumerErrorKind},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lastseen_sdk::config::ChannelPolicy;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct JetStreamBus {
    context: jetstream::Context,
}

impl JetStreamBus {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BusError> {
        info!(timeout_ms = timeout.as_millis(), "Connecting to NATS");
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        info!("Connected to NATS");
        Ok(Self::new(jetstream::new(client)))
    }

    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    async fn stream(&self, topic: &str) -> Result<stream::Stream, BusError> {
        self.context
            .get_stream(topic)
            .await
            .map_err(|e| BusError::Management(format!("topic {topic}: {e}")))
    }
}

/// Consumer lookups return a boxed error; the server's error code is either
/// carried as a `jetstream::Error` or only visible in the rendered message.
fn is_consumer_not_found(err: &async_nats::Error) -> bool {
    match err.downcast_ref::<jetstream::Error>() {
        Some(js) => js.error_code() == ErrorCode::CONSUMER_NOT_FOUND,
        None => err.to_string().contains("consumer not found"),
    }
}

#[async_trait]
impl ChannelManager for JetStreamBus {
    async fn get_topic(&self, name: &str) -> Result<Option<TopicHandle>, BusError> {
        match self.context.get_stream(name).await {
            Ok(stream) => Ok(Some(TopicHandle {
                name: name.to_string(),
                message_ttl: stream.cached_info().config.max_age,
            })),
            Err(e) => match e.kind() {
                GetStreamErrorKind::JetStream(js)
                    if js.error_code() == ErrorCode::STREAM_NOT_FOUND =>
                {
                    Ok(None)
                }
                _ => Err(BusError::Management(format!("topic {name}: {e}"))),
            },
        }
    }

    async fn create_topic(
        &self,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<TopicHandle, BusError> {
        let config = stream::Config {
            name: name.to_string(),
            subjects: vec![name.to_string()],
            max_age: policy.message_ttl(),
            ..Default::default()
        };
        match self.context.create_stream(config).await {
            Ok(stream) => Ok(TopicHandle {
                name: name.to_string(),
                message_ttl: stream.cached_info().config.max_age,
            }),
            Err(e) => match e.kind() {
                CreateStreamErrorKind::JetStream(js)
                    if js.error_code() == ErrorCode::STREAM_NAME_EXIST =>
                {
                    Err(BusError::AlreadyExists(format!("topic {name}")))
                }
                _ => Err(BusError::Management(format!("topic {name}: {e}"))),
            },
        }
    }

    async fn delete_topic(&self, name: &str) -> Result<(), BusError> {
        self.context
            .delete_stream(name)
            .await
            .map_err(|e| BusError::Management(format!("topic {name}: {e}")))?;
        Ok(())
    }

    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Option<SubscriptionHandle>, BusError> {
        let stream = self.stream(topic).await?;
        match stream.get_consumer::<pull::Config>(name).await {
            Ok(consumer) => Ok(Some(SubscriptionHandle {
                topic: topic.to_string(),
                name: name.to_string(),
                lock_duration: consumer.cached_info().config.ack_wait,
            })),
            Err(e) if is_consumer_not_found(&e) => Ok(None),
            Err(e) => Err(BusError::Management(format!(
                "subscription {topic}/{name}: {e}"
            ))),
        }
    }

    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<SubscriptionHandle, BusError> {
        let stream = self.stream(topic).await?;
        let config = pull::Config {
            durable_name: Some(name.to_string()),
            ack_policy: AckPolicy::Explicit,
            ack_wait: policy.lock_duration(),
            ..Default::default()
        };
        match stream.create_consumer(config).await {
            Ok(consumer) => Ok(SubscriptionHandle {
                topic: topic.to_string(),
                name: name.to_string(),
                lock_duration: consumer.cached_info().config.ack_wait,
            }),
            Err(e) => match e.kind() {
                ConsumerErrorKind::JetStream(js)
                    if js.error_code() == ErrorCode::CONSUMER_ALREADY_EXISTS
                        || js.error_code() == ErrorCode::CONSUMER_NAME_EXIST =>
                {
                    Err(BusError::AlreadyExists(format!("subscription {topic}/{name}")))
                }
                _ => Err(BusError::Management(format!(
                    "subscription {topic}/{name}: {e}"
                ))),
            },
        }
    }
}

#[async_trait]
impl SubscriptionSource for JetStreamBus {
    async fn open(
        &self,
        subscription: &SubscriptionHandle,
    ) -> Result<Box<dyn MessageReceiver>, BusError> {
        let stream = self.stream(&subscription.topic).await?;
        let consumer: PullConsumer = stream
            .get_consumer(&subscription.name)
            .await
            .map_err(|e| BusError::Management(format!("subscription {subscription}: {e}")))?;
        debug!(%subscription, "Opened JetStream receiver");
        Ok(Box::new(JetStreamReceiver {
            consumer,
            subscription: subscription.to_string(),
        }))
    }
}

struct JetStreamReceiver {
    consumer: PullConsumer,
    subscription: String,
}

#[async_trait]
impl MessageReceiver for JetStreamReceiver {
    async fn receive(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Box<dyn Delivery>>, BusError> {
        // `fetch()` asks the server not to wait and returns at once on an
        // empty subscription; `batch()` holds the pull open until `expires`.
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max_messages)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| BusError::Receive(e.to_string()))?;

        let mut deliveries: Vec<Box<dyn Delivery>> = Vec::new();
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => deliveries.push(Box::new(JetStreamDelivery { message })),
                Err(e) => {
                    warn!(subscription = %self.subscription, error = %e, "Error receiving message from batch");
                }
            }
        }
        Ok(deliveries)
    }
}

struct JetStreamDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn complete(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Acknowledge(e.to_string()))
    }
}
