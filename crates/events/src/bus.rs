//! [`NotificationBus`]: the publish/subscribe hub shared via `Arc` across
//! the scheduler and the HTTP layer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::backend::BusBackend;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::memory::MemoryBackend;
use crate::message::{BusMessage, Category, Topic};
use crate::redis_backend::RedisBackend;

#[derive(Clone)]
pub struct NotificationBus {
    backend: Arc<dyn BusBackend>,
}

impl NotificationBus {
    pub fn new(backend: Arc<dyn BusBackend>) -> Self {
        Self { backend }
    }

    /// In-process bus with default capacities.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    /// Redis when `REDIS_URL` is configured, otherwise in-process.
    pub async fn from_config(config: &BusConfig) -> Result<Self, BusError> {
        let backend: Arc<dyn BusBackend> = match &config.redis_url {
            Some(url) => Arc::new(RedisBackend::connect(url, config.latest_ttl).await?),
            None => Arc::new(MemoryBackend::new(
                config.channel_capacity,
                config.cache_capacity,
                config.latest_ttl,
            )),
        };
        tracing::info!(backend = backend.name(), "Notification bus ready");
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Publish a message. Failures are logged, never returned: a lost
    /// notification must not fail the operation that produced it.
    pub async fn publish(&self, message: BusMessage) {
        if let Err(e) = self.backend.publish(&message).await {
            tracing::warn!(
                category = %message.category,
                key = %message.key,
                error = %e,
                "Failed to publish bus message",
            );
        }
    }

    /// Shorthand for `publish(BusMessage::new(..).with_payload(..))`.
    pub async fn emit(&self, category: Category, key: impl ToString, payload: serde_json::Value) {
        self.publish(BusMessage::new(category, key).with_payload(payload))
            .await;
    }

    pub async fn latest(
        &self,
        category: Category,
        key: &str,
    ) -> Result<Option<BusMessage>, BusError> {
        self.backend.latest(category, key).await
    }

    /// Subscribe to `topic` until `cancel` fires or the subscription is
    /// dropped.
    pub async fn subscribe(
        &self,
        topic: Topic,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError> {
        let inner = self.backend.subscribe(&topic).await?;
        let stream = inner.take_until(cancel.cancelled_owned()).boxed();
        Ok(Subscription { topic, stream })
    }
}

/// A live, cancellable stream of bus messages for one topic.
pub struct Subscription {
    topic: Topic,
    stream: BoxStream<'static, BusMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Stream for Subscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}
