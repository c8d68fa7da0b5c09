//! In-process bus backend: `tokio::sync::broadcast` for fan-out and a
//! moka cache for latest values.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use moka::future::Cache;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::BusBackend;
use crate::error::BusError;
use crate::message::{key_channel, BusMessage, Category, Topic};

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryBackend {
    sender: broadcast::Sender<BusMessage>,
    latest: Cache<String, BusMessage>,
}

impl MemoryBackend {
    /// When the channel buffer is full the oldest messages are dropped and
    /// slow subscribers skip ahead.
    pub fn new(channel_capacity: usize, cache_capacity: u64, latest_ttl: Duration) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        let latest = Cache::builder()
            .max_capacity(cache_capacity)
            .time_to_live(latest_ttl)
            .build();
        Self { sender, latest }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, 10_000, Duration::from_secs(3600))
    }
}

#[async_trait]
impl BusBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        self.latest.insert(message.channel(), message.clone()).await;
        // A send error only means there are no subscribers.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn latest(
        &self,
        category: Category,
        key: &str,
    ) -> Result<Option<BusMessage>, BusError> {
        Ok(self.latest.get(&key_channel(category, key)).await)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let topic = topic.clone();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let out = match item {
                Ok(message) if topic.matches(&message) => Some(message),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Bus subscriber lagged, messages dropped");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(stream.boxed())
    }
}
