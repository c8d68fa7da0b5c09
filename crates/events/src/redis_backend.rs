//! Distributed bus backend on Redis.
//!
//! Publishing writes the latest value with `SET .. EX` and fans out with
//! `PUBLISH fleet:<category>:<key>`. Key subscriptions use `SUBSCRIBE`;
//! category subscriptions use `PSUBSCRIBE fleet:<category>:*`. Each
//! subscription owns a dedicated pub/sub connection that closes when the
//! stream is dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;

use crate::backend::BusBackend;
use crate::error::BusError;
use crate::message::{key_channel, BusMessage, Category, Topic};

/// Prefix for latest-value keys, distinct from channel names.
const LATEST_PREFIX: &str = "latest";

pub struct RedisBackend {
    client: redis::Client,
    conn: MultiplexedConnection,
    latest_ttl: Duration,
}

impl RedisBackend {
    /// Open a client and a shared multiplexed connection for publishing.
    pub async fn connect(url: &str, latest_ttl: Duration) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url = %url, "Connected to Redis bus");
        Ok(Self {
            client,
            conn,
            latest_ttl,
        })
    }

    fn latest_key(category: Category, key: &str) -> String {
        format!("{LATEST_PREFIX}:{}", key_channel(category, key))
    }
}

#[async_trait]
impl BusBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("SET")
            .arg(Self::latest_key(message.category, &message.key))
            .arg(&payload)
            .arg("EX")
            .arg(self.latest_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        let _: i64 = redis::cmd("PUBLISH")
            .arg(message.channel())
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn latest(
        &self,
        category: Category,
        key: &str,
    ) -> Result<Option<BusMessage>, BusError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::latest_key(category, key))
            .query_async(&mut conn)
            .await?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(BusError::from)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = topic.channel_pattern();
        if topic.is_pattern() {
            pubsub.psubscribe(&channel).await?;
        } else {
            pubsub.subscribe(&channel).await?;
        }
        tracing::debug!(channel = %channel, "Redis bus subscription opened");

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let decoded = msg
                .get_payload::<String>()
                .map_err(BusError::from)
                .and_then(|s| serde_json::from_str::<BusMessage>(&s).map_err(BusError::from));
            let out = match decoded {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable bus message");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(stream.boxed())
    }
}
