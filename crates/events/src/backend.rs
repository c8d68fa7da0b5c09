//! Backend seam for the notification bus.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BusError;
use crate::message::{BusMessage, Category, Topic};

#[async_trait]
pub trait BusBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store `message` as the latest value for its key and fan it out.
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;

    /// Last message published for `(category, key)`, if still retained.
    async fn latest(&self, category: Category, key: &str)
        -> Result<Option<BusMessage>, BusError>;

    /// Live messages matching `topic`. Dropping the stream unsubscribes.
    async fn subscribe(&self, topic: &Topic) -> Result<BoxStream<'static, BusMessage>, BusError>;
}
