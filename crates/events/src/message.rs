//! Bus message envelope, categories and subscription topics.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Channel prefix shared by every backend.
pub const CHANNEL_PREFIX: &str = "fleet";

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Node liveness changes. Key: node id.
    NodeStatus,
    /// GPU/CPU monitor readings. Key: node id. Never persisted.
    NodeMonitor,
    /// Task status and progress. Key: task id.
    Task,
    /// Base64 preview frames. Key: task id. Never persisted.
    TaskPreview,
    /// Task created or finished for a workflow. Key: workflow id.
    Workflow,
    /// Ledger balance changed. Key: `account:<id>` or `token:<id>`.
    Balance,
    /// User notification created. Key: user id.
    Notification,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::NodeStatus,
        Category::NodeMonitor,
        Category::Task,
        Category::TaskPreview,
        Category::Workflow,
        Category::Balance,
        Category::Notification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::NodeStatus => "node_status",
            Category::NodeMonitor => "node_monitor",
            Category::Task => "task",
            Category::TaskPreview => "task_preview",
            Category::Workflow => "workflow",
            Category::Balance => "balance",
            Category::Notification => "notification",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BusError::UnknownCategory(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// BusMessage
// ---------------------------------------------------------------------------

/// A message published on the bus.
///
/// Constructed via [`BusMessage::new`] and enriched with
/// [`with_payload`](BusMessage::with_payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub category: Category,
    pub key: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(category: Category, key: impl ToString) -> Self {
        Self {
            category,
            key: key.to_string(),
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Channel this message is published on: `fleet:<category>:<key>`.
    pub fn channel(&self) -> String {
        key_channel(self.category, &self.key)
    }
}

pub fn key_channel(category: Category, key: &str) -> String {
    format!("{CHANNEL_PREFIX}:{category}:{key}")
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every key in a category.
    Category(Category),
    /// One key in a category.
    Key(Category, String),
}

impl Topic {
    pub fn category(category: Category) -> Self {
        Topic::Category(category)
    }

    pub fn key(category: Category, key: impl ToString) -> Self {
        Topic::Key(category, key.to_string())
    }

    pub fn matches(&self, message: &BusMessage) -> bool {
        match self {
            Topic::Category(c) => *c == message.category,
            Topic::Key(c, k) => *c == message.category && *k == message.key,
        }
    }

    /// Redis channel (for keys) or glob pattern (for categories).
    pub fn channel_pattern(&self) -> String {
        match self {
            Topic::Category(c) => format!("{CHANNEL_PREFIX}:{c}:*"),
            Topic::Key(c, k) => key_channel(*c, k),
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Topic::Category(_))
    }
}
