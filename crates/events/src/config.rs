//! Bus configuration loaded from environment variables.
//!
//! | Variable               | Default | Meaning                               |
//! |------------------------|---------|---------------------------------------|
//! | `REDIS_URL`            | unset   | selects the Redis backend when set    |
//! | `BUS_CHANNEL_CAPACITY` | `1024`  | in-process broadcast buffer           |
//! | `BUS_CACHE_CAPACITY`   | `10000` | latest-value cache entries (memory)   |
//! | `BUS_LATEST_TTL_SECS`  | `3600`  | how long latest values are retained   |

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub redis_url: Option<String>,
    pub channel_capacity: usize,
    pub cache_capacity: u64,
    pub latest_ttl: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel_capacity: crate::memory::DEFAULT_CHANNEL_CAPACITY,
            cache_capacity: 10_000,
            latest_ttl: Duration::from_secs(3600),
        }
    }
}

impl BusConfig {
    /// Load from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let channel_capacity = std::env::var("BUS_CHANNEL_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.channel_capacity);

        let cache_capacity = std::env::var("BUS_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.cache_capacity);

        let latest_ttl = std::env::var("BUS_LATEST_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.latest_ttl);

        Self {
            redis_url,
            channel_capacity,
            cache_capacity,
            latest_ttl,
        }
    }
}
