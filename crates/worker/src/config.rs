//! Scheduler configuration loaded from environment variables.
//!
//! | Variable                   | Default | Meaning                                |
//! |----------------------------|---------|----------------------------------------|
//! | `DISPATCH_BATCH_SIZE`      | `10`    | tasks claimed per loop iteration       |
//! | `DISPATCH_IDLE_INITIAL_MS` | `250`   | first delay after an empty poll        |
//! | `DISPATCH_IDLE_MAX_MS`     | `5000`  | cap on the empty-poll delay            |
//! | `PIPELINE_TIMEOUT_SECS`    | `60`    | hard limit on output processing        |
//! | `WORKFLOW_CACHE_TTL_SECS`  | `30`    | admission's workflow cache lifetime    |

use std::time::Duration;

use fleet_core::backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: i64,
    /// Delay growth while the queue is empty.
    pub idle_backoff: BackoffConfig,
    pub pipeline_timeout: Duration,
    pub workflow_cache_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            idle_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: 0.2,
            },
            pipeline_timeout: Duration::from_secs(60),
            workflow_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Load from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let batch_size = env_parse("DISPATCH_BATCH_SIZE")
            .filter(|n: &i64| *n > 0)
            .unwrap_or(defaults.batch_size);

        let initial_delay = env_parse("DISPATCH_IDLE_INITIAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_backoff.initial_delay);

        let max_delay = env_parse("DISPATCH_IDLE_MAX_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_backoff.max_delay)
            .max(initial_delay);

        let pipeline_timeout = env_parse("PIPELINE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.pipeline_timeout);

        let workflow_cache_ttl = env_parse("WORKFLOW_CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.workflow_cache_ttl);

        Self {
            batch_size,
            idle_backoff: BackoffConfig {
                initial_delay,
                max_delay,
                ..defaults.idle_backoff
            },
            pipeline_timeout,
            workflow_cache_ttl,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
