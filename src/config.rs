// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the mutation relay.
//!
//! Configuration is passed to [`RelayEngine::new()`](crate::RelayEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Loading it from disk or the environment is the host's job.
//!
//! # Quick Start
//!
//! ```rust
//! use mutation_relay::config::{RelayConfig, BrokerConfig};
//!
//! let config = RelayConfig {
//!     broker: BrokerConfig::for_testing("redis://localhost:6379"),
//!     ..Default::default()
//! };
//! assert_eq!(config.sync_topic, "entity.sync");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── consumer_name: Option<String>  # Overrides the host-derived consumer id
//! ├── sync_topic / replay_group      # Where mutations flow
//! ├── broker: BrokerConfig           # Redis URL, read sizing, retention caps
//! ├── reclaim: ReclaimConfig         # Pending sweep schedule and age limit
//! ├── replay: ReplayConfig           # Whether this node applies mutations
//! ├── backfill: BackfillConfig       # Page size, rate limit, schedule
//! ├── abandoned: AbandonedConfig     # Local dead-letter file
//! ├── store: StoreConfig             # SQLite target store
//! └── channel: ChannelConfig         # In-process fan-out capacity
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! sync_topic: "entity.sync"
//! replay_group: "orders-service"
//!
//! broker:
//!   redis_url: "redis://redis:6379"
//!   block_timeout: "5s"
//!   topic_max_len:
//!     audit.events: 100000
//!
//! reclaim:
//!   interval: "30m"
//!   max_pending: "8h"
//!
//! store:
//!   sqlite_path: "/var/lib/app/replica.db"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default stream retention cap (`i16::MAX`).
pub const DEFAULT_MAX_LEN: usize = 32_767;

/// Default rows per backfill page.
pub const DEFAULT_BACKFILL_PAGE_SIZE: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RelayEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Consumer identity inside every consumer group.
    ///
    /// When unset the host name is used, so a restarted process picks up
    /// its own pending entries. See [`RelayConfig::resolve_consumer_name`].
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// Topic the capture hook publishes to and the replayer reads from.
    #[serde(default = "default_sync_topic")]
    pub sync_topic: String,

    /// Consumer group used by the replayer.
    #[serde(default = "default_replay_group")]
    pub replay_group: String,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub reclaim: ReclaimConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub abandoned: AbandonedConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub channel: ChannelConfig,
}

fn default_sync_topic() -> String {
    "entity.sync".to_string()
}

fn default_replay_group() -> String {
    "replay".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            consumer_name: None,
            sync_topic: default_sync_topic(),
            replay_group: default_replay_group(),
            broker: BrokerConfig::default(),
            reclaim: ReclaimConfig::default(),
            replay: ReplayConfig::default(),
            backfill: BackfillConfig::default(),
            abandoned: AbandonedConfig::default(),
            store: StoreConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(redis_url: &str, abandoned_path: &str) -> Self {
        Self {
            consumer_name: Some("test-consumer".to_string()),
            broker: BrokerConfig::for_testing(redis_url),
            reclaim: ReclaimConfig {
                enabled: false,
                ..Default::default()
            },
            abandoned: AbandonedConfig {
                path: abandoned_path.to_string(),
                buffer: 64,
            },
            store: StoreConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Consumer identity: explicit override, then `HOSTNAME`, then
    /// `/etc/hostname`, then `"localhost"`.
    pub fn resolve_consumer_name(&self) -> String {
        if let Some(name) = self.consumer_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
        host_name()
    }
}

/// Best-effort host name lookup.
pub fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "localhost".to_string()
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// BrokerConfig: Redis Streams connection and read sizing
// ═══════════════════════════════════════════════════════════════════════════════

/// Stream broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Example: `"redis://redis.internal:6379"`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// XREADGROUP block timeout as a duration string (e.g., "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per XREADGROUP call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Approximate MAXLEN applied on every XADD.
    #[serde(default = "default_max_len")]
    pub default_max_len: usize,

    /// Per-topic MAXLEN overrides.
    #[serde(default)]
    pub topic_max_len: HashMap<String, usize>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_max_len() -> usize {
    DEFAULT_MAX_LEN
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            block_timeout: default_block_timeout(),
            batch_size: default_batch_size(),
            default_max_len: DEFAULT_MAX_LEN,
            topic_max_len: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn for_testing(redis_url: &str) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            block_timeout: "200ms".to_string(),
            ..Default::default()
        }
    }

    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.block_timeout, Duration::from_secs(5))
    }

    /// Retention cap for a topic.
    pub fn max_len_for(&self, topic: &str) -> usize {
        self.topic_max_len
            .get(topic)
            .copied()
            .unwrap_or(self.default_max_len)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReclaimConfig: pending-entry sweep
// ═══════════════════════════════════════════════════════════════════════════════

/// Reclaim sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Whether the engine schedules reclaim sweeps for its subscriptions.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to sweep (e.g., "30m").
    #[serde(default = "default_reclaim_interval")]
    pub interval: String,

    /// Entries pending longer than this are dead-lettered instead of retried.
    #[serde(default = "default_max_pending")]
    pub max_pending: String,

    /// Pending entries listed per XPENDING page.
    #[serde(default = "default_reclaim_page_size")]
    pub page_size: usize,
}

fn default_reclaim_interval() -> String {
    "30m".to_string()
}

fn default_max_pending() -> String {
    "8h".to_string()
}

fn default_reclaim_page_size() -> usize {
    100
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reclaim_interval(),
            max_pending: default_max_pending(),
            page_size: default_reclaim_page_size(),
        }
    }
}

impl ReclaimConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(30 * 60))
    }

    pub fn max_pending_duration(&self) -> Duration {
        parse_duration_or(&self.max_pending, Duration::from_secs(8 * 60 * 60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplayConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Replay service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Subscribe the replayer to the sync topic on start.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackfillConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Backfill publisher configuration.
///
/// Capture publishes are best-effort. Running backfill periodically over a
/// window wider than the interval is what makes the pairing complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Rows per page.
    #[serde(default = "default_backfill_page_size")]
    pub page_size: usize,

    /// Sustained publish rate; 0 disables the limiter.
    #[serde(default)]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Schedule periodic backfill from the engine.
    #[serde(default = "default_false")]
    pub scheduled: bool,

    /// How often scheduled backfill runs.
    #[serde(default = "default_backfill_interval")]
    pub interval: String,

    /// How far back each scheduled run reaches. Should exceed `interval`.
    #[serde(default = "default_backfill_window")]
    pub window: String,

    /// Registry keys included in scheduled runs. Empty means every key.
    #[serde(default)]
    pub keys: Vec<String>,
}

fn default_backfill_page_size() -> usize {
    DEFAULT_BACKFILL_PAGE_SIZE
}

fn default_rate_limit_burst() -> u32 {
    1000
}

fn default_backfill_interval() -> String {
    "1h".to_string()
}

fn default_backfill_window() -> String {
    "2h".to_string()
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_BACKFILL_PAGE_SIZE,
            rate_limit_per_sec: 0,
            rate_limit_burst: default_rate_limit_burst(),
            scheduled: false,
            interval: default_backfill_interval(),
            window: default_backfill_window(),
            keys: Vec::new(),
        }
    }
}

impl BackfillConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(60 * 60))
    }

    pub fn window_duration(&self) -> Duration {
        parse_duration_or(&self.window, Duration::from_secs(2 * 60 * 60))
    }

    /// Rate limit configuration, or `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_per_sec > 0 {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AbandonedConfig: local dead-letter file
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonedConfig {
    /// JSON-lines file that abandoned messages are appended to.
    #[serde(default = "default_abandoned_path")]
    pub path: String,

    /// Records queued for the writer before `record` waits.
    #[serde(default = "default_abandoned_buffer")]
    pub buffer: usize,
}

fn default_abandoned_path() -> String {
    "abandoned.jsonl".to_string()
}

fn default_abandoned_buffer() -> usize {
    1024
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        Self {
            path: default_abandoned_path(),
            buffer: default_abandoned_buffer(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite target store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "relay.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChannelConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of the sender channel and of each subscriber channel.
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
