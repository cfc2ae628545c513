//! Key-value cache access.
//!
//! The keeper reads order books written by external market-data collectors,
//! caches its tunables, and records when each hedged pair was first seen.
//! All of it goes through [`KvStore`]; [`MemoryStore`] is the in-process
//! implementation.

mod memory;
mod orderbook;
mod position_clock;

pub use memory::MemoryStore;
pub use orderbook::OrderBookCache;
pub use position_clock::PositionClock;

use async_trait::async_trait;
use std::time::Duration;

/// Minimal string key-value store with optional expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store `value`; `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}
