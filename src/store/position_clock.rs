//! "Opened at" timestamps of hedged pairs.

use super::KvStore;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::debug;

/// Per-pair holding clock stored under
/// `<NAMESPACE>:POSITION_OPEN:<TOKEN>:<BASE_EXCHANGE>:<QUOTE_EXCHANGE>`.
#[derive(Clone)]
pub struct PositionClock {
    store: Arc<dyn KvStore>,
    namespace: String,
}

impl PositionClock {
    pub fn new(store: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
        }
    }

    pub fn key(&self, token: &str, base: &str, quote: &str) -> String {
        format!("{}:POSITION_OPEN:{}:{}:{}", self.namespace, token, base, quote)
    }

    /// When the pair was opened, if recorded.
    pub async fn opened_at(&self, token: &str, base: &str, quote: &str) -> Result<Option<DateTime<Utc>>> {
        let key = self.key(token, base, quote);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let millis: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid open timestamp under {}", key))?;
        Ok(Utc.timestamp_millis_opt(millis).single())
    }

    /// Record `at` unless the pair already has a timestamp. Returns whether a
    /// new timestamp was written.
    pub async fn mark_opened(&self, token: &str, base: &str, quote: &str, at: DateTime<Utc>) -> Result<bool> {
        let key = self.key(token, base, quote);
        if self.store.get(&key).await?.is_some() {
            return Ok(false);
        }
        self.store
            .set(&key, &at.timestamp_millis().to_string(), None)
            .await?;
        debug!(%key, opened_at = %at, "Recorded pair open time");
        Ok(true)
    }

    pub async fn clear(&self, token: &str, base: &str, quote: &str) -> Result<()> {
        self.store.delete(&self.key(token, base, quote)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn clock() -> PositionClock {
        PositionClock::new(Arc::new(MemoryStore::new()), "FUNDING")
    }

    #[tokio::test]
    async fn test_missing_timestamp_is_none() {
        let clock = clock();
        assert_eq!(clock.opened_at("BTC", "BINANCE", "OKX").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_opened_keeps_first_timestamp() {
        let clock = clock();
        let first = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let later = Utc.timestamp_millis_opt(1_700_000_600_000).unwrap();

        assert!(clock.mark_opened("BTC", "BINANCE", "OKX", first).await.unwrap());
        assert!(!clock.mark_opened("BTC", "BINANCE", "OKX", later).await.unwrap());
        assert_eq!(
            clock.opened_at("BTC", "BINANCE", "OKX").await.unwrap(),
            Some(first)
        );

        clock.clear("BTC", "BINANCE", "OKX").await.unwrap();
        assert_eq!(clock.opened_at("BTC", "BINANCE", "OKX").await.unwrap(), None);
    }

    #[test]
    fn test_key_is_directional() {
        let clock = clock();
        assert_ne!(
            clock.key("BTC", "BINANCE", "OKX"),
            clock.key("BTC", "OKX", "BINANCE")
        );
    }
}
