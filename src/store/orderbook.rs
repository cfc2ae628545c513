//! Order book snapshots cached by the market-data collectors.

use super::KvStore;
use crate::exchange::OrderBook;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read-side of the order book cache.
///
/// Books live under `<NAMESPACE>:<EXCHANGE>:FUTUREU:ORDERBOOK:<SYMBOL>` as
/// `{updatetime, bids, asks}` JSON. A book older than `max_age` is reported as
/// missing rather than served stale.
#[derive(Clone)]
pub struct OrderBookCache {
    store: Arc<dyn KvStore>,
    namespace: String,
    max_age: Duration,
}

impl OrderBookCache {
    pub fn new(store: Arc<dyn KvStore>, namespace: &str, max_age: Duration) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            max_age,
        }
    }

    pub fn key(&self, exchange: &str, symbol: &str) -> String {
        format!(
            "{}:{}:FUTUREU:ORDERBOOK:{}",
            self.namespace, exchange, symbol
        )
    }

    /// Fresh book for `symbol` on `exchange`, if any.
    pub async fn get(&self, exchange: &str, symbol: &str) -> Option<OrderBook> {
        self.get_at(exchange, symbol, Utc::now().timestamp_millis())
            .await
    }

    /// Same as [`get`](Self::get) with an explicit clock.
    pub async fn get_at(&self, exchange: &str, symbol: &str, now_ms: i64) -> Option<OrderBook> {
        let key = self.key(exchange, symbol);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(%key, "Order book not cached");
                return None;
            }
            Err(e) => {
                warn!(%key, error = %e, "Order book read failed");
                return None;
            }
        };

        let book: OrderBook = match serde_json::from_str(&raw) {
            Ok(book) => book,
            Err(e) => {
                warn!(%key, error = %e, "Order book payload malformed");
                return None;
            }
        };

        let age_ms = now_ms - book.update_time;
        if age_ms > self.max_age.as_millis() as i64 {
            debug!(%key, age_ms, "Order book stale, ignoring");
            return None;
        }
        Some(book)
    }

    /// Write a book, used by tests and the paper simulator.
    pub async fn put(&self, exchange: &str, symbol: &str, book: &OrderBook) -> anyhow::Result<()> {
        let payload = serde_json::to_string(book)?;
        self.store
            .set(&self.key(exchange, symbol), &payload, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::BookLevel;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn cache() -> OrderBookCache {
        OrderBookCache::new(Arc::new(MemoryStore::new()), "FUNDING", Duration::from_secs(5))
    }

    fn book(update_time: i64) -> OrderBook {
        OrderBook {
            update_time,
            bids: vec![BookLevel(dec!(100), dec!(1))],
            asks: vec![BookLevel(dec!(101), dec!(1))],
        }
    }

    #[test]
    fn test_key_shape() {
        assert_eq!(
            cache().key("BINANCE", "BTCUSDT"),
            "FUNDING:BINANCE:FUTUREU:ORDERBOOK:BTCUSDT"
        );
    }

    #[tokio::test]
    async fn test_fresh_book_is_served() {
        let cache = cache();
        let now = 1_700_000_000_000;
        cache.put("BINANCE", "BTCUSDT", &book(now - 1_000)).await.unwrap();

        let found = cache.get_at("BINANCE", "BTCUSDT", now).await;
        assert_eq!(found.and_then(|b| b.best_bid()), Some(dec!(100)));
    }

    #[tokio::test]
    async fn test_ten_second_old_book_is_not_found() {
        let cache = cache();
        let now = 1_700_000_000_000;
        cache.put("BINANCE", "BTCUSDT", &book(now - 10_000)).await.unwrap();

        assert_eq!(cache.get_at("BINANCE", "BTCUSDT", now).await, None);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let cache = OrderBookCache::new(store.clone(), "FUNDING", Duration::from_secs(5));
        store
            .set(&cache.key("OKX", "BTC-USDT-SWAP"), "not json", None)
            .await
            .unwrap();

        assert_eq!(cache.get("OKX", "BTC-USDT-SWAP").await, None);
    }
}
