//! Tunable parameter resolution: cache, then database, then defaults.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TunableParams;
use crate::persistence::PersistenceManager;
use crate::store::KvStore;

/// Loads the project's [`TunableParams`] once per cycle.
///
/// The cached copy under `<NAMESPACE>:CONFIG:<PROJECT>` is served for its TTL
/// as long as it validates; on a miss the database row (or the configured
/// defaults) is read, validated and written back to the cache.
pub struct TunableSource {
    store: Arc<dyn KvStore>,
    db: Arc<PersistenceManager>,
    project: String,
    key: String,
    ttl: Duration,
    defaults: TunableParams,
}

impl TunableSource {
    pub fn new(
        store: Arc<dyn KvStore>,
        db: Arc<PersistenceManager>,
        namespace: &str,
        project: &str,
        ttl: Duration,
        defaults: TunableParams,
    ) -> Self {
        Self {
            store,
            db,
            project: project.to_string(),
            key: format!("{}:CONFIG:{}", namespace, project),
            ttl,
            defaults,
        }
    }

    pub async fn load(&self) -> Result<TunableParams> {
        if let Some(cached) = self.cached().await {
            return Ok(cached);
        }

        let tunables = match self.db.load_tunables(&self.project)? {
            Some(stored) => stored,
            None => {
                debug!(project = %self.project, "No stored tunables, using defaults");
                self.defaults.clone()
            }
        };
        tunables
            .validate()
            .with_context(|| format!("Invalid tunables for project {}", self.project))?;

        let blob = serde_json::to_string(&tunables)?;
        if let Err(e) = self.store.set(&self.key, &blob, Some(self.ttl)).await {
            warn!(key = %self.key, error = %e, "Failed to cache tunables");
        }
        Ok(tunables)
    }

    async fn cached(&self) -> Option<TunableParams> {
        let raw = match self.store.get(&self.key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Tunables cache read failed");
                return None;
            }
        };
        let tunables = match serde_json::from_str::<TunableParams>(&raw) {
            Ok(tunables) => tunables,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Cached tunables malformed, reloading");
                return None;
            }
        };
        if let Err(e) = tunables.validate() {
            warn!(key = %self.key, error = %e, "Cached tunables invalid, reloading");
            return None;
        }
        Some(tunables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn source(store: Arc<MemoryStore>, db: Arc<PersistenceManager>) -> TunableSource {
        TunableSource::new(
            store,
            db,
            "FUNDING",
            "alpha",
            Duration::from_secs(3600),
            TunableParams::default(),
        )
    }

    #[tokio::test]
    async fn test_miss_reads_database_and_fills_cache() {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(PersistenceManager::in_memory().unwrap());
        let mut stored = TunableParams::default();
        stored.max_settle_pairs = 1;
        db.save_tunables("alpha", &stored).unwrap();

        let source = source(store.clone(), db.clone());
        assert_eq!(source.load().await.unwrap().max_settle_pairs, 1);
        assert!(store.get("FUNDING:CONFIG:alpha").await.unwrap().is_some());

        // Served from cache until it expires or is dropped
        stored.max_settle_pairs = 2;
        db.save_tunables("alpha", &stored).unwrap();
        assert_eq!(source.load().await.unwrap().max_settle_pairs, 1);

        store.delete("FUNDING:CONFIG:alpha").await.unwrap();
        assert_eq!(source.load().await.unwrap().max_settle_pairs, 2);
    }

    #[tokio::test]
    async fn test_invalid_cached_blob_is_reloaded_from_database() {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(PersistenceManager::in_memory().unwrap());
        let mut stored = TunableParams::default();
        stored.max_settle_pairs = 1;
        db.save_tunables("alpha", &stored).unwrap();

        let mut bad = TunableParams::default();
        bad.decrease_percent = dec!(0.5);
        bad.min_settle_delta_bps = dec!(30);
        store
            .set("FUNDING:CONFIG:alpha", &serde_json::to_string(&bad).unwrap(), None)
            .await
            .unwrap();

        let tunables = source(store.clone(), db).load().await.unwrap();
        assert_eq!(tunables.decrease_percent, dec!(0.2));
        assert_eq!(tunables.max_settle_pairs, 1);

        // The cache now holds the validated copy
        let raw = store.get("FUNDING:CONFIG:alpha").await.unwrap().unwrap();
        let cached: TunableParams = serde_json::from_str(&raw).unwrap();
        assert_eq!(cached, stored);
    }

    #[tokio::test]
    async fn test_defaults_when_nothing_stored() {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(PersistenceManager::in_memory().unwrap());
        let tunables = tokio_test::assert_ok!(source(store, db).load().await);
        assert_eq!(tunables, TunableParams::default());
    }

    #[tokio::test]
    async fn test_invalid_stored_tunables_fail() {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(PersistenceManager::in_memory().unwrap());
        let mut stored = TunableParams::default();
        stored.decrease_percent = dec!(0.5);
        db.save_tunables("alpha", &stored).unwrap();

        tokio_test::assert_err!(source(store, db).load().await);
    }
}
