//! Background loop keeping the result cache in step with the strength store
//!
//! Each poll runs Polling → Fetching → Merging → Committing. A failed poll
//! leaves the committed cache and cursor as they were; the next poll retries
//! from that cursor.

use super::merge::CacheData;
use super::store::{CacheError, ResultCache};
use crate::pipeline::db::StrengthStore;
use crate::pipeline::shutdown::ShutdownToken;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What a single refresh did
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Store has nothing newer than the cursor
    UpToDate,
    /// Newer timestamp reported but no rows fetched
    NothingFetched,
    /// Shutdown requested between phases; nothing committed
    Cancelled,
    Committed {
        cursor: NaiveDateTime,
        new_points: usize,
    },
}

pub struct CacheRefresher {
    store: Arc<dyn StrengthStore>,
    cache: ResultCache,
    poll_interval: Duration,
    retention: Option<chrono::Duration>,
    shutdown: ShutdownToken,
}

impl CacheRefresher {
    pub fn new(
        store: Arc<dyn StrengthStore>,
        cache: ResultCache,
        poll_interval: Duration,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            cache,
            poll_interval,
            retention: None,
            shutdown,
        }
    }

    /// Prune points older than `hours` behind the cursor on every merge
    pub fn with_retention_hours(mut self, hours: Option<i64>) -> Self {
        self.retention = hours.map(chrono::Duration::hours);
        self
    }

    /// One pass through the refresh phases
    pub async fn refresh_once(&self) -> Result<RefreshOutcome, CacheError> {
        // Polling
        let snapshot = match self.cache.read() {
            Ok(snapshot) => snapshot,
            Err(e @ (CacheError::Json(_) | CacheError::InvalidCursor(_))) => {
                log::warn!("⚠️  Cache files unreadable ({}), rebuilding from store", e);
                None
            }
            Err(e) => return Err(e),
        };
        let cursor = snapshot.as_ref().map(|(cursor, _)| *cursor);

        let Some(latest) = self.store.latest_timestamp().await? else {
            return Ok(RefreshOutcome::UpToDate);
        };
        if cursor.is_some_and(|c| latest <= c) {
            return Ok(RefreshOutcome::UpToDate);
        }

        // Fetching
        let rows = self.store.samples_since(cursor).await?;
        let batch = CacheData::from_rows(&rows);
        let Some(batch_max) = batch.max_timestamp() else {
            log::debug!("🔍 Store reported {} but returned no rows", latest);
            return Ok(RefreshOutcome::NothingFetched);
        };
        if self.shutdown.is_cancelled() {
            return Ok(RefreshOutcome::Cancelled);
        }

        // Merging
        let existing = snapshot.map(|(_, data)| data).unwrap_or_default();
        let mut merged = existing.merge(&batch);
        if let Some(retention) = self.retention {
            merged.prune_before(batch_max - retention);
        }
        if self.shutdown.is_cancelled() {
            return Ok(RefreshOutcome::Cancelled);
        }

        // Committing
        self.cache.commit(&merged, batch_max)?;

        Ok(RefreshOutcome::Committed {
            cursor: batch_max,
            new_points: batch.point_count(),
        })
    }

    /// Poll until shutdown; failures are logged and retried next poll
    pub async fn run(self) {
        log::info!("🔄 Cache refresh loop started");
        log::info!("   ├─ Cache dir: {}", self.cache.dir().display());
        log::info!("   └─ Poll interval: {:?}", self.poll_interval);

        while !self.shutdown.is_cancelled() {
            match self.refresh_once().await {
                Ok(RefreshOutcome::Committed { cursor, new_points }) => {
                    log::info!(
                        "✅ Cache updated: {} new points, last data point {}",
                        new_points,
                        cursor
                    );
                }
                Ok(RefreshOutcome::Cancelled) => break,
                Ok(_) => {}
                Err(e) => {
                    log::error!("❌ Cache refresh failed: {}", e);
                }
            }

            if !self.shutdown.sleep(self.poll_interval).await {
                break;
            }
        }

        log::info!("🛑 Cache refresh loop stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::StoreError;
    use crate::pipeline::types::{StrengthRow, StrengthSample, TOKEN_SECTION};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    /// In-memory store whose reads can be made to fail
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<StrengthRow>>,
        failing: AtomicBool,
        /// Cancelled from inside the next fetch
        cancel_on_fetch: Mutex<Option<ShutdownToken>>,
    }

    impl MemoryStore {
        fn add(&self, ts: NaiveDateTime, key: &str, strength: f64) {
            self.rows.lock().unwrap().push(StrengthRow {
                timestamp: ts,
                section: TOKEN_SECTION.to_string(),
                key: key.to_string(),
                strength: Some(strength),
            });
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::LockPoisoned)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StrengthStore for MemoryStore {
        async fn write_batch(&self, samples: &[StrengthSample]) -> Result<usize, StoreError> {
            Ok(samples.len())
        }

        async fn latest_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError> {
            self.check()?;
            Ok(self.rows.lock().unwrap().iter().map(|r| r.timestamp).max())
        }

        async fn samples_since(
            &self,
            since: Option<NaiveDateTime>,
        ) -> Result<Vec<StrengthRow>, StoreError> {
            self.check()?;
            if let Some(shutdown) = self.cancel_on_fetch.lock().unwrap().take() {
                shutdown.cancel();
            }
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| since.map_or(true, |s| r.timestamp > s))
                .cloned()
                .collect())
        }
    }

    fn refresher(store: Arc<MemoryStore>, dir: &TempDir) -> CacheRefresher {
        CacheRefresher::new(
            store,
            ResultCache::open(dir.path()).unwrap(),
            Duration::from_millis(10),
            ShutdownToken::new(),
        )
    }

    #[tokio::test]
    async fn test_empty_store_is_up_to_date() {
        let dir = TempDir::new().unwrap();
        let refresher = refresher(Arc::new(MemoryStore::default()), &dir);
        assert_eq!(refresher.refresh_once().await.unwrap(), RefreshOutcome::UpToDate);
        assert!(refresher.cache.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incremental_refresh_advances_cursor() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let refresher = refresher(store.clone(), &dir);

        store.add(at(12, 0), "ETH_1027", 1.0);
        store.add(at(12, 10), "ETH_1027", 1.1);
        assert_eq!(
            refresher.refresh_once().await.unwrap(),
            RefreshOutcome::Committed {
                cursor: at(12, 10),
                new_points: 2
            }
        );
        assert_eq!(refresher.refresh_once().await.unwrap(), RefreshOutcome::UpToDate);

        store.add(at(12, 20), "ETH_1027", 1.2);
        store.add(at(12, 20), "SOL_5426", 0.8);
        assert_eq!(
            refresher.refresh_once().await.unwrap(),
            RefreshOutcome::Committed {
                cursor: at(12, 20),
                new_points: 2
            }
        );

        let (cursor, data) = refresher.cache.read().unwrap().unwrap();
        assert_eq!(cursor, at(12, 20));
        assert_eq!(data.series(TOKEN_SECTION, "ETH_1027").unwrap().len(), 3);
        assert_eq!(data.series(TOKEN_SECTION, "SOL_5426").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_preserves_cache() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let refresher = refresher(store.clone(), &dir);

        store.add(at(12, 0), "ETH_1027", 1.0);
        refresher.refresh_once().await.unwrap();
        let before = std::fs::read(refresher.cache.data_path()).unwrap();

        store.add(at(12, 10), "ETH_1027", 1.1);
        store.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            refresher.refresh_once().await,
            Err(CacheError::Store(_))
        ));
        assert_eq!(std::fs::read(refresher.cache.data_path()).unwrap(), before);
        assert_eq!(refresher.cache.cursor().unwrap(), Some(at(12, 0)));

        store.failing.store(false, Ordering::SeqCst);
        refresher.refresh_once().await.unwrap();
        assert_eq!(refresher.cache.cursor().unwrap(), Some(at(12, 10)));
    }

    #[tokio::test]
    async fn test_shutdown_during_fetch_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let shutdown = ShutdownToken::new();
        let refresher = CacheRefresher::new(
            store.clone(),
            ResultCache::open(dir.path()).unwrap(),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        store.add(at(12, 0), "ETH_1027", 1.0);
        refresher.refresh_once().await.unwrap();
        let data_before = std::fs::read(refresher.cache.data_path()).unwrap();
        let cursor_before = std::fs::read(refresher.cache.cursor_path()).unwrap();

        store.add(at(12, 10), "ETH_1027", 1.1);
        *store.cancel_on_fetch.lock().unwrap() = Some(shutdown.clone());
        assert_eq!(refresher.refresh_once().await.unwrap(), RefreshOutcome::Cancelled);
        assert!(shutdown.is_cancelled());

        assert_eq!(std::fs::read(refresher.cache.data_path()).unwrap(), data_before);
        assert_eq!(std::fs::read(refresher.cache.cursor_path()).unwrap(), cursor_before);
        let mut entries: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["chart_data.json", "last_update.json"]);
    }

    #[tokio::test]
    async fn test_retention_prunes_behind_cursor() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let refresher = refresher(store.clone(), &dir).with_retention_hours(Some(1));

        store.add(at(10, 0), "ETH_1027", 1.0);
        store.add(at(11, 30), "ETH_1027", 1.0);
        store.add(at(12, 0), "ETH_1027", 1.0);
        refresher.refresh_once().await.unwrap();

        let (_, data) = refresher.cache.read().unwrap().unwrap();
        let series = data.series(TOKEN_SECTION, "ETH_1027").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].timestamp, at(11, 30));
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let refresher = refresher(store.clone(), &dir);

        store.add(at(12, 0), "ETH_1027", 1.0);
        std::fs::write(refresher.cache.cursor_path(), "{not json").unwrap();

        refresher.refresh_once().await.unwrap();
        assert_eq!(refresher.cache.cursor().unwrap(), Some(at(12, 0)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.add(at(12, 0), "ETH_1027", 1.0);

        let shutdown = ShutdownToken::new();
        let cache = ResultCache::open(dir.path()).unwrap();
        let handle = CacheRefresher::new(
            store,
            cache.clone(),
            Duration::from_secs(3600),
            shutdown.clone(),
        )
        .spawn();

        // First poll runs immediately
        for _ in 0..100 {
            if cache.cursor().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.cursor().unwrap(), Some(at(12, 0)));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresh loop did not stop")
            .unwrap();
    }
}
