//! Time-boxed schema cache keyed by database identifier.
//!
//! Refreshes are single-flight per database: while one caller refreshes a
//! stale entry, concurrent callers get the stale snapshot instead of starting
//! a second introspection. Callers with no entry at all wait for the refresh.

use super::SchemaSnapshot;
use crate::config::CacheConfig;
use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: Arc<SchemaSnapshot>,
    fetched_at: Instant,
}

#[derive(Debug)]
pub struct SchemaCache {
    ttl: Duration,
    max_entries: usize,
    enabled: bool,
    entries: Mutex<HashMap<String, CacheEntry>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SchemaCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            enabled: true,
            entries: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.ttl(), config.max_size)
        }
    }

    /// A cache that always introspects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO, 1)
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached snapshot if it is still fresh.
    pub fn get_fresh(&self, database: &str) -> Option<Arc<SchemaSnapshot>> {
        self.entries()
            .get(database)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.snapshot.clone())
    }

    /// Drops the entry for one database.
    pub fn invalidate(&self, database: &str) {
        self.entries().remove(database);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Returns the snapshot for `database`, calling `refresh` if it is absent
    /// or older than the TTL.
    ///
    /// If a stale entry exists and the refresh fails, the stale snapshot is
    /// served and the failure is logged.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        database: &str,
        refresh: F,
    ) -> Result<Arc<SchemaSnapshot>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SchemaSnapshot>>,
    {
        if !self.enabled {
            return Ok(Arc::new(check_owner(database, refresh().await?)?));
        }

        if let Some(snapshot) = self.get_fresh(database) {
            return Ok(snapshot);
        }

        let stale = self.entries().get(database).map(|e| e.snapshot.clone());
        let lock = self.refresh_lock(database);

        let _guard = match (&stale, lock.try_lock()) {
            (_, Ok(guard)) => guard,
            (Some(stale), Err(_)) => {
                debug!(database, "Schema refresh in progress, serving stale snapshot");
                return Ok(stale.clone());
            }
            (None, Err(_)) => {
                let guard = lock.lock().await;
                // Whoever held the lock may have filled the entry.
                if let Some(snapshot) = self.get_fresh(database) {
                    return Ok(snapshot);
                }
                guard
            }
        };

        debug!(database, "Refreshing schema snapshot");
        match refresh().await.and_then(|s| check_owner(database, s)) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.insert(database, snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => match stale {
                Some(stale) => {
                    warn!(database, error = %e, "Schema refresh failed, serving stale snapshot");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    fn insert(&self, database: &str, snapshot: Arc<SchemaSnapshot>) {
        let mut entries = self.entries();
        if !entries.contains_key(database) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                debug!(evicted = %key, "Schema cache full, evicting oldest entry");
                entries.remove(&key);
            }
        }
        entries.insert(
            database.to_string(),
            CacheEntry {
                snapshot,
                fetched_at: Instant::now(),
            },
        );
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_lock(&self, database: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(database.to_string())
            .or_default()
            .clone()
    }
}

fn check_owner(database: &str, snapshot: SchemaSnapshot) -> Result<SchemaSnapshot> {
    if snapshot.database != database {
        return Err(GatewayError::internal(format!(
            "schema snapshot for '{}' returned when refreshing '{}'",
            snapshot.database, database
        )));
    }
    Ok(snapshot)
}
