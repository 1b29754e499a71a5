//! Ready-made keyed cache and its refresher.
//!
//! [`KeyedCache`] is an LRU-bounded map whose entries can be marked stale instead of
//! evicted; [`KeyedCacheRefresher`] keeps one in step with the farm and reloads stale
//! entries from a [`SnapshotSource`] on read.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use farmsync_types::RefreshKey;
use lru::LruCache;
use tracing::debug;

use super::lock::mutex_lock;
use super::refresher::{Refresher, RefresherError};

const SOURCE: &str = "cache::keyed";

/// The authoritative store behind one cache domain.
#[async_trait]
pub trait SnapshotSource<V>: Send + Sync {
    /// Every entry of the domain; used for full rebuilds.
    async fn load_all(&self) -> Result<Vec<(RefreshKey, V)>, RefresherError>;

    /// One entry, or `None` when it no longer exists.
    async fn load_one(&self, key: &RefreshKey) -> Result<Option<V>, RefresherError>;
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    stale: bool,
}

/// What [`KeyedCache::lookup`] found for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Missing,
}

pub struct KeyedCache<V> {
    entries: Mutex<LruCache<RefreshKey, Slot<V>>>,
}

impl<V: Clone> KeyedCache<V> {
    /// A cache holding at most `capacity` entries; zero is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn lookup(&self, key: &RefreshKey) -> Lookup<V> {
        match mutex_lock(&self.entries, SOURCE, "lookup").get(key) {
            Some(slot) if slot.stale => Lookup::Stale(slot.value.clone()),
            Some(slot) => Lookup::Fresh(slot.value.clone()),
            None => Lookup::Missing,
        }
    }

    /// The value for `key` if present and not stale.
    pub fn get(&self, key: &RefreshKey) -> Option<V> {
        match self.lookup(key) {
            Lookup::Fresh(value) => Some(value),
            Lookup::Stale(_) | Lookup::Missing => None,
        }
    }

    pub fn insert(&self, key: RefreshKey, value: V) {
        mutex_lock(&self.entries, SOURCE, "insert").put(key, Slot {
            value,
            stale: false,
        });
    }

    /// Mark one entry stale; returns whether it was present.
    pub fn mark_stale(&self, key: &RefreshKey) -> bool {
        match mutex_lock(&self.entries, SOURCE, "mark_stale").peek_mut(key) {
            Some(slot) => {
                slot.stale = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_stale(&self) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "mark_all_stale");
        for (_, slot) in entries.iter_mut() {
            slot.stale = true;
        }
    }

    pub fn remove(&self, key: &RefreshKey) -> Option<V> {
        mutex_lock(&self.entries, SOURCE, "remove")
            .pop(key)
            .map(|slot| slot.value)
    }

    /// Swap the whole content for `entries`, all fresh.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (RefreshKey, V)>) {
        let mut guard = mutex_lock(&self.entries, SOURCE, "replace_all");
        guard.clear();
        for (key, value) in entries {
            guard.put(key, Slot {
                value,
                stale: false,
            });
        }
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`Refresher`] over a [`KeyedCache`].
///
/// Key refreshes only mark entries stale; [`KeyedCacheRefresher::get`] reloads them lazily.
pub struct KeyedCacheRefresher<V> {
    cache: Arc<KeyedCache<V>>,
    source: Arc<dyn SnapshotSource<V>>,
}

impl<V> KeyedCacheRefresher<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<KeyedCache<V>>, source: Arc<dyn SnapshotSource<V>>) -> Self {
        Self { cache, source }
    }

    pub fn cache(&self) -> &Arc<KeyedCache<V>> {
        &self.cache
    }

    /// Read-through access: fresh entries come from memory, others from the source.
    pub async fn get(&self, key: &RefreshKey) -> Result<Option<V>, RefresherError> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        match self.source.load_one(key).await? {
            Some(value) => {
                self.cache.insert(key.clone(), value.clone());
                Ok(Some(value))
            }
            None => {
                self.cache.remove(key);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<V> Refresher for KeyedCacheRefresher<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn refresh_all(&self) -> Result<(), RefresherError> {
        self.cache.mark_all_stale();
        Ok(())
    }

    async fn refresh(&self, key: &RefreshKey) -> Result<(), RefresherError> {
        self.cache.mark_stale(key);
        Ok(())
    }

    async fn remove(&self, key: &RefreshKey) -> Result<(), RefresherError> {
        self.cache.remove(key);
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), RefresherError> {
        let entries = self.source.load_all().await?;
        debug!(entries = entries.len(), "Rebuilt keyed cache from snapshot");
        self.cache.replace_all(entries);
        Ok(())
    }
}
