/// Read cache shared by every view
/// Keys are resource kind plus id; entries carry a staleness flag
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;

use crate::{Job, JobId, VideoId};

const INVALIDATION_BUFFER: usize = 1024;

/// Composite cache key, rendered as `<kind>:<id>` or `<kind>:list`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Job(JobId),
    JobList,
    Video(VideoId),
    VideoList,
    NoteList,
}

impl CacheKey {
    /// The list-level keys refreshed on every resynchronization
    pub const LISTS: [CacheKey; 3] = [CacheKey::JobList, CacheKey::VideoList, CacheKey::NoteList];

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            CacheKey::JobList | CacheKey::VideoList | CacheKey::NoteList
        )
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            CacheKey::Job(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Job(id) => write!(f, "jobs:{id}"),
            CacheKey::JobList => f.write_str("jobs:list"),
            CacheKey::Video(id) => write!(f, "videos:{id}"),
            CacheKey::VideoList => f.write_str("videos:list"),
            CacheKey::NoteList => f.write_str("notes:list"),
        }
    }
}

/// Cached value; views store fetched payloads as JSON
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Job(Job),
    Json(serde_json::Value),
}

impl CacheValue {
    pub fn into_job(self) -> Option<Job> {
        match self {
            CacheValue::Job(job) => Some(job),
            CacheValue::Json(_) => None,
        }
    }
}

/// Key-value cache the synchronizer patches and invalidates.
///
/// `invalidate` only marks an entry stale; refetching is left to whoever
/// consumes the cache.
pub trait Cache: Send + Sync {
    fn read(&self, key: &CacheKey) -> Option<CacheValue>;

    fn write(&self, key: CacheKey, value: CacheValue);

    fn invalidate(&self, key: &CacheKey);

    fn remove(&self, key: &CacheKey);

    /// Keys that currently hold a value
    fn keys(&self) -> Vec<CacheKey>;
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    value: Option<CacheValue>,
    stale: bool,
    invalidations: u64,
}

/// In-memory cache that announces invalidated keys to subscribers
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    invalidated_tx: broadcast::Sender<CacheKey>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (invalidated_tx, _) = broadcast::channel(INVALIDATION_BUFFER);
        Self {
            entries: RwLock::new(HashMap::new()),
            invalidated_tx,
        }
    }

    /// Receive every key as it is invalidated (background refetchers)
    pub fn subscribe(&self) -> broadcast::Receiver<CacheKey> {
        self.invalidated_tx.subscribe()
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.stale)
            .unwrap_or(false)
    }

    /// How many times `key` has been invalidated since the cache was created
    pub fn invalidation_count(&self, key: &CacheKey) -> u64 {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.invalidations)
            .unwrap_or(0)
    }

    pub fn read_job(&self, id: &JobId) -> Option<Job> {
        self.read(&CacheKey::Job(id.clone()))
            .and_then(CacheValue::into_job)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn read(&self, key: &CacheKey) -> Option<CacheValue> {
        self.entries
            .read()
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    fn write(&self, key: CacheKey, value: CacheValue) {
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.value = Some(value);
        entry.stale = false;
    }

    fn invalidate(&self, key: &CacheKey) {
        {
            let mut entries = self.entries.write();
            let entry = entries.entry(key.clone()).or_default();
            entry.stale = true;
            entry.invalidations += 1;
        }

        // Nobody listening is fine
        let _ = self.invalidated_tx.send(key.clone());
    }

    fn remove(&self, key: &CacheKey) {
        // Counters survive removal so invalidation history stays observable
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.value = None;
            entry.stale = false;
        }
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }
}
