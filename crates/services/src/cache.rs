//! Key/value cache with per-entry TTL, delivered to the owning component as a
//! `CacheExpiry` signal when an entry expires. Backends are pluggable behind
//! [`CacheBackend`]; an in-memory map is the only backend shipped here (a
//! durable key/value store is named as an acceptable backend by the cache
//! contract but left as a trait object seam — concrete storage integrations
//! are out of scope for this runtime).

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use signal::SideSignal;

/// An entry stored by a [`CacheBackend`].
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// The opaque value blob.
    pub value: serde_yaml::Value,
    /// Arbitrary metadata captured alongside the value.
    pub metadata: Option<serde_yaml::Value>,
    /// The component that registered this entry, used to route the
    /// `CacheExpiry` signal and to purge entries on component stop.
    pub owner: String,
    /// Absolute expiry instant, if any.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Storage contract a cache backend must satisfy. Value blobs are opaque to
/// the service; only the backend touches them.
pub trait CacheBackend: Send + Sync {
    /// Inserts or replaces an entry.
    fn add_data(&self, key: String, entry: CacheEntry);
    /// Returns the current value for `key`, if present and unexpired.
    fn get_data(&self, key: &str) -> Option<serde_yaml::Value>;
    /// Removes an entry, returning it if it was present.
    fn remove_data(&self, key: &str) -> Option<CacheEntry>;
    /// Removes and returns every entry that has expired as of `now`.
    fn sweep_expired(&self, now: Instant) -> Vec<(String, CacheEntry)>;
    /// Removes every entry registered by `owner`, regardless of expiry.
    fn purge_owner(&self, owner: &str);
}

/// An in-memory [`CacheBackend`] behind a single mutex. Sufficient for the
/// conformance scenarios in this runtime's testable properties; a durable
/// backend (key, value blob, expiry timestamp, metadata blob, owner columns)
/// can implement the same trait without the cache service caring.
#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn add_data(&self, key: String, entry: CacheEntry) {
        let _ = self.entries.lock().expect("cache lock poisoned").insert(key, entry);
    }

    fn get_data(&self, key: &str) -> Option<serde_yaml::Value> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            let _ = entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    fn remove_data(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().expect("cache lock poisoned").remove(key)
    }

    fn sweep_expired(&self, now: Instant) -> Vec<(String, CacheEntry)> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key.clone(), entry)).map(|(_, e)| (key, e)))
            .collect()
    }

    fn purge_owner(&self, owner: &str) {
        self.entries.lock().expect("cache lock poisoned").retain(|_, entry| entry.owner != owner);
    }
}

/// Registry of named cache entries with lazy and background expiry checks.
/// One instance is shared process-wide via [`crate::RuntimeServices`].
pub struct CacheService {
    backend: Box<dyn CacheBackend>,
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService {
    /// Creates a cache service backed by an in-memory map.
    pub fn new() -> Self {
        Self::with_backend(Box::new(InMemoryCacheBackend::new()))
    }

    /// Creates a cache service backed by an arbitrary [`CacheBackend`].
    pub fn with_backend(backend: Box<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Stores `value` under `key`, owned by `owner`, expiring after
    /// `expiry_seconds` (if set).
    pub fn add_data(
        &self,
        key: impl Into<String>,
        value: serde_yaml::Value,
        expiry_seconds: Option<u64>,
        metadata: Option<serde_yaml::Value>,
        owner: impl Into<String>,
    ) {
        let entry = CacheEntry {
            value,
            metadata,
            owner: owner.into(),
            expires_at: expiry_seconds.map(|secs| Instant::now() + Duration::from_secs(secs)),
        };
        self.backend.add_data(key.into(), entry);
    }

    /// Returns the value stored under `key`, checking expiry lazily.
    pub fn get_data(&self, key: &str) -> Option<serde_yaml::Value> {
        self.backend.get_data(key)
    }

    /// Removes the entry stored under `key`.
    pub fn remove_data(&self, key: &str) {
        let _ = self.backend.remove_data(key);
    }

    /// Sweeps expired entries, delivering a `CacheExpiry` side signal to each
    /// entry's owner via `side_channels` (owner name -> sender).
    pub async fn sweep(&self, cache_name: &str, side_channels: &HashMap<String, flume::Sender<SideSignal>>) {
        for (key, entry) in self.backend.sweep_expired(Instant::now()) {
            if let Some(sender) = side_channels.get(&entry.owner) {
                let signal = SideSignal::CacheExpiry {
                    cache_name: cache_name.to_string(),
                    key,
                    metadata: entry.metadata,
                    expired_data: Some(entry.value),
                };
                if sender.send_async(signal).await.is_err() {
                    tracing::trace!(owner = %entry.owner, "cache expiry side channel closed, dropping notification");
                }
            }
        }
    }

    /// Purges every entry owned by `owner`, called when the owning component
    /// stops.
    pub fn purge(&self, owner: &str) {
        self.backend.purge_owner(owner);
    }
}
