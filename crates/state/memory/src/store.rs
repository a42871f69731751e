use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use doorman_state::error::StateError;
use doorman_state::key::{KeyKind, StateKey};
use doorman_state::store::SharedStore;

/// A single entry in the in-memory store.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    last_used: Instant,
}

impl Entry {
    /// Returns `true` if this entry has passed its TTL deadline.
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Compute the expiry instant from an optional TTL duration.
fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// Default size cap: enough for every config entity plus live counters in a
/// development deployment without risking unbounded growth.
const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// In-memory [`SharedStore`] backed by a [`DashMap`].
///
/// Entries are lazily evicted on read when their TTL has elapsed. When the
/// map reaches its size cap, expired entries are swept first; if the map is
/// still full the least-recently-used live entry is evicted.
pub struct MemorySharedStore {
    data: DashMap<String, Entry>,
    max_entries: usize,
}

impl Default for MemorySharedStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for MemorySharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySharedStore")
            .field("len", &self.data.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl MemorySharedStore {
    /// Create a store with the default size cap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with an explicit size cap.
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            data: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    fn render_key(key: &StateKey) -> String {
        key.canonical()
    }

    /// Enforce the size cap before inserting a new key: sweep expired
    /// entries, then evict the least-recently-used live entry if needed.
    fn make_room(&self) {
        if self.data.len() < self.max_entries {
            return;
        }
        self.data.retain(|_, entry| !entry.is_expired());
        if self.data.len() < self.max_entries {
            return;
        }
        let lru = self
            .data
            .iter()
            .min_by_key(|entry| entry.value().last_used)
            .map(|entry| entry.key().clone());
        if let Some(key) = lru {
            self.data.remove(&key);
        }
    }

    /// Number of live (non-expired) entries. Test and diagnostics helper.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.data
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .count()
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        let rendered = Self::render_key(key);

        // Lazy TTL eviction: check and remove if expired.
        if let Some(mut entry) = self.data.get_mut(&rendered) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(&rendered);
                return Ok(None);
            }
            entry.last_used = Instant::now();
            return Ok(Some(entry.value.clone()));
        }

        Ok(None)
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let rendered = Self::render_key(key);
        let expires_at = expiry_from_ttl(ttl);

        if !self.data.contains_key(&rendered) {
            self.make_room();
        }
        let now = Instant::now();
        self.data
            .entry(rendered)
            .and_modify(|entry| {
                value.clone_into(&mut entry.value);
                entry.expires_at = expires_at;
                entry.last_used = now;
            })
            .or_insert_with(|| Entry {
                value: value.to_owned(),
                expires_at,
                last_used: now,
            });

        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);

        // Remove, but treat expired entries as "not found".
        match self.data.remove(&rendered) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &StateKey, delta: i64) -> Result<i64, StateError> {
        let rendered = Self::render_key(key);

        // Remove any expired entry first so the counter starts fresh.
        self.data
            .remove_if(&rendered, |_, entry| entry.is_expired());

        if !self.data.contains_key(&rendered) {
            self.make_room();
        }
        let now = Instant::now();
        let mut ref_mut = self.data.entry(rendered).or_insert_with(|| Entry {
            value: "0".to_owned(),
            expires_at: None,
            last_used: now,
        });

        let current: i64 = ref_mut
            .value
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                StateError::Serialization(format!("counter value is not an integer: {e}"))
            })?;

        let new_value = current + delta;
        ref_mut.value = new_value.to_string();
        ref_mut.last_used = now;

        Ok(new_value)
    }

    async fn expire(&self, key: &StateKey, ttl: Duration) -> Result<(), StateError> {
        let rendered = Self::render_key(key);
        if let Some(mut entry) = self.data.get_mut(&rendered)
            && !entry.is_expired()
        {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn scan_prefix(
        &self,
        kind: KeyKind,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StateError> {
        let full_prefix = format!("{kind}:{prefix}");
        let kind_prefix_len = kind.as_str().len() + 1;

        let mut results = Vec::new();
        for entry in &self.data {
            let key = entry.key();
            if key.starts_with(&full_prefix) && !entry.value().is_expired() {
                results.push((
                    key[kind_prefix_len..].to_owned(),
                    entry.value().value.clone(),
                ));
            }
        }
        Ok(results)
    }

    async fn delete_prefix(&self, kind: KeyKind, prefix: &str) -> Result<u64, StateError> {
        let full_prefix = format!("{kind}:{prefix}");
        let before = self.data.len() as u64;
        self.data
            .retain(|key, entry| !(key.starts_with(&full_prefix) && !entry.is_expired()));
        Ok(before.saturating_sub(self.data.len() as u64))
    }
}
