//! Shared store backing the slot pool.
//!
//! Mutation discipline is optimistic: callers take a watch token, re-verify,
//! then commit a multi-op transaction that aborts if anything mutated since
//! the watch. No lock is held across a suspension point.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::RESERVATION_PREFIX;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One operation inside a conditional transaction.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Add a member to the slot set.
    SlotAdd(String),
    /// Remove a member from the slot set.
    SlotRemove(String),
    /// Write a keyed entry with a TTL.
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Delete a keyed entry.
    Delete(String),
}

/// Store contract for the slot pool.
///
/// Maps onto a store with atomic conditional writes (watch / multi / exec),
/// or the in-process [`MemoryStore`] below. Every operation is a suspension
/// point; implementations reconnect lazily and surface failures as
/// [`StoreError`], which callers treat as "no capacity".
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Take a watch token. A later [`txn`](SlotStore::txn) with this token
    /// commits only if no mutation happened in between.
    async fn watch(&self) -> Result<u64, StoreError>;

    /// Members of the slot set.
    async fn slot_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Read a keyed entry; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a keyed entry with a TTL, unconditionally.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Number of unexpired reservation entries.
    async fn reservation_count(&self) -> Result<usize, StoreError>;

    /// Apply `ops` atomically iff nothing mutated since `watched`.
    /// Returns false on conflict.
    async fn txn(&self, watched: u64, ops: Vec<StoreOp>) -> Result<bool, StoreError>;

    /// Apply `ops` atomically, unconditionally (release paths).
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    slots: BTreeSet<String>,
    entries: HashMap<String, Entry>,
    version: u64,
}

impl Inner {
    fn live_entry(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        if let Some(entry) = self.entries.get(key)
            && entry.expires_at <= now
        {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key)
    }

    fn apply_ops(&mut self, ops: Vec<StoreOp>, now: Instant) {
        for op in ops {
            match op {
                StoreOp::SlotAdd(id) => {
                    self.slots.insert(id);
                }
                StoreOp::SlotRemove(id) => {
                    self.slots.remove(&id);
                }
                StoreOp::SetEx { key, value, ttl } => {
                    self.entries.insert(
                        key,
                        Entry {
                            value,
                            expires_at: now + ttl,
                        },
                    );
                }
                StoreOp::Delete(key) => {
                    self.entries.remove(&key);
                }
            }
        }
        self.version += 1;
    }
}

/// In-process store: a mutex plus version counter.
///
/// Linearizable by construction - the mutex serializes every operation, and
/// the version counter detects interleaved mutation between watch and commit.
#[derive(Default)]
pub struct MemoryStore {
    inner: StdMutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn watch(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.version)
    }

    async fn slot_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.slots.iter().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        Ok(inner.live_entry(key, now).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.apply_ops(
            vec![StoreOp::SetEx {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            }],
            now,
        );
        Ok(())
    }

    async fn reservation_count(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(RESERVATION_PREFIX) && entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
        }
        Ok(inner
            .entries
            .keys()
            .filter(|key| key.starts_with(RESERVATION_PREFIX))
            .count())
    }

    async fn txn(&self, watched: u64, ops: Vec<StoreOp>) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if inner.version != watched {
            return Ok(false);
        }
        inner.apply_ops(ops, now);
        Ok(true)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.apply_ops(ops, now);
        Ok(())
    }
}
