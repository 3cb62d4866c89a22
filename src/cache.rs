//! Bounded LRU cache of per-thread query engines.
//!
//! Resident engines live in an [`LruCache`] behind a short-lived
//! `parking_lot` lock that is never held across an `.await`. Construction
//! happens outside that lock, behind a per-key gate: the first caller for an
//! uncached key builds the engine while later callers for the same key wait
//! on the gate and then find the finished entry. Unrelated keys never wait on
//! each other.
//!
//! Entries leave the cache through capacity pressure or [`EngineCache::invalidate`]
//! when their thread is deleted or rebuilt. There is no time-based expiry.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::engine::{EngineFactory, QueryEngine};
use crate::error::{Error, Result};
use crate::thread_key::ThreadKey;

type Gate = Arc<AsyncMutex<()>>;

/// Resident engines plus the invalidation counters that decide whether a
/// finished build may still be inserted.
struct Slots {
    lru: LruCache<ThreadKey, Arc<dyn QueryEngine>>,
    generations: HashMap<ThreadKey, u64>,
    epoch: u64,
}

impl Slots {
    fn stamp(&self, key: &ThreadKey) -> (u64, u64) {
        (self.epoch, self.generations.get(key).copied().unwrap_or(0))
    }
}

pub struct EngineCache {
    entries: Mutex<Slots>,
    building: Mutex<HashMap<ThreadKey, Gate>>,
    factory: Arc<dyn EngineFactory>,
    capacity: NonZeroUsize,
    constructions: AtomicU64,
}

impl EngineCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, factory: Arc<dyn EngineFactory>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(Slots {
                lru: LruCache::new(capacity),
                generations: HashMap::new(),
                epoch: 0,
            }),
            building: Mutex::new(HashMap::new()),
            factory,
            capacity,
            constructions: AtomicU64::new(0),
        }
    }

    /// Return the engine for `key`, building it on first use.
    ///
    /// Every successful call marks `key` most recently used. When inserting a
    /// new engine overflows the capacity, the least recently used entry is
    /// dropped. A failed build leaves nothing behind.
    pub async fn get_or_create(&self, key: &ThreadKey) -> Result<Arc<dyn QueryEngine>> {
        loop {
            if let Some(engine) = self.lookup(key) {
                tracing::debug!(thread_key = %key, "engine cache hit");
                return Ok(engine);
            }

            let gate = self
                .building
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();
            let _guard = gate.lock().await;

            // The previous holder finished (or gave up) and retired this
            // gate; start over so the result is observed through the cache.
            let current = self
                .building
                .lock()
                .get(key)
                .is_some_and(|g| Arc::ptr_eq(g, &gate));
            if !current {
                continue;
            }

            if let Some(engine) = self.lookup(key) {
                self.retire_gate(key, &gate);
                return Ok(engine);
            }

            tracing::debug!(thread_key = %key, "engine cache miss, building");
            let stamp = self.entries.lock().stamp(key);
            let built = self.factory.build(key).await;
            match built {
                Ok(engine) => {
                    self.constructions.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut slots = self.entries.lock();
                        if slots.stamp(key) == stamp {
                            if let Some((evicted_key, _)) = slots.lru.push(key.clone(), engine.clone()) {
                                if &evicted_key != key {
                                    tracing::debug!(thread_key = %evicted_key, "engine evicted");
                                }
                            }
                        } else {
                            // Invalidated mid-build: serve this caller, keep it out of the cache.
                            tracing::debug!(thread_key = %key, "engine built over stale artifacts, not cached");
                        }
                    }
                    self.retire_gate(key, &gate);
                    return Ok(engine);
                }
                Err(e) => {
                    self.retire_gate(key, &gate);
                    tracing::error!(thread_key = %key, error = %e, "engine construction failed");
                    return Err(Error::Collaborator(e));
                }
            }
        }
    }

    fn lookup(&self, key: &ThreadKey) -> Option<Arc<dyn QueryEngine>> {
        self.entries.lock().lru.get(key).cloned()
    }

    fn retire_gate(&self, key: &ThreadKey, gate: &Gate) {
        let mut building = self.building.lock();
        if building.get(key).is_some_and(|g| Arc::ptr_eq(g, gate)) {
            building.remove(key);
        }
    }

    /// Drop the entry for `key`. Returns whether one was resident.
    ///
    /// A build for `key` still in flight completes for its caller but is not
    /// inserted.
    pub fn invalidate(&self, key: &ThreadKey) -> bool {
        let removed = {
            let mut slots = self.entries.lock();
            *slots.generations.entry(key.clone()).or_insert(0) += 1;
            slots.lru.pop(key).is_some()
        };
        if removed {
            tracing::debug!(thread_key = %key, "engine invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let mut slots = self.entries.lock();
        slots.lru.clear();
        slots.generations.clear();
        slots.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn contains(&self, key: &ThreadKey) -> bool {
        self.entries.lock().lru.contains(key)
    }

    /// Total successful builds since startup.
    pub fn constructions(&self) -> u64 {
        self.constructions.load(Ordering::Relaxed)
    }
}
