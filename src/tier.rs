//! Local front tier.
//!
//! A bounded, in-process cache in front of the remote store. The eviction
//! policy decides which entry leaves when the tier is full; it has no bearing
//! on how the remote store evicts.
//!
//! Entries are ranked in one ordered index keyed by `(rank, seq)`:
//!
//! | Policy | rank | seq refreshed on |
//! |---|---|---|
//! | `Lru` | 0 | insert, hit |
//! | `Fifo` | 0 | insert |
//! | `Lfu` | hit count | insert, hit |
//!
//! The smallest key is always the next victim.

use crate::key::matches_pattern;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Victim selection for the local tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used; ties go to the least recent.
    Lfu,
    /// Oldest insertion.
    Fifo,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
        }
    }
}

type Rank = (u64, u64);

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    rank: Rank,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct TierInner {
    slots: HashMap<String, Slot>,
    order: BTreeMap<Rank, String>,
    seq: u64,
    evictions: u64,
}

impl TierInner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.rank);
        Some(slot)
    }

    fn evict_one(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.slots.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Bounded front cache keyed by physical (namespaced) key.
#[derive(Debug)]
pub struct LocalTier {
    policy: EvictionPolicy,
    capacity: usize,
    inner: Mutex<TierInner>,
}

impl LocalTier {
    /// Tier holding at most `capacity` entries (min 1).
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        LocalTier {
            policy,
            capacity: capacity.max(1),
            inner: Mutex::new(TierInner::default()),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live value for `key`; expired entries are dropped and read as misses.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.slots.get(key)?.is_expired(now) {
            inner.remove(key);
            return None;
        }
        if self.policy == EvictionPolicy::Fifo {
            return inner.slots.get(key).map(|s| s.value.clone());
        }

        let seq = inner.next_seq();
        let slot = inner.slots.get_mut(key)?;
        let old_rank = slot.rank;
        slot.rank = match self.policy {
            EvictionPolicy::Lfu => (old_rank.0 + 1, seq),
            _ => (0, seq),
        };
        let (new_rank, value) = (slot.rank, slot.value.clone());
        inner.order.remove(&old_rank);
        inner.order.insert(new_rank, key.to_string());
        Some(value)
    }

    /// Insert or replace `key`, evicting if the tier is full.
    pub fn insert(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires_at = ttl.and_then(|d| now.checked_add(d));
        let mut inner = self.inner.lock();

        let previous = inner.remove(key);
        if previous.is_none() {
            while inner.slots.len() >= self.capacity {
                match inner.evict_one() {
                    Some(victim) => debug!("Local tier evicted {} ({})", victim, self.policy),
                    None => break,
                }
            }
        }

        let seq = inner.next_seq();
        // Frequency survives overwrites under LFU.
        let hits = match (self.policy, previous) {
            (EvictionPolicy::Lfu, Some(slot)) => slot.rank.0,
            _ => 0,
        };
        let rank = (hits, seq);
        inner.order.insert(rank, key.to_string());
        inner.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at,
                rank,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every entry whose key matches the glob `pattern`.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .slots
            .keys()
            .filter(|k| matches_pattern(pattern, k))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }
}
