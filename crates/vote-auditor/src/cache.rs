// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded, TTL-limited memoization in front of the gateway.
//!
//! Entries are evicted in insertion order: when a cache is full the oldest fifth of its
//! entries is dropped before the new one goes in. Nothing here is a system of record;
//! clearing any cache at any time only costs refetches.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::{
    amount::Amount,
    gateway::{BlockHeader, ChainBlock, ChainReceipt, ChainTransaction},
};

/// Fraction of a full cache dropped by one eviction pass.
const EVICTION_FRACTION: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Header,
    Block,
    Transaction,
    Receipt,
    Balance,
    Address,
}

impl CacheKind {
    /// Order in which caches are cleared under memory pressure, largest first.
    pub const CLEARING_PRIORITY: [CacheKind; 6] = [
        CacheKind::Balance,
        CacheKind::Transaction,
        CacheKind::Receipt,
        CacheKind::Block,
        CacheKind::Header,
        CacheKind::Address,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Header => "header",
            CacheKind::Block => "block",
            CacheKind::Transaction => "transaction",
            CacheKind::Receipt => "receipt",
            CacheKind::Balance => "balance",
            CacheKind::Address => "address",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_seq: u64,
}

pub struct ResultCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: HashMap::new(), next_seq: 0 }),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // A panic while holding the lock can only leave a partially evicted map behind,
        // which is still a valid cache state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached value, treating entries older than the TTL as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let evicted = evict_oldest(&mut inner.entries, self.capacity);
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(key, Entry { value, inserted_at: Instant::now(), seq });
    }

    /// Drops every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

fn evict_oldest<K: Eq + Hash + Clone, V>(
    entries: &mut HashMap<K, Entry<V>>,
    capacity: usize,
) -> usize {
    let count = ((capacity as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
    let mut by_age: Vec<(u64, K)> = entries.iter().map(|(k, e)| (e.seq, k.clone())).collect();
    by_age.sort_unstable_by_key(|(seq, _)| *seq);
    let mut removed = 0;
    for (_, key) in by_age.into_iter().take(count) {
        entries.remove(&key);
        removed += 1;
    }
    removed
}

/// Capacity and TTL of one cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl CacheLimits {
    pub const fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self { capacity, ttl_secs }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub headers: CacheLimits,
    pub blocks: CacheLimits,
    pub transactions: CacheLimits,
    pub receipts: CacheLimits,
    pub balances: CacheLimits,
    pub addresses: CacheLimits,
    pub memory: MemoryThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            headers: CacheLimits::new(20_000, 3_600),
            blocks: CacheLimits::new(2_000, 600),
            transactions: CacheLimits::new(10_000, 600),
            receipts: CacheLimits::new(10_000, 600),
            balances: CacheLimits::new(50_000, 1_800),
            addresses: CacheLimits::new(10_000, 86_400),
            memory: MemoryThresholds::default(),
        }
    }
}

/// Which caches an eviction request targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    All,
    Kinds(Vec<CacheKind>),
}

/// One cache per entity kind, constructed once and shared by reference.
pub struct CacheSet {
    pub headers: ResultCache<u64, BlockHeader>,
    pub blocks: ResultCache<u64, ChainBlock>,
    pub transactions: ResultCache<B256, ChainTransaction>,
    pub receipts: ResultCache<B256, ChainReceipt>,
    pub balances: ResultCache<(Address, u64), Amount>,
    pub addresses: ResultCache<Address, String>,
}

impl Default for CacheSet {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl CacheSet {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            headers: ResultCache::new(config.headers.capacity, config.headers.ttl()),
            blocks: ResultCache::new(config.blocks.capacity, config.blocks.ttl()),
            transactions: ResultCache::new(
                config.transactions.capacity,
                config.transactions.ttl(),
            ),
            receipts: ResultCache::new(config.receipts.capacity, config.receipts.ttl()),
            balances: ResultCache::new(config.balances.capacity, config.balances.ttl()),
            addresses: ResultCache::new(config.addresses.capacity, config.addresses.ttl()),
        }
    }

    pub fn clear_kind(&self, kind: CacheKind) -> usize {
        match kind {
            CacheKind::Header => self.headers.clear(),
            CacheKind::Block => self.blocks.clear(),
            CacheKind::Transaction => self.transactions.clear(),
            CacheKind::Receipt => self.receipts.clear(),
            CacheKind::Balance => self.balances.clear(),
            CacheKind::Address => self.addresses.clear(),
        }
    }

    /// Clears the targeted caches in [CacheKind::CLEARING_PRIORITY] order.
    pub fn evict(&self, policy: &EvictionPolicy) -> usize {
        CacheKind::CLEARING_PRIORITY
            .iter()
            .filter(|kind| match policy {
                EvictionPolicy::All => true,
                EvictionPolicy::Kinds(kinds) => kinds.contains(kind),
            })
            .map(|kind| {
                let removed = self.clear_kind(*kind);
                tracing::debug!("Cleared {removed} entries from the {} cache", kind.as_str());
                removed
            })
            .sum()
    }

    pub fn stats(&self) -> Vec<(CacheKind, CacheStats)> {
        vec![
            (CacheKind::Header, self.headers.stats()),
            (CacheKind::Block, self.blocks.stats()),
            (CacheKind::Transaction, self.transactions.stats()),
            (CacheKind::Receipt, self.receipts.stats()),
            (CacheKind::Balance, self.balances.stats()),
            (CacheKind::Address, self.addresses.stats()),
        ]
    }
}

/// Action taken by the [MemoryGuard] for one resident-memory sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureAction {
    None,
    ReportOnly,
    SelectiveClearing,
    AggressiveClearing,
}

impl PressureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureAction::None => "none",
            PressureAction::ReportOnly => "report_only",
            PressureAction::SelectiveClearing => "selective_clearing",
            PressureAction::AggressiveClearing => "aggressive_clearing",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryThresholds {
    /// Resident size at which cache stats are reported
    pub warn_mb: u64,
    /// Resident size at which the balance cache is cleared
    pub high_mb: u64,
    /// Resident size at which every cache is cleared
    pub critical_mb: u64,
    /// Sampling interval of the background monitor
    pub interval_secs: u64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self { warn_mb: 1_024, high_mb: 2_048, critical_mb: 3_072, interval_secs: 30 }
    }
}

/// Maps resident memory samples to cache clearing actions.
pub struct MemoryGuard {
    thresholds: MemoryThresholds,
}

impl MemoryGuard {
    pub fn new(thresholds: MemoryThresholds) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, resident_bytes: u64) -> PressureAction {
        let mb = resident_bytes / (1024 * 1024);
        if mb >= self.thresholds.critical_mb {
            PressureAction::AggressiveClearing
        } else if mb >= self.thresholds.high_mb {
            PressureAction::SelectiveClearing
        } else if mb >= self.thresholds.warn_mb {
            PressureAction::ReportOnly
        } else {
            PressureAction::None
        }
    }

    /// Classifies the sample and applies the resulting action to `caches`.
    pub fn evaluate(&self, resident_bytes: u64, caches: &CacheSet) -> PressureAction {
        let action = self.classify(resident_bytes);
        let mb = resident_bytes / (1024 * 1024);
        match action {
            PressureAction::None => {}
            PressureAction::ReportOnly => {
                for (kind, stats) in caches.stats() {
                    tracing::info!(
                        "Memory at {mb} MB, {} cache: {} entries, hit rate {:.2}",
                        kind.as_str(),
                        stats.entries,
                        stats.hit_rate()
                    );
                }
            }
            PressureAction::SelectiveClearing => {
                let removed = caches.evict(&EvictionPolicy::Kinds(vec![CacheKind::Balance]));
                tracing::warn!("Memory at {mb} MB, cleared {removed} balance cache entries");
            }
            PressureAction::AggressiveClearing => {
                let removed = caches.evict(&EvictionPolicy::All);
                tracing::warn!("Memory at {mb} MB, cleared {removed} entries from every cache");
            }
        }
        tracing::debug!("Memory guard action: {}", action.as_str());
        action
    }
}

/// Resident set size of this process, where the platform exposes it.
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_and_stats() {
        let cache: ResultCache<u64, u64> = ResultCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get(&1), None);
        cache.put(1, 100);
        assert_eq!(cache.get(&1), Some(100));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_are_removed() {
        let cache: ResultCache<u64, u64> = ResultCache::new(10, Duration::ZERO);
        cache.put(1, 100);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_drops_oldest_fifth() {
        let cache: ResultCache<u64, u64> = ResultCache::new(10, Duration::from_secs(60));
        for i in 0..10 {
            cache.put(i, i);
        }
        // Reading an old entry does not protect it; eviction follows insertion order.
        assert_eq!(cache.get(&0), Some(0));
        cache.put(10, 10);

        assert_eq!(cache.len(), 9);
        assert_eq!(cache.get(&0), None);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.get(&10), Some(10));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache: ResultCache<u64, u64> = ResultCache::new(2, Duration::from_secs(60));
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(2, 20);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn memory_guard_thresholds() {
        let guard = MemoryGuard::new(MemoryThresholds {
            warn_mb: 100,
            high_mb: 200,
            critical_mb: 300,
            interval_secs: 1,
        });
        let mb = 1024 * 1024;
        let caches = CacheSet::default();
        caches.balances.put((Address::ZERO, 1), Amount::from_whole(1));
        caches.addresses.put(Address::ZERO, "native".to_string());

        assert_eq!(guard.evaluate(50 * mb, &caches), PressureAction::None);
        assert_eq!(guard.evaluate(150 * mb, &caches), PressureAction::ReportOnly);
        assert_eq!(caches.balances.len(), 1);

        assert_eq!(guard.evaluate(250 * mb, &caches), PressureAction::SelectiveClearing);
        assert!(caches.balances.is_empty());
        assert_eq!(caches.addresses.len(), 1);

        assert_eq!(guard.evaluate(400 * mb, &caches), PressureAction::AggressiveClearing);
        assert!(caches.addresses.is_empty());
    }
}
