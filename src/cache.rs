//! A bounded, TTL-aware LRU cache mapping `(domain, qtype) -> answer`.
//!
//! Backed by an [`IndexMap`], which gives O(1) amortized remove-and-reinsert
//! while preserving insertion order — the Rust-idiomatic stand-in for the
//! "hashmap plus intrusive doubly-linked list" a language without an
//! order-preserving map would reach for.
use std::net::IpAddr;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::debug;

use crate::codec::QType;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub ip: IpAddr,
    pub ttl: u32,
    created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(ip: IpAddr, ttl: u32, now: Instant) -> Self {
        CacheEntry {
            ip,
            ttl,
            created_at: now,
            expires_at: now + Duration::from_secs(ttl as u64),
        }
    }

    /// Seconds remaining before expiry, saturating at zero.
    pub fn remaining_ttl(&self, now: Instant) -> u64 {
        self.expires_at.saturating_duration_since(now).as_secs()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type CacheKey = (String, QType);

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
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

/// The `size ≤ max_entries` and "no duplicate key" invariants hold after
/// every call returns; see the module-level tests for the LRU/TTL contract
/// this is meant to satisfy.
pub struct Cache {
    entries: IndexMap<CacheKey, CacheEntry>,
    max_entries: usize,
    stats: CacheStats,
}

impl Cache {
    pub fn new(max_entries: usize) -> Self {
        Cache {
            entries: IndexMap::with_capacity(max_entries),
            max_entries,
            stats: CacheStats::default(),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Look up `(domain, qtype)`. A hit touches the entry (moves it to the
    /// back of the LRU order); an expired entry is evicted in place and
    /// counted as both a miss and an expiry.
    pub fn get(&mut self, domain: &str, qtype: QType, now: Instant) -> Option<CacheEntry> {
        let key = (domain.to_ascii_lowercase(), qtype);

        let expired = matches!(self.entries.get(&key), Some(e) if e.is_expired(now));
        if expired {
            self.entries.shift_remove(&key);
            self.stats.expired += 1;
            self.stats.misses += 1;
            debug!("cache expired on lookup: {} {qtype}", key.0);
            return None;
        }

        match self.entries.shift_remove(&key) {
            Some(entry) => {
                self.entries.insert(key.clone(), entry.clone());
                self.stats.hits += 1;
                debug!("cache hit: {} {qtype} -> {}", key.0, entry.ip);
                Some(entry)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or refresh `(domain, qtype) -> ip`, evicting the
    /// least-recently-used entry first if the cache is full and the key is
    /// new.
    pub fn put(&mut self, domain: &str, qtype: QType, ip: IpAddr, ttl: u32, now: Instant) {
        let key = (domain.to_ascii_lowercase(), qtype);
        let entry = CacheEntry::new(ip, ttl, now);

        if self.entries.shift_remove(&key).is_some() {
            self.entries.insert(key, entry);
            return;
        }

        if self.entries.len() >= self.max_entries {
            if let Some((evicted_key, evicted_entry)) = self.entries.shift_remove_index(0) {
                self.stats.evicted += 1;
                debug!(
                    "cache evicted (LRU): {} {} -> {}",
                    evicted_key.0, evicted_key.1, evicted_entry.ip
                );
            }
        }

        debug!("cache insert: {} {qtype} -> {ip} ttl={ttl}", key.0);
        self.entries.insert(key, entry);
    }

    /// Remove every entry whose TTL has lapsed. Run on a slow periodic tick
    /// independent of lookups, so idle, never-requeried entries don't linger
    /// past their TTL.
    pub fn sweep(&mut self, now: Instant) {
        let expired_keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired_keys {
            self.entries.shift_remove(&key);
            self.stats.expired += 1;
        }
    }
}
