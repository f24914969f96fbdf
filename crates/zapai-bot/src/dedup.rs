// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory deduplication.
//!
//! Two layers in front of the durable processed-event markers:
//!
//! - [`ProcessedRing`] — the most recent event ids, FIFO-evicted.  Cheap
//!   filter against the same event id arriving from several relays.
//! - [`FingerprintCache`] — `sha256(principal:plaintext)` with a TTL.
//!   Catches the same message re-signed under different event ids (client
//!   retries echoed by multiple relays).  Swept by a periodic task with a
//!   bounded step per tick; the 5-minute TTL is the contract.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use zapai_proto::Principal;

/// FIFO ring of recently seen event ids.
pub struct ProcessedRing {
    inner: Mutex<RingInner>,
    cap: usize,
}

struct RingInner {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl ProcessedRing {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner { order: VecDeque::new(), set: HashSet::new() }),
            cap: cap.max(1),
        }
    }

    /// Record `id`; returns `false` when it was already present.
    pub fn observe(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.set.insert(id.to_string()) {
            return false;
        }
        inner.order.push_back(id.to_string());
        if inner.order.len() > self.cap {
            if let Some(evicted) = inner.order.pop_front() {
                inner.set.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TTL'd content fingerprints.
pub struct FingerprintCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl FingerprintCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    fn fingerprint(principal: &Principal, text: &str) -> String {
        let digest = Sha256::digest(format!("{}:{text}", principal.to_hex()).as_bytes());
        hex::encode(digest)
    }

    /// Record the fingerprint of `(principal, text)`; returns `false` when a
    /// fresh (unexpired) duplicate already exists.
    pub fn observe(&self, principal: &Principal, text: &str) -> bool {
        let key = Self::fingerprint(principal, text);
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(seen) if now.duration_since(*seen) < self.ttl => false,
            _ => {
                entries.insert(key, now);
                true
            }
        }
    }

    /// Remove up to `max_removals` expired entries.  Returns how many were
    /// dropped.
    pub fn sweep(&self, max_removals: usize) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.ttl)
            .map(|(k, _)| k.clone())
            .take(max_removals)
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background sweeper: one bounded sweep per `interval` until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = cache.sweep(256);
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired content fingerprints");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(byte: u8) -> Principal {
        Principal::from_bytes([byte; 32])
    }

    #[test]
    fn ring_reports_duplicates() {
        let ring = ProcessedRing::new(10);
        assert!(ring.observe("a"));
        assert!(!ring.observe("a"));
        assert!(ring.observe("b"));
    }

    #[test]
    fn ring_evicts_fifo_at_capacity() {
        let ring = ProcessedRing::new(3);
        for id in ["a", "b", "c", "d"] {
            assert!(ring.observe(id));
        }
        assert_eq!(ring.len(), 3);
        // "a" was evicted, so it is fresh again; "d" is still known.
        assert!(ring.observe("a"));
        assert!(!ring.observe("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn fingerprints_expire_after_ttl() {
        let cache = FingerprintCache::new(Duration::from_secs(300));
        let p = principal(1);

        assert!(cache.observe(&p, "hello"));
        assert!(!cache.observe(&p, "hello"), "fresh duplicate must be caught");

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.observe(&p, "hello"), "expired fingerprint must be fresh again");
    }

    #[test]
    fn fingerprints_are_scoped_per_principal() {
        let cache = FingerprintCache::new(Duration::from_secs(300));
        assert!(cache.observe(&principal(1), "same text"));
        assert!(cache.observe(&principal(2), "same text"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_is_bounded_per_call() {
        let cache = FingerprintCache::new(Duration::from_secs(1));
        let p = principal(3);
        for i in 0..10 {
            cache.observe(&p, &format!("msg {i}"));
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.sweep(4), 4, "sweep must honour the step bound");
        assert_eq!(cache.len(), 6);
        assert_eq!(cache.sweep(100), 6);
        assert!(cache.is_empty());
    }
}
