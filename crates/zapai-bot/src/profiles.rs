// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! User profile cache.
//!
//! Profiles are nice-to-have context for the AI primer, so the lookup is
//! budgeted, not guaranteed: a TTL'd cache in front of a relay-side metadata
//! query.  The caller waits at most `fast_timeout` (default 300 ms); if the
//! fetch is slower it keeps running in the background and warms the cache
//! for the next message.  Concurrent lookups for the same principal share
//! one fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use zapai_proto::{EventKind, Filter, Principal, UserProfile};
use zapai_relay::RelaySupervisor;

#[derive(Debug, Clone)]
pub struct ProfileCacheConfig {
    pub ttl: Duration,
    pub fast_timeout: Duration,
    /// Budget for the relay-side query itself (background).
    pub query_timeout: Duration,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(21_600_000),
            fast_timeout: Duration::from_millis(300),
            query_timeout: Duration::from_secs(3),
        }
    }
}

struct Entry {
    profile: Option<UserProfile>,
    fetched_at: Instant,
}

pub struct ProfileCache {
    relays: Arc<RelaySupervisor>,
    cfg: ProfileCacheConfig,
    entries: Mutex<HashMap<Principal, Entry>>,
    inflight: Mutex<HashMap<Principal, watch::Receiver<bool>>>,
}

impl ProfileCache {
    pub fn new(relays: Arc<RelaySupervisor>, cfg: ProfileCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            relays,
            cfg,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Fast-path lookup: cached profile, or whatever a fetch produces within
    /// `fast_timeout`, or `None` (with the fetch warming the cache behind
    /// the caller's back).
    pub async fn get(self: &Arc<Self>, principal: &Principal) -> Option<UserProfile> {
        if let Some(cached) = self.cached(principal) {
            return cached;
        }

        let mut done_rx = self.start_or_join_fetch(principal);
        let _ = tokio::time::timeout(self.cfg.fast_timeout, done_rx.changed()).await;

        self.cached(principal).flatten()
    }

    /// Fresh cache entry, if any.  `Some(None)` means "fetched, user has no
    /// profile" — negative results are cached too.
    fn cached(&self, principal: &Principal) -> Option<Option<UserProfile>> {
        let entries = self.entries.lock().unwrap();
        entries.get(principal).and_then(|e| {
            if e.fetched_at.elapsed() < self.cfg.ttl {
                Some(e.profile.clone())
            } else {
                None
            }
        })
    }

    fn start_or_join_fetch(self: &Arc<Self>, principal: &Principal) -> watch::Receiver<bool> {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(rx) = inflight.get(principal) {
            return rx.clone();
        }

        let (done_tx, done_rx) = watch::channel(false);
        inflight.insert(*principal, done_rx.clone());

        let cache = Arc::clone(self);
        let principal = *principal;
        tokio::spawn(async move {
            let filter = Filter::new()
                .kind(EventKind::Metadata)
                .author(principal)
                .limit(1);
            let event = cache.relays.query_once(filter, cache.cfg.query_timeout).await;
            let profile = event.as_ref().and_then(UserProfile::from_event);

            debug!(%principal, found = profile.is_some(), "profile fetch finished");
            cache
                .entries
                .lock()
                .unwrap()
                .insert(principal, Entry { profile, fetched_at: Instant::now() });
            cache.inflight.lock().unwrap().remove(&principal);
            let _ = done_tx.send(true);
        });

        done_rx
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use zapai_relay::{MockRelayNetwork, SupervisorConfig};
    use zapai_proto::Event;

    fn profile_event(author: Principal, name: &str) -> Event {
        Event {
            id: format!("meta-{name}"),
            pubkey: author,
            created_at: 1700000000,
            kind: EventKind::Metadata,
            tags: vec![],
            content: format!(r#"{{"name":"{name}"}}"#),
            sig: String::new(),
        }
    }

    async fn connected_cache(net: &MockRelayNetwork) -> (Arc<ProfileCache>, Arc<RelaySupervisor>) {
        let sup = RelaySupervisor::new(
            Arc::new(net.clone()),
            vec!["wss://a".into()],
            SupervisorConfig::default(),
        );
        let _rx = sup.start(vec![Filter::new().kind(EventKind::PublicPost)]);
        for _ in 0..100 {
            if sup.connected_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let cache = ProfileCache::new(sup.clone(), ProfileCacheConfig::default());
        (cache, sup)
    }

    #[tokio::test]
    async fn fetches_and_caches_profile() {
        let net = MockRelayNetwork::new();
        let alice = Principal::from_bytes([1; 32]);
        net.set_profile(profile_event(alice, "alice"));
        let (cache, sup) = connected_cache(&net).await;

        let profile = cache.get(&alice).await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(cache.len(), 1);

        // Second hit must come from cache even with the relay gone.
        sup.shutdown().await;
        let profile = cache.get(&alice).await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn missing_profile_is_cached_as_negative() {
        let net = MockRelayNetwork::new();
        let nobody = Principal::from_bytes([2; 32]);
        let (cache, sup) = connected_cache(&net).await;

        assert!(cache.get(&nobody).await.is_none());
        // Give the background fetch a moment to record the negative entry.
        for _ in 0..100 {
            if !cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.len(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let net = MockRelayNetwork::new();
        let alice = Principal::from_bytes([3; 32]);
        net.set_profile(profile_event(alice, "alice"));
        let (cache, sup) = connected_cache(&net).await;

        let (a, b, c) = tokio::join!(cache.get(&alice), cache.get(&alice), cache.get(&alice));
        assert!(a.is_some() && b.is_some() && c.is_some());
        // One connection for the subscription, at most one extra per fetch;
        // shared fetching keeps it to exactly two.
        assert_eq!(net.connect_count("wss://a"), 2);
        sup.shutdown().await;
    }
}
