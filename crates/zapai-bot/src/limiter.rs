// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Two-tier token-bucket rate limiter.
//!
//! A global bucket protects the process, per-principal buckets protect
//! fairness.  Refill is lazy — tokens are computed from elapsed wall-clock at
//! check time, so idle buckets cost nothing.  Buckets idle for an hour are
//! swept once a minute by a background task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use zapai_proto::Principal;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50.0,
            refill_rate: 5.0,
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    Denied {
        retry_after_secs: u64,
        /// True when the global bucket denied (reported before per-user).
        global: bool,
    },
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(max_tokens: f64) -> Self {
        Self { tokens: max_tokens, last_refill: Instant::now() }
    }

    fn refill(&mut self, max_tokens: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(max_tokens);
        self.last_refill = now;
    }

    fn retry_after(&self, cost: f64, refill_rate: f64) -> u64 {
        let deficit = (cost - self.tokens).max(0.0);
        (deficit / refill_rate).ceil().max(1.0) as u64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub active_buckets: usize,
    pub denials: u64,
}

pub struct RateLimiter {
    cfg: RateLimiterConfig,
    global: Mutex<Bucket>,
    users: Mutex<HashMap<Principal, Bucket>>,
    denials: AtomicU64,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let global = Bucket::full(cfg.max_tokens);
        Self { cfg, global: Mutex::new(global), users: Mutex::new(HashMap::new()), denials: AtomicU64::new(0) }
    }

    /// Check and consume `cost` tokens for `principal`.
    ///
    /// Tokens are only consumed when both tiers allow; a global denial is
    /// reported before a per-user denial.
    pub fn check(&self, principal: &Principal, cost: f64) -> RateDecision {
        let mut global = self.global.lock().unwrap();
        global.refill(self.cfg.max_tokens, self.cfg.refill_rate);
        if global.tokens < cost {
            self.denials.fetch_add(1, Ordering::Relaxed);
            return RateDecision::Denied {
                retry_after_secs: global.retry_after(cost, self.cfg.refill_rate),
                global: true,
            };
        }

        let mut users = self.users.lock().unwrap();
        let bucket = users
            .entry(*principal)
            .or_insert_with(|| Bucket::full(self.cfg.max_tokens));
        bucket.refill(self.cfg.max_tokens, self.cfg.refill_rate);
        if bucket.tokens < cost {
            self.denials.fetch_add(1, Ordering::Relaxed);
            return RateDecision::Denied {
                retry_after_secs: bucket.retry_after(cost, self.cfg.refill_rate),
                global: false,
            };
        }

        global.tokens -= cost;
        bucket.tokens -= cost;
        RateDecision::Allowed
    }

    /// Drop per-user buckets with no activity inside the idle window.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut users = self.users.lock().unwrap();
        let before = users.len();
        users.retain(|_, b| now.duration_since(b.last_refill) < self.cfg.idle_timeout);
        before - users.len()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            active_buckets: self.users.lock().unwrap().len(),
            denials: self.denials.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.cfg.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = limiter.sweep_idle();
                        if removed > 0 {
                            tracing::debug!(removed, "swept idle rate-limit buckets");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
