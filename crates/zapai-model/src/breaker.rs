// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Three-state circuit breaker for the AI backend.
//!
//! ```text
//! CLOSED ──(failure_threshold consecutive failures)──▶ OPEN
//! OPEN ──(reset_timeout elapsed, one probe call)──▶ HALF_OPEN
//! HALF_OPEN ──(success_threshold successes)──▶ CLOSED
//! HALF_OPEN ──(any failure)──▶ OPEN (timer restarts)
//! ```
//!
//! While OPEN, calls are rejected without touching the backend.  Every call
//! through the breaker carries the per-call deadline; a timeout counts as a
//! failure like any other.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use crate::error::AiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    next_attempt: Option<Instant>,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    rejections: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                next_attempt: None,
            }),
            rejections: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Run `fut` under the breaker and the per-call deadline.
    ///
    /// Returns [`AiError::BreakerOpen`] without polling `fut` when the
    /// breaker is open and the reset window has not elapsed.
    pub async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, AiError>>,
    ) -> Result<T, AiError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == BreakerState::Open {
                let reset_due = inner.next_attempt.is_some_and(|at| Instant::now() >= at);
                if reset_due {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                } else {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(AiError::BreakerOpen);
                }
            }
        }

        let result = match tokio::time::timeout(self.cfg.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(AiError::Timeout),
        };

        match &result {
            Ok(_) => self.on_success(),
            Err(e) => {
                // BreakerOpen can only come from a nested breaker; treat
                // anything else as a downstream failure.
                if !matches!(e, AiError::BreakerOpen) {
                    self.on_failure();
                }
            }
        }
        result
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.cfg.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.next_attempt = None;
                }
            }
            _ => inner.failures = 0,
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.cfg.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.next_attempt = Some(Instant::now() + self.cfg.reset_timeout);
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        warn!(
            reset_in_secs = self.cfg.reset_timeout.as_secs(),
            "circuit breaker opened"
        );
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened.load(Ordering::Relaxed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
