// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded work queue with capped concurrency.
//!
//! Draining is edge-triggered: a `Notify` wakes the drain loop whenever a
//! task is enqueued or completes, and the loop starts tasks until the queue
//! is empty or concurrency is saturated.  There is no polling.
//!
//! Failed attempts re-enter at the FRONT of the queue (priority retry) after
//! a linear `retry_delay × attempts` backoff; failures with a terminal
//! [`FailKind`](crate::error::FailKind) are not retried.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use zapai_proto::Event;

use crate::error::ProcessError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_concurrent: usize,
    pub task_timeout: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_concurrent: 10,
            task_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

/// One unit of work: an inbound event bound to its source relay.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub event: Event,
    pub relay_url: String,
    /// Completed attempts so far.
    pub attempts: u32,
}

impl QueuedTask {
    pub fn new(event: Event, relay_url: impl Into<String>) -> Self {
        Self { event, relay_url: relay_url.into(), attempts: 0 }
    }

    /// True on the attempt after which no retry will happen.
    pub fn is_last_attempt(&self, cfg_max: u32) -> bool {
        self.attempts + 1 >= cfg_max
    }
}

#[derive(Debug, Error)]
#[error("work queue is full ({size} pending)")]
pub struct QueueFull {
    pub size: usize,
}

pub type TaskHandler =
    Arc<dyn Fn(QueuedTask) -> BoxFuture<'static, Result<(), ProcessError>> + Send + Sync>;

struct QueueState {
    pending: VecDeque<QueuedTask>,
    in_flight: usize,
    accepting: bool,
}

#[derive(Default)]
struct QueueStatsInner {
    processed: u64,
    failed: u64,
    retried: u64,
    dropped: u64,
    avg_process_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub avg_process_ms: f64,
}

pub struct WorkQueue {
    cfg: QueueConfig,
    state: Mutex<QueueState>,
    stats: Mutex<QueueStatsInner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(cfg: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
                accepting: true,
            }),
            stats: Mutex::new(QueueStatsInner::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue at the back.  Rejected when the queue is full or shutting
    /// down; the rejection is counted as a drop.
    pub fn enqueue(&self, task: QueuedTask) -> Result<(), QueueFull> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.accepting || state.pending.len() >= self.cfg.max_queue_size {
                let size = state.pending.len();
                drop(state);
                self.stats.lock().unwrap().dropped += 1;
                return Err(QueueFull { size });
            }
            state.pending.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn push_front(&self, task: QueuedTask) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.accepting {
                self.stats.lock().unwrap().dropped += 1;
                return;
            }
            state.pending.push_front(task);
        }
        self.notify.notify_one();
    }

    /// Run the drain loop until shutdown completes.
    pub fn run(self: &Arc<Self>, handler: TaskHandler) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Start tasks until saturated or empty.
                loop {
                    let task = {
                        let mut state = queue.state.lock().unwrap();
                        if state.in_flight >= queue.cfg.max_concurrent {
                            None
                        } else if let Some(task) = state.pending.pop_front() {
                            state.in_flight += 1;
                            Some(task)
                        } else {
                            None
                        }
                    };
                    match task {
                        Some(task) => queue.spawn_task(task, handler.clone()),
                        None => break,
                    }
                }

                {
                    let state = queue.state.lock().unwrap();
                    if !state.accepting && state.pending.is_empty() && state.in_flight == 0 {
                        return;
                    }
                }
                queue.notify.notified().await;
            }
        })
    }

    fn spawn_task(self: &Arc<Self>, task: QueuedTask, handler: TaskHandler) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let attempt = task.attempts + 1;
            let result = match tokio::time::timeout(queue.cfg.task_timeout, handler(task.clone())).await
            {
                Ok(result) => result,
                Err(_) => Err(ProcessError::transient(format!(
                    "task timed out after {:?}",
                    queue.cfg.task_timeout
                ))),
            };

            match result {
                Ok(()) => {
                    let mut stats = queue.stats.lock().unwrap();
                    stats.processed += 1;
                    // Exponential moving average, light smoothing.
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    stats.avg_process_ms = if stats.processed == 1 {
                        elapsed_ms
                    } else {
                        stats.avg_process_ms * 0.9 + elapsed_ms * 0.1
                    };
                }
                Err(error) => {
                    let retry = error.is_retryable() && attempt < queue.cfg.max_attempts;
                    if retry {
                        queue.stats.lock().unwrap().retried += 1;
                        debug!(event_id = %task.event.id, attempt, error = %error, "task failed, scheduling retry");
                        let mut retry_task = task;
                        retry_task.attempts = attempt;
                        let delay = queue.cfg.retry_delay * attempt;
                        let queue_for_retry = Arc::clone(&queue);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            queue_for_retry.push_front(retry_task);
                        });
                    } else {
                        queue.stats.lock().unwrap().failed += 1;
                        warn!(event_id = %task.event.id, attempt, error = %error, "task failed permanently");
                    }
                }
            }

            queue.state.lock().unwrap().in_flight -= 1;
            // Wake both the drain loop and any shutdown waiter; the stored
            // permit covers the case where neither is parked yet.
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        });
    }

    /// Stop accepting and wait until nothing is pending or in flight.
    pub async fn shutdown(&self) {
        self.state.lock().unwrap().accepting = false;
        self.notify.notify_one();
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.pending.is_empty() && state.in_flight == 0 {
                    return;
                }
            }
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if state.pending.is_empty() && state.in_flight == 0 {
                    return;
                }
            }
            notified.await;
            // Wake the drain loop too; it shares the same Notify.
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        let inner = self.stats.lock().unwrap();
        QueueStats {
            queue_size: state.pending.len(),
            in_flight: state.in_flight,
            processed: inner.processed,
            failed: inner.failed,
            retried: inner.retried,
            dropped: inner.dropped,
            avg_process_ms: inner.avg_process_ms,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
