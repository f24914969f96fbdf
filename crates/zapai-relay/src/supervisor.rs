// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-relay subscription loops, health tracking and publish fan-out.
//!
//! One long-running task per relay URL: open a connection, subscribe, pump
//! frames.  Incoming events are handed to the dispatcher channel; publish
//! requests arrive over a per-relay channel and are matched to their `OK`
//! acknowledgements by event id.  On stream error or remote close the loop
//! tears down and reconnects with exponential backoff
//! (`min(base·2ⁿ⁻¹, cap)`); after `max_reconnect_failures` consecutive
//! failures the relay is marked permanently failed and its loop exits.
//! A delivered event resets the failure counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zapai_proto::{ClientFrame, Event, Filter, RelayFrame};

use crate::client::RelayTransport;
use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub publish_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_failures: u32,
    /// Capacity of the channel feeding the dispatcher.
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(8),
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_failures: 5,
            event_buffer: 1024,
        }
    }
}

/// An event as delivered by one relay.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub event: Event,
    pub relay_url: String,
}

/// Result of publishing one event to one relay.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub url: String,
    pub success: bool,
    pub error: Option<RelayError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayHealthSnapshot {
    pub url: String,
    pub connected: bool,
    pub permanently_failed: bool,
    pub last_seen_ms: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct HealthInner {
    connected: bool,
    permanently_failed: bool,
    last_seen_ms: u64,
    messages_received: u64,
    messages_sent: u64,
    error_count: u64,
    last_error: Option<String>,
}

struct PublishRequest {
    event: Event,
    done: oneshot::Sender<Result<(), RelayError>>,
}

pub struct RelaySupervisor {
    transport: Arc<dyn RelayTransport>,
    urls: Vec<String>,
    cfg: SupervisorConfig,
    health: Mutex<HashMap<String, HealthInner>>,
    publishers: Mutex<HashMap<String, mpsc::Sender<PublishRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RelaySupervisor {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        urls: Vec<String>,
        cfg: SupervisorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let health = urls
            .iter()
            .map(|u| (u.clone(), HealthInner::default()))
            .collect();
        Arc::new(Self {
            transport,
            urls,
            cfg,
            health: Mutex::new(health),
            publishers: Mutex::new(HashMap::new()),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the subscription loop for every relay.  Returns the channel the
    /// dispatcher drains.
    pub fn start(self: &Arc<Self>, filters: Vec<Filter>) -> mpsc::Receiver<IncomingEvent> {
        let (event_tx, event_rx) = mpsc::channel(self.cfg.event_buffer);
        let mut handles = self.handles.lock().unwrap();
        for url in self.urls.clone() {
            let sup = Arc::clone(self);
            let filters = filters.clone();
            let event_tx = event_tx.clone();
            handles.push(tokio::spawn(async move {
                sup.relay_loop(url, filters, event_tx).await;
            }));
        }
        event_rx
    }

    async fn relay_loop(
        self: Arc<Self>,
        url: String,
        filters: Vec<Filter>,
        event_tx: mpsc::Sender<IncomingEvent>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempts: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let session_error = match self.transport.connect(&url).await {
                Ok(link) => {
                    self.run_session(&url, link, &filters, &event_tx, &mut shutdown_rx, &mut attempts)
                        .await
                }
                Err(e) => Some(e),
            };

            if *shutdown_rx.borrow() {
                return;
            }
            let Some(error) = session_error else {
                // Dispatcher went away; nothing left to deliver to.
                return;
            };

            self.note_error(&url, &error);
            attempts += 1;
            if attempts >= self.cfg.max_reconnect_failures {
                warn!(relay = %url, attempts, "relay permanently failed, giving up");
                self.health.lock().unwrap().entry(url.clone()).or_default().permanently_failed =
                    true;
                return;
            }

            let delay = backoff_delay(self.cfg.reconnect_base, self.cfg.reconnect_cap, attempts);
            debug!(relay = %url, attempts, delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// One connected session: subscribe and pump frames until the stream
    /// errors, the remote closes, or shutdown is signalled.
    ///
    /// Returns the error that ended the session, or `None` for a clean exit.
    async fn run_session(
        &self,
        url: &str,
        mut link: Box<dyn crate::client::RelayLink>,
        filters: &[Filter],
        event_tx: &mpsc::Sender<IncomingEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
        attempts: &mut u32,
    ) -> Option<RelayError> {
        if let Err(e) = link
            .send(ClientFrame::Subscribe { sub_id: "sub".into(), filters: filters.to_vec() })
            .await
        {
            return Some(e);
        }

        info!(relay = %url, "subscribed");
        self.set_connected(url, true);

        let (pub_tx, mut pub_rx) = mpsc::channel::<PublishRequest>(64);
        self.publishers.lock().unwrap().insert(url.to_string(), pub_tx);
        let mut pending: HashMap<String, oneshot::Sender<Result<(), RelayError>>> = HashMap::new();

        // The select arms only *pick* the next action; `link` is used again
        // afterwards, once the competing `recv` future has been dropped.
        enum Action {
            Shutdown,
            Frame(Result<RelayFrame, RelayError>),
            Publish(Option<PublishRequest>),
        }

        let session_error = loop {
            let action = tokio::select! {
                _ = shutdown_rx.changed() => Action::Shutdown,
                frame = link.recv() => Action::Frame(frame),
                req = pub_rx.recv() => Action::Publish(req),
            };

            match action {
                Action::Shutdown => {
                    let _ = link.send(ClientFrame::Close { sub_id: "sub".into() }).await;
                    break None;
                }
                Action::Frame(Ok(RelayFrame::Event { event, .. })) => {
                    *attempts = 0;
                    self.note_received(url);
                    let incoming = IncomingEvent { event, relay_url: url.to_string() };
                    if event_tx.send(incoming).await.is_err() {
                        break None;
                    }
                }
                Action::Frame(Ok(RelayFrame::EndOfStored { .. })) => {}
                Action::Frame(Ok(RelayFrame::Ok { event_id, accepted, message })) => {
                    if let Some(done) = pending.remove(&event_id) {
                        let result = if accepted {
                            Ok(())
                        } else {
                            Err(RelayError::Rejected(message))
                        };
                        let _ = done.send(result);
                    }
                }
                Action::Frame(Ok(RelayFrame::Closed { message, .. })) => {
                    break Some(RelayError::Closed(message));
                }
                Action::Frame(Ok(RelayFrame::Notice { message })) => {
                    debug!(relay = %url, %message, "relay notice");
                }
                Action::Frame(Ok(RelayFrame::Unknown)) => {}
                Action::Frame(Err(e)) => break Some(e),
                Action::Publish(Some(req)) => {
                    let event_id = req.event.id.clone();
                    match link.send(ClientFrame::Publish { event: req.event }).await {
                        Ok(()) => {
                            pending.insert(event_id, req.done);
                        }
                        Err(e) => {
                            let _ = req.done.send(Err(e.clone()));
                            break Some(e);
                        }
                    }
                }
                Action::Publish(None) => {}
            }
        };

        self.publishers.lock().unwrap().remove(url);
        for (_, done) in pending.drain() {
            let _ = done.send(Err(RelayError::Closed("connection lost".into())));
        }
        self.set_connected(url, false);
        session_error
    }

    /// Fan the event out to every live relay in parallel.
    ///
    /// Each per-relay publish has its own deadline so one slow relay cannot
    /// stall the batch.  Delivery counts as successful when at least one
    /// relay acknowledged.
    pub async fn publish(&self, event: &Event) -> Vec<PublishOutcome> {
        let targets: Vec<(String, mpsc::Sender<PublishRequest>)> = self
            .publishers
            .lock()
            .unwrap()
            .iter()
            .map(|(url, tx)| (url.clone(), tx.clone()))
            .collect();

        if targets.is_empty() {
            warn!(event_id = %event.id, "publish with no live relays");
            return Vec::new();
        }

        let timeout = self.cfg.publish_timeout;
        let publishes = targets.into_iter().map(|(url, tx)| {
            let event = event.clone();
            async move {
                let (done_tx, done_rx) = oneshot::channel();
                if tx.send(PublishRequest { event, done: done_tx }).await.is_err() {
                    return PublishOutcome {
                        url,
                        success: false,
                        error: Some(RelayError::Closed("connection lost".into())),
                    };
                }
                match tokio::time::timeout(timeout, done_rx).await {
                    Ok(Ok(Ok(()))) => PublishOutcome { url, success: true, error: None },
                    Ok(Ok(Err(e))) => PublishOutcome { url, success: false, error: Some(e) },
                    Ok(Err(_)) => PublishOutcome {
                        url,
                        success: false,
                        error: Some(RelayError::Closed("connection lost".into())),
                    },
                    Err(_) => PublishOutcome { url, success: false, error: Some(RelayError::Timeout) },
                }
            }
        });

        let outcomes: Vec<PublishOutcome> = futures::future::join_all(publishes).await;

        for outcome in &outcomes {
            match &outcome.error {
                None => self.note_sent(&outcome.url),
                Some(e) => {
                    // Policy rejections are expected noise; keep them quiet.
                    if e.is_policy_rejection() {
                        debug!(relay = %outcome.url, error = %e, "publish rejected by relay policy");
                    } else {
                        warn!(relay = %outcome.url, error = %e, "publish failed");
                    }
                    self.note_error(&outcome.url, e);
                }
            }
        }
        outcomes
    }

    /// True when at least one relay accepted the event.
    pub fn delivered(outcomes: &[PublishOutcome]) -> bool {
        outcomes.iter().any(|o| o.success)
    }

    /// One-shot query: open an ephemeral subscription on a live relay and
    /// return the first matching event, or `None` on EOSE everywhere or
    /// timeout.
    pub async fn query_once(&self, filter: Filter, timeout: Duration) -> Option<Event> {
        let urls: Vec<String> = {
            let health = self.health.lock().unwrap();
            self.urls
                .iter()
                .filter(|u| health.get(*u).map(|h| !h.permanently_failed).unwrap_or(true))
                .cloned()
                .collect()
        };

        let query = async {
            for url in urls {
                let Ok(mut link) = self.transport.connect(&url).await else { continue };
                let subscribe = ClientFrame::Subscribe {
                    sub_id: "query".into(),
                    filters: vec![filter.clone()],
                };
                if link.send(subscribe).await.is_err() {
                    continue;
                }
                loop {
                    match link.recv().await {
                        Ok(RelayFrame::Event { event, .. }) => {
                            let _ = link.send(ClientFrame::Close { sub_id: "query".into() }).await;
                            return Some(event);
                        }
                        Ok(RelayFrame::EndOfStored { .. }) => {
                            let _ = link.send(ClientFrame::Close { sub_id: "query".into() }).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
            None
        };

        tokio::time::timeout(timeout, query).await.unwrap_or(None)
    }

    /// Signal every loop to stop and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn health_snapshot(&self) -> Vec<RelayHealthSnapshot> {
        let health = self.health.lock().unwrap();
        let mut out: Vec<RelayHealthSnapshot> = health
            .iter()
            .map(|(url, h)| RelayHealthSnapshot {
                url: url.clone(),
                connected: h.connected,
                permanently_failed: h.permanently_failed,
                last_seen_ms: h.last_seen_ms,
                messages_received: h.messages_received,
                messages_sent: h.messages_sent,
                error_count: h.error_count,
                last_error: h.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        out
    }

    /// Number of relays currently connected.
    pub fn connected_count(&self) -> usize {
        self.health.lock().unwrap().values().filter(|h| h.connected).count()
    }

    fn set_connected(&self, url: &str, connected: bool) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(url.to_string()).or_default();
        entry.connected = connected;
    }

    fn note_received(&self, url: &str) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(url.to_string()).or_default();
        entry.messages_received += 1;
        entry.last_seen_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    }

    fn note_sent(&self, url: &str) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(url.to_string()).or_default();
        entry.messages_sent += 1;
    }

    fn note_error(&self, url: &str, error: &RelayError) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(url.to_string()).or_default();
        entry.error_count += 1;
        entry.last_error = Some(error.to_string());
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
