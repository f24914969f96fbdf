// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process relay network for tests.
//!
//! Behaves like a set of relays reachable by URL: accepts subscriptions,
//! acknowledges publishes, serves metadata queries from a canned profile set,
//! and lets tests inject events, rejections, connect failures and
//! disconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use zapai_proto::{ClientFrame, Event, EventKind, Filter, Principal, RelayFrame};

use crate::client::{RelayLink, RelayTransport};
use crate::error::RelayError;

#[derive(Default)]
struct RelayState {
    frames_tx: Option<mpsc::UnboundedSender<RelayFrame>>,
    published: Vec<Event>,
    reject_message: Option<String>,
    /// When set, publishes are recorded but never acknowledged.
    swallow_publishes: bool,
    fail_next_connects: u32,
    connects: u32,
}

#[derive(Default)]
struct NetworkState {
    relays: HashMap<String, RelayState>,
    profiles: HashMap<Principal, Event>,
}

/// Shared fake network; clone handles freely.
#[derive(Clone, Default)]
pub struct MockRelayNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockRelayNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the current subscriber of `url`.
    pub fn deliver(&self, url: &str, event: Event) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.relays.get(url).and_then(|r| r.frames_tx.as_ref()) {
            let _ = tx.send(RelayFrame::Event { sub_id: "sub".into(), event });
        }
    }

    /// Deliver an event on every connected relay.
    pub fn deliver_all(&self, event: Event) {
        let urls: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.relays.keys().cloned().collect()
        };
        for url in urls {
            self.deliver(&url, event.clone());
        }
    }

    /// Simulate a remote close on `url`; the subscriber will reconnect.
    pub fn disconnect(&self, url: &str) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.relays.get(url).and_then(|r| r.frames_tx.as_ref()) {
            let _ = tx.send(RelayFrame::Closed { sub_id: "sub".into(), message: "bye".into() });
        }
    }

    /// Make the next `n` connection attempts to `url` fail.
    pub fn fail_next_connects(&self, url: &str, n: u32) {
        self.state.lock().unwrap().relays.entry(url.into()).or_default().fail_next_connects = n;
    }

    /// Reject all publishes on `url` with `message` (an `OK false` ack).
    pub fn reject_publishes(&self, url: &str, message: &str) {
        self.state.lock().unwrap().relays.entry(url.into()).or_default().reject_message =
            Some(message.to_string());
    }

    /// Record publishes on `url` but never acknowledge them, so the
    /// publisher's per-relay deadline fires.
    pub fn swallow_publishes(&self, url: &str) {
        self.state.lock().unwrap().relays.entry(url.into()).or_default().swallow_publishes = true;
    }

    /// Serve `event` for metadata queries about its author.
    pub fn set_profile(&self, event: Event) {
        self.state.lock().unwrap().profiles.insert(event.pubkey, event);
    }

    pub fn published(&self, url: &str) -> Vec<Event> {
        self.state
            .lock()
            .unwrap()
            .relays
            .get(url)
            .map(|r| r.published.clone())
            .unwrap_or_default()
    }

    /// Every event published anywhere, deduplicated by event id.
    pub fn all_published(&self) -> Vec<Event> {
        let state = self.state.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for relay in state.relays.values() {
            for ev in &relay.published {
                if seen.insert(ev.id.clone()) {
                    out.push(ev.clone());
                }
            }
        }
        out
    }

    pub fn connect_count(&self, url: &str) -> u32 {
        self.state.lock().unwrap().relays.get(url).map(|r| r.connects).unwrap_or(0)
    }

    fn answer_metadata_query(
        &self,
        sub_id: &str,
        filters: &[Filter],
        tx: &mpsc::UnboundedSender<RelayFrame>,
    ) {
        let state = self.state.lock().unwrap();
        for filter in filters {
            if !filter.kinds.contains(&EventKind::Metadata) {
                continue;
            }
            for author in &filter.authors {
                if let Some(profile) = state.profiles.get(author) {
                    let _ = tx.send(RelayFrame::Event {
                        sub_id: sub_id.to_string(),
                        event: profile.clone(),
                    });
                }
            }
        }
        let _ = tx.send(RelayFrame::EndOfStored { sub_id: sub_id.to_string() });
    }
}

#[async_trait]
impl RelayTransport for MockRelayNetwork {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayLink>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            let relay = state.relays.entry(url.to_string()).or_default();
            if relay.fail_next_connects > 0 {
                relay.fail_next_connects -= 1;
                return Err(RelayError::Connect("mock connect refused".into()));
            }
            relay.connects += 1;
            // The subscriber slot is claimed on Subscribe, not here —
            // ephemeral query connections must not displace the long-lived
            // subscription.
        }
        Ok(Box::new(MockLink { url: url.to_string(), net: self.clone(), tx, rx }))
    }
}

struct MockLink {
    url: String,
    net: MockRelayNetwork,
    tx: mpsc::UnboundedSender<RelayFrame>,
    rx: mpsc::UnboundedReceiver<RelayFrame>,
}

#[async_trait]
impl RelayLink for MockLink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), RelayError> {
        match frame {
            ClientFrame::Subscribe { sub_id, filters } => {
                let is_metadata_query =
                    filters.iter().any(|f| f.kinds.contains(&EventKind::Metadata));
                if is_metadata_query {
                    self.net.answer_metadata_query(&sub_id, &filters, &self.tx);
                } else {
                    // This connection is the relay's live subscriber.
                    let mut state = self.net.state.lock().unwrap();
                    state.relays.entry(self.url.clone()).or_default().frames_tx =
                        Some(self.tx.clone());
                }
                Ok(())
            }
            ClientFrame::Publish { event } => {
                let ack = {
                    let mut state = self.net.state.lock().unwrap();
                    let relay = state.relays.entry(self.url.clone()).or_default();
                    match &relay.reject_message {
                        Some(msg) => Some(RelayFrame::Ok {
                            event_id: event.id.clone(),
                            accepted: false,
                            message: msg.clone(),
                        }),
                        None => {
                            relay.published.push(event.clone());
                            if relay.swallow_publishes {
                                None
                            } else {
                                Some(RelayFrame::Ok {
                                    event_id: event.id.clone(),
                                    accepted: true,
                                    message: String::new(),
                                })
                            }
                        }
                    }
                };
                if let Some(ack) = ack {
                    let _ = self.tx.send(ack);
                }
                Ok(())
            }
            ClientFrame::Close { .. } => Ok(()),
        }
    }

    async fn recv(&mut self) -> Result<RelayFrame, RelayError> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(RelayError::Closed("mock connection dropped".into())),
        }
    }
}
