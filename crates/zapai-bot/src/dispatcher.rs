// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event classification and intake.
//!
//! The dispatcher is the single consumer of the supervisor's event channel.
//! Per event: drop duplicates (id ring) and self-authored events, branch
//! accounting kinds to the accounting engine, rate-limit the rest, and hand
//! them to the work queue.  Denials are user-visible on the private channel
//! only; the public channel drops silently so the bot never amplifies load.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use zapai_proto::{now_seconds, EventKind, Filter, Principal};
use zapai_relay::IncomingEvent;

use crate::accounting::Accounting;
use crate::dedup::ProcessedRing;
use crate::limiter::{RateDecision, RateLimiter};
use crate::outbox::Outbox;
use crate::queue::{QueuedTask, WorkQueue};
use crate::stats::BotCounters;

/// Recent event ids remembered by the intake filter.
const PROCESSED_RING_CAP: usize = 1000;

/// The four inbound subscriptions, each scoped to events addressed to the
/// bot and starting at "now" to skip relay history.
pub fn startup_filters(bot: Principal) -> Vec<Filter> {
    let since = now_seconds();
    [
        EventKind::PrivateMessage,
        EventKind::PublicPost,
        EventKind::Receipt,
        EventKind::BalanceQuery,
    ]
    .into_iter()
    .map(|kind| Filter::new().kind(kind).addressed_to(bot).since(since))
    .collect()
}

pub struct Dispatcher {
    bot: Principal,
    ring: ProcessedRing,
    limiter: Arc<RateLimiter>,
    queue: Arc<WorkQueue>,
    accounting: Arc<Accounting>,
    outbox: Arc<Outbox>,
    counters: Arc<BotCounters>,
}

impl Dispatcher {
    pub fn new(
        bot: Principal,
        limiter: Arc<RateLimiter>,
        queue: Arc<WorkQueue>,
        accounting: Arc<Accounting>,
        outbox: Arc<Outbox>,
        counters: Arc<BotCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot,
            ring: ProcessedRing::new(PROCESSED_RING_CAP),
            limiter,
            queue,
            accounting,
            outbox,
            counters,
        })
    }

    /// Drain the supervisor channel until it closes.
    pub fn run(self: &Arc<Self>, mut events: mpsc::Receiver<IncomingEvent>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(incoming) = events.recv().await {
                dispatcher.dispatch(incoming).await;
            }
            info!("event channel closed, dispatcher exiting");
        })
    }

    pub async fn dispatch(&self, incoming: IncomingEvent) {
        let event = incoming.event;

        if !self.ring.observe(&event.id) {
            debug!(event_id = %event.id, relay = %incoming.relay_url, "duplicate event id");
            return;
        }
        if event.pubkey == self.bot {
            return;
        }
        BotCounters::bump(&self.counters.received);

        match event.kind {
            EventKind::Receipt => self.accounting.handle_receipt(&event).await,
            EventKind::BalanceQuery => self.accounting.handle_balance_query(&event).await,
            EventKind::PrivateMessage | EventKind::PublicPost => {
                self.intake(event, incoming.relay_url).await;
            }
            _ => {
                debug!(kind = event.kind.as_u32(), "ignoring unsolicited event kind");
            }
        }
    }

    async fn intake(&self, event: zapai_proto::Event, relay_url: String) {
        if let RateDecision::Denied { retry_after_secs, global } =
            self.limiter.check(&event.pubkey, 1.0)
        {
            BotCounters::bump(&self.counters.rate_limited);
            debug!(author = %event.pubkey, retry_after_secs, global, "rate limited");
            if event.kind == EventKind::PrivateMessage {
                let text = format!(
                    "You're sending messages too quickly — try again in {retry_after_secs}s."
                );
                let _ = self
                    .outbox
                    .send_private(&event.pubkey, &text, event.session_tag())
                    .await;
            }
            return;
        }

        let author = event.pubkey;
        let session = event.session_tag().map(str::to_string);
        let is_dm = event.kind == EventKind::PrivateMessage;
        match self.queue.enqueue(QueuedTask::new(event, relay_url)) {
            Ok(()) => BotCounters::bump(&self.counters.queued),
            Err(full) => {
                BotCounters::bump(&self.counters.dropped);
                debug!(pending = full.size, "work queue full, dropping event");
                if is_dm {
                    let text = "I'm overloaded right now and had to drop your message — \
                                please try again in a little while.";
                    let _ = self.outbox.send_private(&author, text, session.as_deref()).await;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
