// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Outbound event construction.
//!
//! Every reply the bot makes goes through here: build the draft, sign it,
//! fan it out via the relay supervisor.  A publish counts as delivered when
//! at least one relay accepted it.

use std::sync::Arc;

use tracing::debug;

use zapai_crypto::Signer;
use zapai_proto::{Event, EventDraft, EventKind, Principal};
use zapai_relay::RelaySupervisor;
use zapai_store::now_millis;

use crate::error::{FailKind, ProcessError};
use crate::stats::BotCounters;

pub struct Outbox {
    signer: Arc<dyn Signer>,
    relays: Arc<RelaySupervisor>,
    counters: Arc<BotCounters>,
}

impl Outbox {
    pub fn new(
        signer: Arc<dyn Signer>,
        relays: Arc<RelaySupervisor>,
        counters: Arc<BotCounters>,
    ) -> Self {
        Self { signer, relays, counters }
    }

    /// Encrypted direct message to `to`, carrying the client's session tag
    /// when one was supplied.
    pub async fn send_private(
        &self,
        to: &Principal,
        text: &str,
        session: Option<&str>,
    ) -> Result<Event, ProcessError> {
        let sealed = self.signer.encrypt_to(to, text)?;
        let mut draft = EventDraft::new(EventKind::PrivateMessage, sealed).to_principal(to);
        if let Some(session) = session {
            draft = draft.tag(&["session", session]);
        }
        self.sign_and_publish(draft).await
    }

    /// Public reply to a post: `e` tag to the source event, `p` tag to its
    /// author.
    pub async fn send_public_reply(
        &self,
        source: &Event,
        text: &str,
    ) -> Result<Event, ProcessError> {
        let draft = EventDraft::new(EventKind::PublicPost, text)
            .reply_to(&source.id)
            .to_principal(&source.pubkey);
        self.sign_and_publish(draft).await
    }

    /// Public post mentioning `mention` (used for payment thank-yous).
    pub async fn send_public_mention(
        &self,
        mention: &Principal,
        text: &str,
    ) -> Result<Event, ProcessError> {
        let draft = EventDraft::new(EventKind::PublicPost, text).to_principal(mention);
        self.sign_and_publish(draft).await
    }

    /// Machine-readable balance announcement for `owner`.
    pub async fn announce_balance(
        &self,
        owner: &Principal,
        balance: u64,
    ) -> Result<Event, ProcessError> {
        let content = serde_json::json!({
            "balance": balance,
            "currency": "sats",
            "timestamp": now_millis(),
        })
        .to_string();
        let draft = EventDraft::new(EventKind::BalanceAnnouncement, content)
            .to_principal(owner)
            .tag(&["balance", &balance.to_string()]);
        self.sign_and_publish(draft).await
    }

    async fn sign_and_publish(&self, draft: EventDraft) -> Result<Event, ProcessError> {
        let event = self.signer.sign(draft).map_err(|e| ProcessError::internal(e.to_string()))?;
        let outcomes = self.relays.publish(&event).await;
        if !RelaySupervisor::delivered(&outcomes) {
            return Err(ProcessError::new(
                FailKind::TransientNetwork,
                format!("no relay accepted event {}", event.id),
            ));
        }
        debug!(event_id = %event.id, kind = event.kind.as_u32(), "published");
        BotCounters::bump(&self.counters.sent);
        Ok(event)
    }
}
