// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The per-task processor — the body of every dequeued job.
//!
//! For one inbound event: decrypt, bind to a session, claim the
//! processed-event marker, answer balance questions locally, debit, gather
//! history, ask the AI, publish the signed reply, log both sides, announce
//! the new balance.  Everything before the debit is free; everything after
//! it is paid for, and deliberately not refunded on failure.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use zapai_crypto::Signer;
use zapai_model::{AiClient, AiRequest, ChatRole, ChatTurn, UserContext};
use zapai_proto::{Event, EventKind, Principal, UserProfile};
use zapai_store::{
    Classification, Direction, MessageRecord, SessionOrigin, SessionStore, StoreError,
};

use crate::accounting::price_for;
use crate::dedup::FingerprintCache;
use crate::error::ProcessError;
use crate::intent::is_balance_intent;
use crate::outbox::Outbox;
use crate::profiles::ProfileCache;
use crate::queue::QueuedTask;
use crate::stats::BotCounters;

/// Messages fetched as AI context.
const HISTORY_LIMIT: usize = 100;

/// Synthesized session ids for clients that don't nominate one.  Stable per
/// channel so follow-up messages land in the same thread.
const DEFAULT_DM_SESSION: &str = "dm";
const DEFAULT_PUBLIC_SESSION: &str = "public";

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Artificial delay before publishing a reply (humanizing knob).
    pub response_delay: Duration,
    /// Mirrors the queue's attempt cap; the error-notice DM goes out only
    /// when no further retry will happen.
    pub max_attempts: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { response_delay: Duration::ZERO, max_attempts: 3 }
    }
}

pub struct Processor {
    signer: Arc<dyn Signer>,
    store: Arc<SessionStore>,
    ai: Arc<AiClient>,
    profiles: Arc<ProfileCache>,
    fingerprints: Arc<FingerprintCache>,
    outbox: Arc<Outbox>,
    counters: Arc<BotCounters>,
    cfg: ProcessorConfig,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<dyn Signer>,
        store: Arc<SessionStore>,
        ai: Arc<AiClient>,
        profiles: Arc<ProfileCache>,
        fingerprints: Arc<FingerprintCache>,
        outbox: Arc<Outbox>,
        counters: Arc<BotCounters>,
        cfg: ProcessorConfig,
    ) -> Self {
        Self { signer, store, ai, profiles, fingerprints, outbox, counters, cfg }
    }

    /// Queue handler entry point.
    pub async fn process(&self, task: QueuedTask) -> Result<(), ProcessError> {
        match self.process_inner(&task).await {
            Ok(()) => Ok(()),
            Err(error) => {
                BotCounters::bump(&self.counters.errors);
                warn!(event_id = %task.event.id, error = %error, "processing failed");
                // Best-effort apology, but only once per event: when the
                // queue will not retry again.
                if !error.is_retryable() || task.is_last_attempt(self.cfg.max_attempts) {
                    self.notify_failure(&task.event).await;
                }
                Err(error)
            }
        }
    }

    async fn process_inner(&self, task: &QueuedTask) -> Result<(), ProcessError> {
        let event = &task.event;
        let author = event.pubkey;

        // 1. Content: decrypt DMs, take public posts as-is.
        let text = match event.kind {
            EventKind::PrivateMessage => self.signer.decrypt_from(&author, &event.content)?,
            _ => event.content.clone(),
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            debug!(event_id = %event.id, "dropping empty message");
            return Ok(());
        }

        // 2. Session binding: client-nominated tag, or a stable synthesized
        //    id per channel.
        let client_session = event.session_tag().map(str::to_string);
        let (session_id, origin) = match event.kind {
            EventKind::PrivateMessage => (
                client_session.clone().unwrap_or_else(|| DEFAULT_DM_SESSION.into()),
                SessionOrigin::Dm,
            ),
            _ => (
                client_session.clone().unwrap_or_else(|| DEFAULT_PUBLIC_SESSION.into()),
                SessionOrigin::Public,
            ),
        };

        // 3. Profile, fast path only.
        let profile = self.profiles.get(&author).await;

        // 4. Content fingerprint: the same text relayed under a different
        //    event id within the TTL is a duplicate.
        if !self.fingerprints.observe(&author, &text) {
            debug!(event_id = %event.id, "duplicate content fingerprint, skipping");
            return Ok(());
        }

        // 5. Append the user message; the processed-event marker claim makes
        //    this the exactly-once gate.
        let record = MessageRecord::user(&text, &event.id, event.kind.as_u32())
            .with_profile_name(profile.as_ref().and_then(|p| p.label()).map(str::to_string));
        let user_msg_id =
            match self.store.append_user_message(&author, &session_id, record, origin.clone()) {
                Ok(id) => id,
                Err(StoreError::DuplicateEvent(_)) => {
                    debug!(event_id = %event.id, "another worker already claimed this event");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

        // 6. Balance questions are answered locally, free of charge.
        if is_balance_intent(&text) {
            return self.answer_balance(event, &author, &session_id, &user_msg_id, origin).await;
        }

        // 7. Debit before the AI call.  Not refunded on later failure.
        let cost = price_for(event.kind);
        match self.store.debit(&author, cost) {
            Ok(_) => {}
            Err(StoreError::InsufficientFunds { balance, required }) => {
                return self
                    .refuse_unfunded(event, &author, &session_id, origin, balance, required)
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        // 8. History: session-scoped when the client nominated a session,
        //    otherwise everything we know about this principal.
        let records = if client_session.is_some() {
            self.store.messages(&author, &session_id, HISTORY_LIMIT)?
        } else {
            self.store.all_messages(&author, HISTORY_LIMIT)?
        };
        let history = chat_history(&records, &user_msg_id);

        // 9. The AI call.  Degrades to an apology string internally.
        let reply = self
            .ai
            .generate(AiRequest {
                text: text.clone(),
                history,
                user_context: profile.as_ref().map(user_context),
                conversation_key: Some(format!("{}:{session_id}", author.to_hex())),
            })
            .await;

        if !self.cfg.response_delay.is_zero() {
            tokio::time::sleep(self.cfg.response_delay).await;
        }

        // 10. Publish the reply; zero accepting relays is a retryable
        //     failure (the debit stands).
        self.reply_in_channel(event, &reply).await?;

        // 11. Balance announcement with the post-debit balance.
        let balance = self.store.balance(&author)?;
        let _ = self.outbox.announce_balance(&author, balance).await;

        // 12. Log the bot side.
        self.store.append_bot_message(
            &author,
            &session_id,
            MessageRecord::bot(&reply, Classification::Response).replying_to(user_msg_id),
            origin,
        )?;

        Ok(())
    }

    async fn answer_balance(
        &self,
        event: &Event,
        author: &Principal,
        session_id: &str,
        user_msg_id: &str,
        origin: SessionOrigin,
    ) -> Result<(), ProcessError> {
        let balance = self.store.balance(author)?;
        let text = format!(
            "Your balance is {balance} sats. Private messages cost 1 sat, public mentions 2 sats."
        );
        self.reply_in_channel(event, &text).await?;
        let _ = self.outbox.announce_balance(author, balance).await;
        self.store.append_bot_message(
            author,
            session_id,
            MessageRecord::bot(&text, Classification::BalanceInfo).replying_to(user_msg_id),
            origin,
        )?;
        Ok(())
    }

    async fn refuse_unfunded(
        &self,
        event: &Event,
        author: &Principal,
        session_id: &str,
        origin: SessionOrigin,
        balance: u64,
        required: u64,
    ) -> Result<(), ProcessError> {
        let text = format!(
            "Insufficient balance to process this request. Required: {required} sats, \
             available: {balance} sats. Send a zap to top up."
        );
        let _ = self.reply_in_channel(event, &text).await;
        let _ = self.outbox.announce_balance(author, balance).await;
        self.store.append_bot_message(
            author,
            session_id,
            MessageRecord::bot(&text, Classification::System),
            origin,
        )?;
        Ok(())
    }

    async fn reply_in_channel(&self, source: &Event, text: &str) -> Result<(), ProcessError> {
        match source.kind {
            EventKind::PrivateMessage => {
                self.outbox.send_private(&source.pubkey, text, source.session_tag()).await?;
            }
            _ => {
                self.outbox.send_public_reply(source, text).await?;
            }
        }
        Ok(())
    }

    async fn notify_failure(&self, event: &Event) {
        let text = "Sorry — something went wrong while processing your message. \
                    Your funds are safe; please try again.";
        if let Err(e) = self.outbox.send_private(&event.pubkey, text, event.session_tag()).await {
            debug!(error = %e, "error notice could not be delivered");
        }
    }
}

fn user_context(profile: &UserProfile) -> UserContext {
    UserContext {
        display_name: profile.label().map(str::to_string),
        about: profile.about.clone(),
    }
}

/// Stored records → AI chat turns: conversation content only, excluding the
/// just-appended current message.
fn chat_history(records: &[MessageRecord], exclude_id: &str) -> Vec<ChatTurn> {
    records
        .iter()
        .filter(|r| r.id != exclude_id)
        .filter(|r| {
            matches!(r.classification, Classification::Question | Classification::Response)
        })
        .map(|r| ChatTurn {
            role: match r.direction {
                Direction::User => ChatRole::User,
                Direction::Bot => ChatRole::Bot,
            },
            text: r.text.clone(),
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_history_filters_noise_and_current_message() {
        let records = vec![
            MessageRecord::user("q1", "e1", 4),
            MessageRecord::bot("a1", Classification::Response),
            MessageRecord::bot("your balance is 5", Classification::BalanceInfo),
            MessageRecord::bot("insufficient", Classification::System),
            MessageRecord::user("current", "e2", 4),
        ];
        let current_id = records[4].id.clone();

        let turns = chat_history(&records, &current_id);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "q1");
        assert!(matches!(turns[0].role, ChatRole::User));
        assert_eq!(turns[1].text, "a1");
        assert!(matches!(turns[1].role, ChatRole::Bot));
    }

    #[test]
    fn user_context_prefers_display_name() {
        let profile: UserProfile =
            serde_json::from_str(r#"{"name":"a","displayName":"Alice","about":"dev"}"#).unwrap();
        let ctx = user_context(&profile);
        assert_eq!(ctx.display_name.as_deref(), Some("Alice"));
        assert_eq!(ctx.about.as_deref(), Some("dev"));
    }
}
