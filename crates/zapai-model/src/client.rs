// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The AI client the pipeline calls.
//!
//! Owns the per-conversation chat context cache and the degradation policy:
//! every provider call runs under the circuit breaker, transient failures are
//! retried with exponential backoff, and when everything fails the caller
//! still gets a reply — one of a fixed set of apology strings.  The pipeline
//! never sees an AI error.
//!
//! # Chat contexts
//!
//! A context is the accumulated conversation for one `principal:session-id`
//! key: the system primer plus the rolling turn history.  On a cache hit only
//! the new user message is added; on a miss the context is rebuilt from the
//! store-provided history (last 40 turns).  Contexts are value-owned by an
//! LRU cache — capacity eviction via LRU order, staleness eviction on lookup
//! after 30 minutes idle.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    breaker::{BreakerConfig, BreakerState, CircuitBreaker},
    error::AiError,
    provider::{ChatTurn, CompletionProvider, CompletionRequest},
};

/// Replies used when the backend is unavailable.
const FALLBACK_REPLIES: &[&str] = &[
    "I'm having trouble reaching my brain right now — please try again in a moment.",
    "Sorry, I couldn't process that just now. Give me a minute and ask again.",
    "My thinking service is briefly unavailable. Your balance was not charged twice — just retry shortly.",
];

/// Extra attempts after the first failed call.
const EXTRA_ATTEMPTS: u32 = 2;

/// History turns seeded into a fresh chat context.
const HISTORY_SEED_LIMIT: usize = 40;

#[derive(Debug, Clone)]
pub struct AiClientConfig {
    pub bot_name: String,
    pub session_reuse: bool,
    pub chat_ttl: Duration,
    pub max_chat_sessions: usize,
    pub enable_memory_summary: bool,
    pub memory_summary_min_messages: usize,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            bot_name: "ZapAI".into(),
            session_reuse: true,
            chat_ttl: Duration::from_secs(30 * 60),
            max_chat_sessions: 5000,
            enable_memory_summary: false,
            memory_summary_min_messages: 16,
        }
    }
}

/// Profile fields folded into the system primer when known.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub display_name: Option<String>,
    pub about: Option<String>,
}

/// One generation request from the processor.
#[derive(Debug, Clone, Default)]
pub struct AiRequest {
    pub text: String,
    pub history: Vec<ChatTurn>,
    pub user_context: Option<UserContext>,
    /// `principal:session-id`; enables chat context reuse when set.
    pub conversation_key: Option<String>,
}

struct ChatContext {
    system: String,
    turns: Vec<ChatTurn>,
    last_used: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiStatsSnapshot {
    pub provider: String,
    pub model: String,
    pub calls: u64,
    pub successes: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub active_chat_sessions: usize,
    pub breaker_state: BreakerState,
    pub breaker_rejections: u64,
}

pub struct AiClient {
    provider: Arc<dyn CompletionProvider>,
    breaker: CircuitBreaker,
    cfg: AiClientConfig,
    contexts: Mutex<LruCache<String, ChatContext>>,
    calls: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
}

impl AiClient {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        breaker_cfg: BreakerConfig,
        cfg: AiClientConfig,
    ) -> Self {
        let cap = NonZeroUsize::new(cfg.max_chat_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            breaker: CircuitBreaker::new(breaker_cfg),
            cfg,
            contexts: Mutex::new(LruCache::new(cap)),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Generate a reply.  Never fails: after the breaker and the retry loop
    /// are exhausted the caller gets an apology string instead of an error.
    pub async fn generate(&self, req: AiRequest) -> String {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let (system, turns) = self.resolve_context(&req).await;
        let completion = CompletionRequest {
            system: Some(system.clone()),
            history: turns.clone(),
            text: req.text.clone(),
            temperature: None,
        };

        let mut attempt: u32 = 0;
        loop {
            match self.breaker.call(self.provider.complete(completion.clone())).await {
                Ok(reply) => {
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    self.remember_exchange(&req, system, turns, &reply);
                    return reply;
                }
                Err(AiError::BreakerOpen) => {
                    // The breaker stays open for the whole backoff horizon;
                    // retrying would only burn time.
                    return self.fallback();
                }
                Err(e) if e.is_transient() && attempt < EXTRA_ATTEMPTS => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    let backoff = Duration::from_millis((1000u64 << (attempt - 1)).min(5000));
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying ai call");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(error = %e, "ai call failed, serving fallback");
                    return self.fallback();
                }
            }
        }
    }

    /// Resolve the system primer and turn history for this request, from the
    /// chat context cache when possible.
    async fn resolve_context(&self, req: &AiRequest) -> (String, Vec<ChatTurn>) {
        if self.cfg.session_reuse {
            if let Some(key) = &req.conversation_key {
                let mut cache = self.contexts.lock().unwrap();
                let fresh = match cache.get(key) {
                    Some(ctx) if ctx.last_used.elapsed() <= self.cfg.chat_ttl => {
                        Some((ctx.system.clone(), ctx.turns.clone()))
                    }
                    Some(_) => {
                        cache.pop(key);
                        None
                    }
                    None => None,
                };
                if let Some(hit) = fresh {
                    return hit;
                }
            }
        }

        // Cache miss: build a fresh context from the stored history.
        let mut system = self.build_primer(req.user_context.as_ref());
        if self.cfg.enable_memory_summary
            && req.history.len() >= self.cfg.memory_summary_min_messages
        {
            if let Some(summary) = self.memory_summary(&req.history).await {
                system.push_str("\n\nWhat you remember about this user:\n");
                system.push_str(&summary);
            }
        }

        let mut turns = req.history.clone();
        if turns.len() > HISTORY_SEED_LIMIT {
            turns.drain(..turns.len() - HISTORY_SEED_LIMIT);
        }
        (system, turns)
    }

    fn build_primer(&self, user: Option<&UserContext>) -> String {
        let today = chrono::Utc::now().format("%Y-%m-%d");
        let mut primer = format!(
            "You are {name}, a helpful assistant living on a decentralized \
             social network. Users pay small amounts per question, so answer \
             directly and completely in one message. Today's date is {today}.",
            name = self.cfg.bot_name,
        );
        if let Some(user) = user {
            if let Some(name) = &user.display_name {
                primer.push_str(&format!(" You are talking to {name}."));
            }
            if let Some(about) = &user.about {
                primer.push_str(&format!(" They describe themselves as: {about}."));
            }
        }
        primer
    }

    /// Ask the model for a compact JSON memory of a long conversation.
    /// Failure here is never fatal — the context just loses the summary.
    async fn memory_summary(&self, history: &[ChatTurn]) -> Option<String> {
        let transcript: String = history
            .iter()
            .map(|t| {
                let who = match t.role {
                    crate::provider::ChatRole::User => "user",
                    crate::provider::ChatRole::Bot => "you",
                };
                format!("{who}: {}\n", t.text)
            })
            .collect();

        let req = CompletionRequest {
            system: Some(
                "Summarize the conversation as compact JSON with keys \
                 \"summary\", \"facts\", \"preferences\". Output JSON only."
                    .into(),
            ),
            history: Vec::new(),
            text: transcript,
            temperature: Some(0.1),
        };

        match self.breaker.call(self.provider.complete(req)).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                debug!(error = %e, "memory summary skipped");
                None
            }
        }
    }

    /// Record a successful exchange into the chat context cache.
    fn remember_exchange(
        &self,
        req: &AiRequest,
        system: String,
        mut turns: Vec<ChatTurn>,
        reply: &str,
    ) {
        if !self.cfg.session_reuse {
            return;
        }
        let Some(key) = &req.conversation_key else { return };

        turns.push(ChatTurn::user(&req.text));
        turns.push(ChatTurn::bot(reply));
        if turns.len() > HISTORY_SEED_LIMIT {
            let excess = turns.len() - HISTORY_SEED_LIMIT;
            turns.drain(..excess);
        }

        let mut cache = self.contexts.lock().unwrap();
        cache.put(
            key.clone(),
            ChatContext { system, turns, last_used: Instant::now() },
        );
    }

    fn fallback(&self) -> String {
        let n = self.fallbacks.fetch_add(1, Ordering::Relaxed);
        FALLBACK_REPLIES[(n as usize) % FALLBACK_REPLIES.len()].to_string()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn stats(&self) -> AiStatsSnapshot {
        AiStatsSnapshot {
            provider: self.provider.name().to_string(),
            model: self.provider.model_name().to_string(),
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            active_chat_sessions: self.contexts.lock().unwrap().len(),
            breaker_state: self.breaker.state(),
            breaker_rejections: self.breaker.rejections(),
        }
    }

    /// True when the returned reply is one of the canned fallback strings.
    pub fn is_fallback_reply(reply: &str) -> bool {
        FALLBACK_REPLIES.contains(&reply)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedMockProvider;

    fn client(provider: ScriptedMockProvider) -> (AiClient, Arc<ScriptedMockProvider>) {
        let provider = Arc::new(provider);
        let client = AiClient::new(
            provider.clone(),
            BreakerConfig::default(),
            AiClientConfig::default(),
        );
        (client, provider)
    }

    fn req(text: &str, key: Option<&str>) -> AiRequest {
        AiRequest {
            text: text.into(),
            conversation_key: key.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_returns_provider_reply() {
        let (client, _) = client(ScriptedMockProvider::always("hello from model"));
        let reply = client.generate(req("hi", None)).await;
        assert_eq!(reply, "hello from model");
        assert!(!AiClient::is_fallback_reply(&reply));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_succeed() {
        let (client, provider) = client(ScriptedMockProvider::failing_then(
            2,
            AiError::Transport("flaky".into()),
            "finally",
        ));
        let reply = client.generate(req("hi", None)).await;
        assert_eq!(reply, "finally");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(client.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_serve_fallback() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![
            Err(AiError::Transport("a".into())),
            Err(AiError::Transport("b".into())),
            Err(AiError::Transport("c".into())),
        ]));
        let reply = client.generate(req("hi", None)).await;
        assert!(AiClient::is_fallback_reply(&reply));
        assert_eq!(provider.call_count(), 3, "one call plus two retries");
        assert_eq!(client.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn remote_rejection_is_not_retried() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![Err(AiError::Remote {
            status: 400,
            body: "bad request".into(),
        })]));
        let reply = client.generate(req("hi", None)).await;
        assert!(AiClient::is_fallback_reply(&reply));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_serves_fallback_without_calling_provider() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![
            Err(AiError::Transport("1".into())),
            Err(AiError::Transport("2".into())),
            Err(AiError::Transport("3".into())),
        ]));
        // Three transient failures: one generate() call burns all attempts
        // and trips the breaker.
        let _ = client.generate(req("a", None)).await;
        assert_eq!(client.breaker_state(), BreakerState::Open);
        let calls_before = provider.call_count();

        let reply = client.generate(req("b", None)).await;
        assert!(AiClient::is_fallback_reply(&reply));
        assert_eq!(provider.call_count(), calls_before, "open breaker must not touch provider");
    }

    #[tokio::test]
    async fn context_is_reused_across_calls_with_same_key() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![
            Ok("first reply".into()),
            Ok("second reply".into()),
        ]));

        let _ = client.generate(req("first question", Some("p1:s1"))).await;
        let _ = client.generate(req("second question", Some("p1:s1"))).await;

        // The second request must carry the first exchange as history from
        // the cached context, not from req.history (which we left empty).
        let seen = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.history.len(), 2);
        assert_eq!(seen.history[0].text, "first question");
        assert_eq!(seen.history[1].text, "first reply");
        assert_eq!(client.stats().active_chat_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_context_is_dropped_on_lookup() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![
            Ok("r1".into()),
            Ok("r2".into()),
        ]));
        let _ = client.generate(req("q1", Some("p1:s1"))).await;

        tokio::time::advance(Duration::from_secs(31 * 60)).await;

        let _ = client.generate(req("q2", Some("p1:s1"))).await;
        let seen = provider.last_request.lock().unwrap().clone().unwrap();
        assert!(seen.history.is_empty(), "expired context must not leak old turns");
    }

    #[tokio::test]
    async fn capacity_eviction_drops_least_recently_used() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![]));
        let client = AiClient::new(
            provider,
            BreakerConfig::default(),
            AiClientConfig { max_chat_sessions: 2, ..AiClientConfig::default() },
        );

        let _ = client.generate(req("a", Some("k1"))).await;
        let _ = client.generate(req("b", Some("k2"))).await;
        let _ = client.generate(req("c", Some("k3"))).await;

        assert_eq!(client.stats().active_chat_sessions, 2);
    }

    #[tokio::test]
    async fn history_seed_is_truncated_to_limit() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![Ok("r".into())]));
        let history: Vec<ChatTurn> =
            (0..100).map(|i| ChatTurn::user(format!("m{i}"))).collect();
        let _ = client
            .generate(AiRequest { text: "q".into(), history, ..Default::default() })
            .await;

        let seen = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.history.len(), HISTORY_SEED_LIMIT);
        assert_eq!(seen.history.last().unwrap().text, "m99");
    }

    #[tokio::test]
    async fn primer_includes_identity_and_user_fields() {
        let (client, provider) = client(ScriptedMockProvider::new(vec![Ok("r".into())]));
        let _ = client
            .generate(AiRequest {
                text: "q".into(),
                user_context: Some(UserContext {
                    display_name: Some("Alice".into()),
                    about: Some("rust dev".into()),
                }),
                ..Default::default()
            })
            .await;

        let seen = provider.last_request.lock().unwrap().clone().unwrap();
        let system = seen.system.unwrap();
        assert!(system.contains("ZapAI"));
        assert!(system.contains("Alice"));
        assert!(system.contains("rust dev"));
    }

    #[tokio::test]
    async fn fallback_strings_rotate() {
        let (client, _) = client(ScriptedMockProvider::new(vec![
            Err(AiError::Remote { status: 500, body: String::new() }),
            Err(AiError::Remote { status: 500, body: String::new() }),
        ]));
        let a = client.generate(req("x", None)).await;
        let b = client.generate(req("y", None)).await;
        assert!(AiClient::is_fallback_reply(&a));
        assert!(AiClient::is_fallback_reply(&b));
        assert_ne!(a, b);
    }
}
