// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Read-only HTTP observability surface.
//!
//! `GET /status` — counters, queue, rate limiter, AI and per-relay health as
//! one JSON document.  Optionally protected by a bearer password
//! (`DASHBOARD_PASSWORD`), compared in constant time.
//!
//! `GET /health` — 200 while the queue is below its high-water mark and the
//! breaker is not open, 503 otherwise.  Always unauthenticated so process
//! supervisors can probe it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tracing::info;

use zapai_model::{AiClient, BreakerState};
use zapai_relay::RelaySupervisor;

use crate::limiter::RateLimiter;
use crate::queue::WorkQueue;
use crate::stats::BotCounters;

/// /health trips when this many tasks are pending.
const HEALTH_QUEUE_LIMIT: usize = 9000;

pub struct StatusSources {
    pub started_at: Instant,
    pub bot_name: String,
    pub bot_pubkey: String,
    pub counters: Arc<BotCounters>,
    pub queue: Arc<WorkQueue>,
    pub limiter: Arc<RateLimiter>,
    pub ai: Arc<AiClient>,
    pub relays: Arc<RelaySupervisor>,
}

#[derive(Clone)]
pub struct StatusState {
    sources: Arc<StatusSources>,
    password: Option<Arc<str>>,
}

impl StatusState {
    pub fn new(sources: Arc<StatusSources>, password: Option<String>) -> Self {
        Self { sources, password: password.map(Arc::from) }
    }
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve in the background; returns the bound address (useful when
/// the configured port is 0).
pub async fn serve(
    port: u16,
    state: StatusState,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "status surface listening");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            tracing::error!(error = %e, "status server stopped");
        }
    });
    Ok((addr, handle))
}

async fn status_handler(State(state): State<StatusState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let s = &state.sources;
    let body = serde_json::json!({
        "name": s.bot_name,
        "pubkey": s.bot_pubkey,
        "uptime_secs": s.started_at.elapsed().as_secs(),
        "counters": s.counters.snapshot(),
        "queue": s.queue.stats(),
        "rate_limiter": s.limiter.stats(),
        "ai": s.ai.stats(),
        "relays": s.relays.health_snapshot(),
    });
    Json(body).into_response()
}

async fn health_handler(State(state): State<StatusState>) -> Response {
    let s = &state.sources;
    let queue_ok = s.queue.len() < HEALTH_QUEUE_LIMIT;
    let breaker_ok = s.ai.breaker_state() != BreakerState::Open;
    if queue_ok && breaker_ok {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded").into_response()
    }
}

fn authorized(state: &StatusState, headers: &HeaderMap) -> bool {
    let Some(password) = &state.password else { return true };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    presented.as_bytes().ct_eq(password.as_bytes()).into()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use zapai_model::{AiClientConfig, BreakerConfig, MockProvider};
    use zapai_relay::{MockRelayNetwork, SupervisorConfig};

    use crate::limiter::RateLimiterConfig;
    use crate::queue::QueueConfig;

    fn sources() -> Arc<StatusSources> {
        let ai = Arc::new(AiClient::new(
            Arc::new(MockProvider),
            BreakerConfig::default(),
            AiClientConfig::default(),
        ));
        let relays = RelaySupervisor::new(
            Arc::new(MockRelayNetwork::new()),
            vec![],
            SupervisorConfig::default(),
        );
        Arc::new(StatusSources {
            started_at: Instant::now(),
            bot_name: "ZapAI".into(),
            bot_pubkey: "ab".repeat(32),
            counters: Arc::new(BotCounters::default()),
            queue: WorkQueue::new(QueueConfig::default()),
            limiter: Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            ai,
            relays,
        })
    }

    #[tokio::test]
    async fn status_returns_full_document_without_auth() {
        let state = StatusState::new(sources(), None);
        let (addr, _server) = serve(0, state).await.unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["name"], "ZapAI");
        assert!(body["counters"]["received"].is_u64());
        assert!(body["queue"]["queue_size"].is_u64());
        assert_eq!(body["ai"]["breaker_state"], "CLOSED");
        assert!(body["relays"].is_array());
    }

    #[tokio::test]
    async fn health_is_ok_when_idle() {
        let state = StatusState::new(sources(), None);
        let (addr, _server) = serve(0, state).await.unwrap();

        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn password_gates_status_but_not_health() {
        let state = StatusState::new(sources(), Some("hunter2".into()));
        let (addr, _server) = serve(0, state).await.unwrap();
        let client = reqwest::Client::new();

        let denied = client.get(format!("http://{addr}/status")).send().await.unwrap();
        assert_eq!(denied.status(), 401);

        let wrong = client
            .get(format!("http://{addr}/status"))
            .header("authorization", "Bearer nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let allowed = client
            .get(format!("http://{addr}/status"))
            .header("authorization", "Bearer hunter2")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);

        let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(health.status(), 200, "/health must stay open for supervisors");
    }
}
