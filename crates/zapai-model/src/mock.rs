// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::AiError,
    provider::{CompletionProvider, CompletionRequest},
};

/// Deterministic mock provider for tests.  Echoes the current user message
/// back as the reply.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<String, AiError> {
        Ok(format!("MOCK: {}", req.text))
    }
}

/// A pre-scripted mock provider.  Each `complete` call pops the next script
/// from the front of the queue, so tests can stage exact sequences of
/// replies and failures without network access.
pub struct ScriptedMockProvider {
    scripts: Mutex<Vec<Result<String, AiError>>>,
    /// Artificial latency applied before answering, for timeout tests.
    delay: Mutex<Duration>,
    /// Number of `complete` calls observed.
    pub calls: AtomicU64,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Result<String, AiError>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider whose first reply is `reply`.
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    /// Convenience: fail `n` times with `err`, then succeed with `reply`.
    pub fn failing_then(n: usize, err: AiError, reply: impl Into<String>) -> Self {
        let mut scripts: Vec<Result<String, AiError>> =
            std::iter::repeat_with(|| Err(err.clone())).take(n).collect();
        scripts.push(Ok(reply.into()));
        Self::new(scripts)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last_request.lock().unwrap() = Some(req.clone());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Default fallback when all scripts are consumed.
            Ok(format!("MOCK: {}", req.text))
        } else {
            scripts.remove(0)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str) -> CompletionRequest {
        CompletionRequest { text: text.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn mock_echoes_current_text() {
        let p = MockProvider;
        assert_eq!(p.complete(req("hi")).await.unwrap(), "MOCK: hi");
    }

    #[tokio::test]
    async fn scripted_pops_in_order() {
        let p = ScriptedMockProvider::new(vec![
            Ok("one".into()),
            Err(AiError::Timeout),
            Ok("two".into()),
        ]);
        assert_eq!(p.complete(req("a")).await.unwrap(), "one");
        assert!(matches!(p.complete(req("b")).await, Err(AiError::Timeout)));
        assert_eq!(p.complete(req("c")).await.unwrap(), "two");
        assert_eq!(p.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_falls_back_to_echo_when_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        assert_eq!(p.complete(req("left over")).await.unwrap(), "MOCK: left over");
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedMockProvider::always("ok");
        let _ = p.complete(req("inspect me")).await;
        let seen = p.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.text, "inspect me");
    }
}
