// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the non-streaming `generateContent` endpoint; the bot publishes whole
//! replies to relays, so there is nothing to stream to.
//!
//! # Auth
//! API key via `?key=...` query param.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent`

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::AiError,
    provider::{ChatRole, CompletionProvider, CompletionRequest},
};

pub struct GoogleProvider {
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(
        model: String,
        api_key: String,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            max_tokens: max_tokens.unwrap_or(2048),
            temperature: temperature.unwrap_or(0.7),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut contents: Vec<Value> = req
            .history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    ChatRole::User => "user",
                    ChatRole::Bot => "model",
                };
                json!({ "role": role, "parts": [{ "text": turn.text }] })
            })
            .collect();
        contents.push(json!({ "role": "user", "parts": [{ "text": req.text }] }));

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": req.temperature.unwrap_or(self.temperature),
            }
        });
        if let Some(system) = &req.system {
            if !system.trim().is_empty() {
                body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
            }
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<String, AiError> {
        let body = self.build_body(&req);
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key,
        );

        debug!(model = %self.model, turns = req.history.len(), "sending Gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AiError::Remote { status, body });
        }

        let value: Value = resp.json().await.map_err(|e| AiError::Malformed(e.to_string()))?;
        parse_reply(&value)
    }
}

/// Extract the reply text from a `generateContent` response: concatenate the
/// text parts of the first candidate.
fn parse_reply(value: &Value) -> Result<String, AiError> {
    let parts = value["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| AiError::Malformed("response has no candidate parts".into()))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(AiError::Malformed("candidate contained no text".into()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatTurn;

    fn provider() -> GoogleProvider {
        GoogleProvider::new("gemini-2.0-flash".into(), "test-key".into(), None, None, None)
    }

    #[test]
    fn provider_name() {
        let p = provider();
        assert_eq!(p.name(), "google");
        assert_eq!(p.model_name(), "gemini-2.0-flash");
    }

    #[test]
    fn body_maps_roles_and_appends_current_text() {
        let p = provider();
        let req = CompletionRequest {
            system: Some("You are a helper.".into()),
            history: vec![ChatTurn::user("hi"), ChatTurn::bot("hello")],
            text: "what now?".into(),
            temperature: None,
        };
        let body = p.build_body(&req);

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "what now?");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are a helper.");
    }

    #[test]
    fn body_omits_empty_system_instruction() {
        let p = provider();
        let req = CompletionRequest { text: "x".into(), ..Default::default() };
        let body = p.build_body(&req);
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn temperature_override_is_honoured() {
        let p = provider();
        let req = CompletionRequest {
            text: "summarize".into(),
            temperature: Some(0.1),
            ..Default::default()
        };
        let body = p.build_body(&req);
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn reply_parsing_concatenates_text_parts() {
        let v = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "there" }] }
            }]
        });
        assert_eq!(parse_reply(&v).unwrap(), "Hello there");
    }

    #[test]
    fn reply_parsing_rejects_empty_candidates() {
        let v = json!({ "candidates": [] });
        assert!(matches!(parse_reply(&v), Err(AiError::Malformed(_))));

        let blank = json!({
            "candidates": [{ "content": { "parts": [{ "text": "  " }] } }]
        });
        assert!(matches!(parse_reply(&blank), Err(AiError::Malformed(_))));
    }
}
