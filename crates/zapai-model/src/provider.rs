// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AiError;

/// Who said a turn in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Bot,
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: ChatRole::User, text: text.into() }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self { role: ChatRole::Bot, text: text.into() }
    }
}

/// A single completion request: system primer, prior turns, current message.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub history: Vec<ChatTurn>,
    pub text: String,
    /// Sampling temperature override (e.g. low for summary extraction).
    pub temperature: Option<f32>,
}

/// Driver seam for a remote completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send one completion request and return the reply text.
    async fn complete(&self, req: CompletionRequest) -> Result<String, AiError>;
}
