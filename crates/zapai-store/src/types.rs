// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Records persisted by the [`SessionStore`](crate::SessionStore).

use serde::{Deserialize, Serialize};

use zapai_proto::Principal;

/// Current wall clock in milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// How a session was first opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    Dm,
    Public,
    Other(String),
}

/// Metadata for one `(principal, session-id)` conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created_at: u64,
    pub last_message_at: u64,
    pub message_count: u64,
    pub origin: SessionOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    User,
    Bot,
}

/// What a stored message is, beyond its raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Question,
    Response,
    BalanceInfo,
    System,
}

/// One entry in a session's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub direction: Direction,
    pub text: String,
    pub timestamp: u64,
    pub classification: Classification,
    /// Stored id of the user message this bot reply answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Source event id for user messages; doubles as the processed marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<u32>,
    /// Snapshot of the author's display name at the time of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
}

impl MessageRecord {
    pub fn user(text: impl Into<String>, event_id: impl Into<String>, event_kind: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction: Direction::User,
            text: text.into(),
            timestamp: now_millis(),
            classification: Classification::Question,
            reply_to: None,
            event_id: Some(event_id.into()),
            event_kind: Some(event_kind),
            profile_name: None,
        }
    }

    pub fn bot(text: impl Into<String>, classification: Classification) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction: Direction::Bot,
            text: text.into(),
            timestamp: now_millis(),
            classification,
            reply_to: None,
            event_id: None,
            event_kind: None,
            profile_name: None,
        }
    }

    pub fn replying_to(mut self, stored_id: impl Into<String>) -> Self {
        self.reply_to = Some(stored_id.into());
        self
    }

    pub fn with_profile_name(mut self, name: Option<String>) -> Self {
        self.profile_name = name;
        self
    }
}

/// Marker proving an inbound event id was already handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMarker {
    pub session_id: String,
    pub timestamp: u64,
}

/// Per-principal balance in sats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub pubkey: Principal,
    pub balance: u64,
    pub last_updated: u64,
}

/// A parsed and credited payment receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub sender: Principal,
    pub amount_sats: u64,
    pub request_id: String,
    pub receipt_event_id: String,
    pub invoice: String,
    pub description: String,
    pub received_at: u64,
}
