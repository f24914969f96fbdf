// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Signed events and the principals that author them.
//!
//! An event id is the SHA-256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]` — the same array every
//! relay and client on the network hashes, so ids are content-addressed and
//! portable across relays.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest accepted `session` tag value.  Longer tags are treated as absent
/// so a hostile client cannot bloat session keys in the store.
pub const MAX_SESSION_TAG_LEN: usize = 120;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("invalid principal: {0}")]
    InvalidPrincipal(String),

    #[error("invalid event frame: {0}")]
    InvalidFrame(String),
}

/// 32-byte public key identifying a participant.  Rendered as stable
/// lowercase hex everywhere — store keys, tags, logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal([u8; 32]);

impl Principal {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps tracing output readable.
        write!(f, "Principal({}…)", &self.to_hex()[..8])
    }
}

impl FromStr for Principal {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ProtoError::InvalidPrincipal(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtoError::InvalidPrincipal(format!("expected 32 bytes, got {} hex chars", s.len())))?;
        Ok(Self(arr))
    }
}

impl Serialize for Principal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Event kinds this service consumes or produces.
///
/// Wire numbers follow the public network's conventions: 0/1/4 are the
/// long-standing metadata / post / encrypted-DM kinds, 9735 is the payment
/// receipt kind.  The balance query/announcement pair sits in the
/// job-request (5xxx) / job-result (6xxx) ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Metadata,
    PublicPost,
    PrivateMessage,
    BalanceQuery,
    BalanceAnnouncement,
    Receipt,
    Other(u32),
}

impl EventKind {
    pub fn as_u32(self) -> u32 {
        match self {
            EventKind::Metadata => 0,
            EventKind::PublicPost => 1,
            EventKind::PrivateMessage => 4,
            EventKind::BalanceQuery => 5700,
            EventKind::BalanceAnnouncement => 6700,
            EventKind::Receipt => 9735,
            EventKind::Other(n) => n,
        }
    }

    pub fn from_u32(n: u32) -> Self {
        match n {
            0 => EventKind::Metadata,
            1 => EventKind::PublicPost,
            4 => EventKind::PrivateMessage,
            5700 => EventKind::BalanceQuery,
            6700 => EventKind::BalanceAnnouncement,
            9735 => EventKind::Receipt,
            other => EventKind::Other(other),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u32::deserialize(deserializer)?;
        Ok(EventKind::from_u32(n))
    }
}

/// A signed, content-addressed record on the network.  Immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub pubkey: Principal,
    pub created_at: u64,
    pub kind: EventKind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Client-nominated session id, when present and within the length cap.
    pub fn session_tag(&self) -> Option<&str> {
        self.tag_value("session").filter(|s| !s.is_empty() && s.len() <= MAX_SESSION_TAG_LEN)
    }

    /// The principal this event is addressed to (`p` tag), if any.
    pub fn addressed_to(&self) -> Option<Principal> {
        self.tag_value("p").and_then(|v| v.parse().ok())
    }
}

/// Unsigned precursor of an [`Event`].  The signer computes the id and
/// signature and produces the final immutable event.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub created_at: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventDraft {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: now_seconds(),
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, values: &[&str]) -> Self {
        self.tags.push(values.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Address the event to a recipient principal.
    pub fn to_principal(self, p: &Principal) -> Self {
        let hex = p.to_hex();
        self.tag(&["p", &hex])
    }

    /// Mark the event as a reply to a source event.
    pub fn reply_to(self, event_id: &str) -> Self {
        self.tag(&["e", event_id, "", "reply"])
    }
}

/// Current wall clock in whole seconds.
pub fn now_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Content-addressed event id: SHA-256 over the canonical array
/// `[0, pubkey, created_at, kind, tags, content]`, hex-encoded.
pub fn compute_event_id(pubkey: &Principal, draft: &EventDraft) -> String {
    let canonical = serde_json::json!([
        0,
        pubkey.to_hex(),
        draft.created_at,
        draft.kind.as_u32(),
        draft.tags,
        draft.content,
    ]);
    // Value serialization of a JSON array cannot fail.
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    hex::encode(digest)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
