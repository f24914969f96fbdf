// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Subscription filters.
//!
//! A filter narrows a subscription by kind, author, addressee (`#p` tag) and
//! creation time.  Relays AND the fields of one filter and OR the filters of
//! one subscription.

use serde::{Deserialize, Serialize};

use crate::event::{EventKind, Principal};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub kinds: Vec<EventKind>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub authors: Vec<Principal>,

    /// Events addressed to these principals (`p` tags).
    #[serde(rename = "#p", skip_serializing_if = "Vec::is_empty", default)]
    pub p_tags: Vec<Principal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author(mut self, p: Principal) -> Self {
        self.authors.push(p);
        self
    }

    pub fn addressed_to(mut self, p: Principal) -> Self {
        self.p_tags.push(p);
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_tags_serialize_under_hash_p() {
        let p = Principal::from_bytes([3; 32]);
        let f = Filter::new().kind(EventKind::PrivateMessage).addressed_to(p).since(100);
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["kinds"][0], 4);
        assert_eq!(v["#p"][0], p.to_hex());
        assert_eq!(v["since"], 100);
        assert!(v.get("authors").is_none(), "empty fields must be omitted");
    }

    #[test]
    fn filter_round_trips_through_json() {
        let f = Filter::new()
            .kind(EventKind::Metadata)
            .author(Principal::from_bytes([9; 32]))
            .limit(1);
        let back: Filter = serde_json::from_value(serde_json::to_value(&f).unwrap()).unwrap();
        assert_eq!(back, f);
    }
}
