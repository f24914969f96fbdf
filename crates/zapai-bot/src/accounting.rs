// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The accounting engine: receipt ingest and balance queries.
//!
//! A receipt event carries the paid invoice (`bolt11` tag) and, in its
//! `description` tag, the JSON of the payment request it settles.  The
//! sender and amount come from that embedded request — `pubkey`, and the
//! `amount` tag in millisats — with the receipt's own fields as fallback.
//! Credits are applied with a store-level CAS so racing double-receipts from
//! multiple relays cannot lose an update.
//!
//! Debits happen in the processor *before* the AI call; a later AI or
//! publish failure does not refund.  That asymmetry is deliberate — refunds
//! would turn the retry path into a rate-limit bypass.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use zapai_proto::{Event, EventKind, Principal};
use zapai_store::{now_millis, ReceiptRecord, SessionStore};

use crate::outbox::Outbox;

/// Price of one request, by channel kind.
pub fn price_for(kind: EventKind) -> u64 {
    match kind {
        EventKind::PrivateMessage => 1,
        _ => 2,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiptParseError {
    #[error("receipt has no description tag")]
    MissingDescription,

    #[error("receipt has no invoice tag")]
    MissingInvoice,

    #[error("embedded request is not valid JSON: {0}")]
    BadRequest(String),

    #[error("receipt carries no parseable amount")]
    NoAmount,
}

/// Parse a receipt event into a [`ReceiptRecord`].
pub fn parse_receipt(event: &Event) -> Result<ReceiptRecord, ReceiptParseError> {
    let invoice = event
        .tag_value("bolt11")
        .ok_or(ReceiptParseError::MissingInvoice)?
        .to_string();
    let description = event
        .tag_value("description")
        .ok_or(ReceiptParseError::MissingDescription)?
        .to_string();

    let request: Value = serde_json::from_str(&description)
        .map_err(|e| ReceiptParseError::BadRequest(e.to_string()))?;

    let sender: Principal = request["pubkey"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(event.pubkey);

    // Amount in millisats: the request's amount tag, falling back to the
    // receipt's own amount tag.
    let request_amount = request["tags"].as_array().and_then(|tags| {
        tags.iter()
            .filter_map(Value::as_array)
            .find(|t| t.first().and_then(Value::as_str) == Some("amount"))
            .and_then(|t| t.get(1))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
    });
    let amount_msat = request_amount
        .or_else(|| event.tag_value("amount").and_then(|s| s.parse::<u64>().ok()))
        .ok_or(ReceiptParseError::NoAmount)?;

    Ok(ReceiptRecord {
        sender,
        amount_sats: amount_msat / 1000,
        request_id: request["id"].as_str().unwrap_or_default().to_string(),
        receipt_event_id: event.id.clone(),
        invoice,
        description,
        received_at: now_millis(),
    })
}

pub struct Accounting {
    store: Arc<SessionStore>,
    outbox: Arc<Outbox>,
}

impl Accounting {
    pub fn new(store: Arc<SessionStore>, outbox: Arc<Outbox>) -> Self {
        Self { store, outbox }
    }

    /// Receipt ingest: parse, persist, credit, announce, thank.
    pub async fn handle_receipt(&self, event: &Event) {
        let receipt = match parse_receipt(event) {
            Ok(r) => r,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "dropping unparseable receipt");
                return;
            }
        };
        if receipt.amount_sats == 0 {
            warn!(event_id = %event.id, "dropping zero-amount receipt");
            return;
        }

        if let Err(e) = self.store.record_receipt(&receipt) {
            warn!(error = %e, "failed to persist receipt");
        }
        let new_balance = match self.store.credit(&receipt.sender, receipt.amount_sats) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to credit receipt");
                return;
            }
        };

        info!(
            sender = %receipt.sender,
            amount_sats = receipt.amount_sats,
            new_balance,
            "credited receipt"
        );

        let _ = self.outbox.announce_balance(&receipt.sender, new_balance).await;
        let thanks = format!(
            "Thanks for the {} sats! Your balance is now {} sats. ⚡",
            receipt.amount_sats, new_balance
        );
        let _ = self.outbox.send_public_mention(&receipt.sender, &thanks).await;
    }

    /// Balance query event: reply in channel and broadcast the announcement.
    pub async fn handle_balance_query(&self, event: &Event) {
        let balance = match self.store.balance(&event.pubkey) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to read balance for query");
                return;
            }
        };
        let text = format!("Your balance is {balance} sats.");
        let _ = self.outbox.send_private(&event.pubkey, &text, None).await;
        let _ = self.outbox.announce_balance(&event.pubkey, balance).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(byte: u8) -> Principal {
        Principal::from_bytes([byte; 32])
    }

    fn receipt_event(description: &str, own_amount: Option<&str>) -> Event {
        let mut tags = vec![
            vec!["bolt11".to_string(), "lnbc500n1...".to_string()],
            vec!["description".to_string(), description.to_string()],
        ];
        if let Some(a) = own_amount {
            tags.push(vec!["amount".to_string(), a.to_string()]);
        }
        Event {
            id: "receipt1".into(),
            pubkey: principal(0xEE), // the payment service, not the payer
            created_at: 1700000000,
            kind: EventKind::Receipt,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn pricing_by_channel_kind() {
        assert_eq!(price_for(EventKind::PrivateMessage), 1);
        assert_eq!(price_for(EventKind::PublicPost), 2);
    }

    #[test]
    fn parses_sender_and_amount_from_embedded_request() {
        let sender = principal(0x11);
        let description = serde_json::json!({
            "id": "req1",
            "pubkey": sender.to_hex(),
            "tags": [["amount", "50000"]],
        })
        .to_string();

        let receipt = parse_receipt(&receipt_event(&description, None)).unwrap();
        assert_eq!(receipt.sender, sender);
        assert_eq!(receipt.amount_sats, 50, "50000 millisats truncate to 50 sats");
        assert_eq!(receipt.request_id, "req1");
        assert_eq!(receipt.invoice, "lnbc500n1...");
    }

    #[test]
    fn amount_truncates_sub_sat_remainder() {
        let description = serde_json::json!({
            "pubkey": principal(1).to_hex(),
            "tags": [["amount", "1999"]],
        })
        .to_string();
        let receipt = parse_receipt(&receipt_event(&description, None)).unwrap();
        assert_eq!(receipt.amount_sats, 1);
    }

    #[test]
    fn falls_back_to_receipt_author_and_own_amount_tag() {
        let description = serde_json::json!({ "tags": [] }).to_string();
        let receipt = parse_receipt(&receipt_event(&description, Some("21000"))).unwrap();
        assert_eq!(receipt.sender, principal(0xEE));
        assert_eq!(receipt.amount_sats, 21);
    }

    #[test]
    fn missing_description_is_an_error() {
        let event = Event {
            id: "r".into(),
            pubkey: principal(1),
            created_at: 0,
            kind: EventKind::Receipt,
            tags: vec![vec!["bolt11".into(), "lnbc...".into()]],
            content: String::new(),
            sig: String::new(),
        };
        assert!(matches!(parse_receipt(&event), Err(ReceiptParseError::MissingDescription)));
    }

    #[test]
    fn missing_amount_everywhere_is_an_error() {
        let description = serde_json::json!({ "tags": [] }).to_string();
        assert!(matches!(
            parse_receipt(&receipt_event(&description, None)),
            Err(ReceiptParseError::NoAmount)
        ));
    }

    #[test]
    fn garbage_description_is_an_error() {
        assert!(matches!(
            parse_receipt(&receipt_event("not json", None)),
            Err(ReceiptParseError::BadRequest(_))
        ));
    }
}
