// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The [`SessionStore`] — all durable state, one sled tree.
//!
//! # Key layout
//!
//! ```text
//! session:meta:<principal>:<session-id>      → SessionMeta
//! session:messages:<principal>:<session-id>  → Vec<MessageRecord> (tail-capped)
//! user:sessions:<principal>                  → Vec<session-id> (insertion order)
//! event:processed:<event-id>                 → ProcessedMarker
//! balance:<principal>                        → BalanceRecord
//! zap:<principal>:<timestamp-ms>             → ReceiptRecord
//! ```
//!
//! # Concurrency
//!
//! Every read-modify-write goes through `compare_and_swap` and retries on
//! conflict.  Two workers appending to the same session serialize on the
//! messages key; two racing credits for the same principal both land; two
//! racing debits either both commit with a non-negative balance or one
//! observes insufficient funds.  The processed-event marker is inserted with
//! a `None → Some` CAS, which is the transactional "process once" gate.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use zapai_proto::Principal;

use crate::error::StoreError;
use crate::types::{
    now_millis, BalanceRecord, MessageRecord, ProcessedMarker, ReceiptRecord, SessionMeta,
    SessionOrigin,
};

/// Message logs keep only this many most-recent entries.
pub const MESSAGE_LOG_CAP: usize = 1000;

pub struct SessionStore {
    db: sled::Db,
}

impl SessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory store for tests; nothing touches the filesystem.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ── Processed-event markers ───────────────────────────────────────────────

    pub fn is_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(key_processed(event_id))?)
    }

    pub fn processed_marker(&self, event_id: &str) -> Result<Option<ProcessedMarker>, StoreError> {
        self.get_json(&key_processed(event_id))
    }

    // ── Message log ───────────────────────────────────────────────────────────

    /// Append a user message, claiming the processed-event marker first.
    ///
    /// The marker insert is a `None → Some` CAS: exactly one worker wins for
    /// a given event id, every other appender gets [`StoreError::DuplicateEvent`]
    /// and must treat the whole event as already handled.
    ///
    /// Returns the stored record id.
    pub fn append_user_message(
        &self,
        principal: &Principal,
        session_id: &str,
        record: MessageRecord,
        origin: SessionOrigin,
    ) -> Result<String, StoreError> {
        let event_id = record.event_id.clone().unwrap_or_default();
        let marker = ProcessedMarker { session_id: session_id.to_string(), timestamp: now_millis() };
        let marker_bytes = to_bytes(&marker)?;

        let claimed = self
            .db
            .compare_and_swap(
                key_processed(&event_id),
                None::<&[u8]>,
                Some(marker_bytes.as_slice()),
            )?
            .is_ok();
        if !claimed {
            return Err(StoreError::DuplicateEvent(event_id));
        }

        self.append_record(principal, session_id, record, origin)
    }

    /// Append a bot-side record (reply, balance info, system notice).
    pub fn append_bot_message(
        &self,
        principal: &Principal,
        session_id: &str,
        record: MessageRecord,
        origin: SessionOrigin,
    ) -> Result<String, StoreError> {
        self.append_record(principal, session_id, record, origin)
    }

    fn append_record(
        &self,
        principal: &Principal,
        session_id: &str,
        record: MessageRecord,
        origin: SessionOrigin,
    ) -> Result<String, StoreError> {
        let key = key_messages(principal, session_id);
        let record_id = record.id.clone();
        let timestamp = record.timestamp;

        // Serialize the append against concurrent writers to the same session.
        let new_len = loop {
            let current = self.db.get(&key)?;
            let mut log: Vec<MessageRecord> = match &current {
                Some(bytes) => from_bytes(&key, bytes)?,
                None => Vec::new(),
            };
            log.push(record.clone());
            if log.len() > MESSAGE_LOG_CAP {
                let excess = log.len() - MESSAGE_LOG_CAP;
                log.drain(..excess);
            }
            let len = log.len() as u64;
            let updated = to_bytes(&log)?;
            let swap = self.db.compare_and_swap(
                &key,
                current.as_ref().map(|v| v.as_ref()),
                Some(updated.as_slice()),
            )?;
            if swap.is_ok() {
                break len;
            }
        };

        self.bump_session_meta(principal, session_id, new_len, timestamp, origin)?;
        self.index_session(principal, session_id)?;
        Ok(record_id)
    }

    fn bump_session_meta(
        &self,
        principal: &Principal,
        session_id: &str,
        observed_len: u64,
        timestamp: u64,
        origin: SessionOrigin,
    ) -> Result<(), StoreError> {
        let key = key_meta(principal, session_id);
        loop {
            let current = self.db.get(&key)?;
            let meta = match &current {
                Some(bytes) => {
                    let mut meta: SessionMeta = from_bytes(&key, bytes)?;
                    // A racing appender may have already recorded a longer log;
                    // never move the count backwards.
                    meta.message_count = meta.message_count.max(observed_len);
                    meta.last_message_at = meta.last_message_at.max(timestamp);
                    meta
                }
                None => SessionMeta {
                    created_at: timestamp,
                    last_message_at: timestamp,
                    message_count: observed_len,
                    origin: origin.clone(),
                    label: None,
                },
            };
            let updated = to_bytes(&meta)?;
            let swap = self.db.compare_and_swap(
                &key,
                current.as_ref().map(|v| v.as_ref()),
                Some(updated.as_slice()),
            )?;
            if swap.is_ok() {
                return Ok(());
            }
        }
    }

    fn index_session(&self, principal: &Principal, session_id: &str) -> Result<(), StoreError> {
        let key = key_user_sessions(principal);
        loop {
            let current = self.db.get(&key)?;
            let mut ids: Vec<String> = match &current {
                Some(bytes) => from_bytes(&key, bytes)?,
                None => Vec::new(),
            };
            if ids.iter().any(|s| s == session_id) {
                return Ok(());
            }
            ids.push(session_id.to_string());
            let updated = to_bytes(&ids)?;
            let swap = self.db.compare_and_swap(
                &key,
                current.as_ref().map(|v| v.as_ref()),
                Some(updated.as_slice()),
            )?;
            if swap.is_ok() {
                return Ok(());
            }
        }
    }

    /// Up to `limit` most recent messages of one session, oldest first.
    pub fn messages(
        &self,
        principal: &Principal,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let key = key_messages(principal, session_id);
        let mut log: Vec<MessageRecord> = self.get_json(&key)?.unwrap_or_default();
        if log.len() > limit {
            log.drain(..log.len() - limit);
        }
        Ok(log)
    }

    /// Up to `limit` most recent messages across all of a principal's
    /// sessions, merged and sorted by timestamp.
    pub fn all_messages(
        &self,
        principal: &Principal,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut merged = Vec::new();
        for session_id in self.sessions_for(principal)? {
            merged.extend(self.messages(principal, &session_id, MESSAGE_LOG_CAP)?);
        }
        merged.sort_by_key(|m| m.timestamp);
        if merged.len() > limit {
            merged.drain(..merged.len() - limit);
        }
        Ok(merged)
    }

    pub fn session_meta(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<Option<SessionMeta>, StoreError> {
        self.get_json(&key_meta(principal, session_id))
    }

    /// Session ids of a principal in insertion order.
    pub fn sessions_for(&self, principal: &Principal) -> Result<Vec<String>, StoreError> {
        Ok(self.get_json(&key_user_sessions(principal))?.unwrap_or_default())
    }

    // ── Balances ──────────────────────────────────────────────────────────────

    pub fn balance(&self, principal: &Principal) -> Result<u64, StoreError> {
        Ok(self
            .get_json::<BalanceRecord>(&key_balance(principal))?
            .map(|r| r.balance)
            .unwrap_or(0))
    }

    /// Atomically add `amount` sats.  Returns the new balance.
    pub fn credit(&self, principal: &Principal, amount: u64) -> Result<u64, StoreError> {
        self.mutate_balance(principal, |balance| Ok(balance + amount))
    }

    /// Atomically subtract `amount` sats, rejecting before the balance would
    /// go negative.  Returns the new balance.
    pub fn debit(&self, principal: &Principal, amount: u64) -> Result<u64, StoreError> {
        self.mutate_balance(principal, |balance| {
            balance
                .checked_sub(amount)
                .ok_or(StoreError::InsufficientFunds { balance, required: amount })
        })
    }

    fn mutate_balance(
        &self,
        principal: &Principal,
        op: impl Fn(u64) -> Result<u64, StoreError>,
    ) -> Result<u64, StoreError> {
        let key = key_balance(principal);
        loop {
            let current = self.db.get(&key)?;
            let balance = match &current {
                Some(bytes) => from_bytes::<BalanceRecord>(&key, bytes)?.balance,
                None => 0,
            };
            let new_balance = op(balance)?;
            let record = BalanceRecord {
                pubkey: *principal,
                balance: new_balance,
                last_updated: now_millis(),
            };
            let updated = to_bytes(&record)?;
            let swap = self.db.compare_and_swap(
                &key,
                current.as_ref().map(|v| v.as_ref()),
                Some(updated.as_slice()),
            )?;
            if swap.is_ok() {
                return Ok(new_balance);
            }
        }
    }

    // ── Receipts ──────────────────────────────────────────────────────────────

    pub fn record_receipt(&self, receipt: &ReceiptRecord) -> Result<(), StoreError> {
        let key = format!("zap:{}:{}", receipt.sender.to_hex(), receipt.received_at);
        self.db.insert(key.as_bytes(), to_bytes(receipt)?)?;
        Ok(())
    }

    pub fn receipts_for(&self, principal: &Principal) -> Result<Vec<ReceiptRecord>, StoreError> {
        let prefix = format!("zap:{}:", principal.to_hex());
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = item?;
            out.push(from_bytes(&String::from_utf8_lossy(&key), &bytes)?);
        }
        Ok(out)
    }

    // ── Serialization helpers ─────────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(from_bytes(key, &bytes)?)),
            None => Ok(None),
        }
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        key: String::new(),
        detail: e.to_string(),
    })
}

fn from_bytes<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

fn key_meta(p: &Principal, sid: &str) -> String {
    format!("session:meta:{}:{sid}", p.to_hex())
}

fn key_messages(p: &Principal, sid: &str) -> String {
    format!("session:messages:{}:{sid}", p.to_hex())
}

fn key_user_sessions(p: &Principal) -> String {
    format!("user:sessions:{}", p.to_hex())
}

fn key_processed(event_id: &str) -> String {
    format!("event:processed:{event_id}")
}

fn key_balance(p: &Principal) -> String {
    format!("balance:{}", p.to_hex())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Classification, Direction};

    fn principal(byte: u8) -> Principal {
        Principal::from_bytes([byte; 32])
    }

    fn user_msg(text: &str, event_id: &str) -> MessageRecord {
        MessageRecord::user(text, event_id, 4)
    }

    #[test]
    fn append_creates_session_lazily() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(1);

        store
            .append_user_message(&p, "s1", user_msg("hello", "ev1"), SessionOrigin::Dm)
            .unwrap();

        let meta = store.session_meta(&p, "s1").unwrap().unwrap();
        assert_eq!(meta.message_count, 1);
        assert_eq!(meta.origin, SessionOrigin::Dm);
        assert_eq!(store.sessions_for(&p).unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn duplicate_event_id_is_rejected_once_claimed() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(1);

        store
            .append_user_message(&p, "s1", user_msg("hello", "ev1"), SessionOrigin::Dm)
            .unwrap();
        let err = store
            .append_user_message(&p, "s1", user_msg("hello again", "ev1"), SessionOrigin::Dm)
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateEvent(id) if id == "ev1"));
        assert_eq!(store.messages(&p, "s1", 100).unwrap().len(), 1);
    }

    #[test]
    fn processed_marker_records_session() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(2);
        store
            .append_user_message(&p, "s9", user_msg("x", "evX"), SessionOrigin::Public)
            .unwrap();

        assert!(store.is_processed("evX").unwrap());
        let marker = store.processed_marker("evX").unwrap().unwrap();
        assert_eq!(marker.session_id, "s9");
        assert!(!store.is_processed("evY").unwrap());
    }

    #[test]
    fn message_count_matches_log_length() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(3);

        for i in 0..5 {
            store
                .append_user_message(&p, "s1", user_msg("m", &format!("ev{i}")), SessionOrigin::Dm)
                .unwrap();
        }
        store
            .append_bot_message(
                &p,
                "s1",
                MessageRecord::bot("reply", Classification::Response),
                SessionOrigin::Dm,
            )
            .unwrap();

        let meta = store.session_meta(&p, "s1").unwrap().unwrap();
        let log = store.messages(&p, "s1", MESSAGE_LOG_CAP).unwrap();
        assert_eq!(meta.message_count as usize, log.len());
        assert_eq!(log.len(), 6);
    }

    #[test]
    fn log_is_capped_to_most_recent_entries() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(4);

        for i in 0..(MESSAGE_LOG_CAP + 25) {
            store
                .append_bot_message(
                    &p,
                    "s1",
                    MessageRecord::bot(format!("m{i}"), Classification::Response),
                    SessionOrigin::Dm,
                )
                .unwrap();
        }

        let log = store.messages(&p, "s1", MESSAGE_LOG_CAP + 100).unwrap();
        assert_eq!(log.len(), MESSAGE_LOG_CAP);
        // Oldest entries were dropped, newest kept.
        assert_eq!(log.last().unwrap().text, format!("m{}", MESSAGE_LOG_CAP + 24));
        assert_eq!(log.first().unwrap().text, "m25");
    }

    #[test]
    fn timestamps_are_non_decreasing() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(5);
        for i in 0..10 {
            store
                .append_user_message(&p, "s", user_msg("m", &format!("e{i}")), SessionOrigin::Dm)
                .unwrap();
        }
        let log = store.messages(&p, "s", 100).unwrap();
        for pair in log.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn every_session_is_indexed_for_its_principal() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(6);
        for sid in ["a", "b", "c"] {
            store
                .append_user_message(&p, sid, user_msg("m", &format!("ev-{sid}")), SessionOrigin::Dm)
                .unwrap();
        }
        let ids = store.sessions_for(&p).unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn all_messages_merges_sessions_sorted() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(7);
        store
            .append_user_message(&p, "s1", user_msg("first", "e1"), SessionOrigin::Dm)
            .unwrap();
        store
            .append_user_message(&p, "s2", user_msg("second", "e2"), SessionOrigin::Public)
            .unwrap();

        let merged = store.all_messages(&p, 100).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged[0].timestamp <= merged[1].timestamp);
    }

    // ── Balances ──────────────────────────────────────────────────────────────

    #[test]
    fn balance_defaults_to_zero() {
        let store = SessionStore::temporary().unwrap();
        assert_eq!(store.balance(&principal(8)).unwrap(), 0);
    }

    #[test]
    fn credit_then_equal_debit_restores_balance() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(8);
        store.credit(&p, 17).unwrap();

        assert_eq!(store.credit(&p, 50).unwrap(), 67);
        assert_eq!(store.debit(&p, 50).unwrap(), 17);
        assert_eq!(store.balance(&p).unwrap(), 17);
    }

    #[test]
    fn debit_below_zero_is_rejected() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(9);
        store.credit(&p, 1).unwrap();

        let err = store.debit(&p, 2).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { balance: 1, required: 2 }));
        assert_eq!(store.balance(&p).unwrap(), 1, "failed debit must not change the balance");
    }

    #[test]
    fn concurrent_credits_do_not_lose_updates() {
        // The racing double-receipt case: many threads crediting the same
        // principal must all land.
        let store = std::sync::Arc::new(SessionStore::temporary().unwrap());
        let p = principal(10);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    store.credit(&p, 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.balance(&p).unwrap(), 400);
    }

    #[test]
    fn concurrent_debits_never_go_negative() {
        let store = std::sync::Arc::new(SessionStore::temporary().unwrap());
        let p = principal(11);
        store.credit(&p, 10).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut ok = 0u32;
                for _ in 0..10 {
                    if store.debit(&p, 1).is_ok() {
                        ok += 1;
                    }
                }
                ok
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, 10, "exactly the funded number of debits may succeed");
        assert_eq!(store.balance(&p).unwrap(), 0);
    }

    // ── Receipts ──────────────────────────────────────────────────────────────

    #[test]
    fn receipts_round_trip_via_prefix_scan() {
        let store = SessionStore::temporary().unwrap();
        let p = principal(12);
        let receipt = ReceiptRecord {
            sender: p,
            amount_sats: 50,
            request_id: "req1".into(),
            receipt_event_id: "rcpt1".into(),
            invoice: "lnbc500n1...".into(),
            description: "{}".into(),
            received_at: 1700000000000,
        };
        store.record_receipt(&receipt).unwrap();

        let got = store.receipts_for(&p).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].amount_sats, 50);
        assert!(store.receipts_for(&principal(13)).unwrap().is_empty());
    }

    #[test]
    fn persisted_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let p = principal(14);
        {
            let store = SessionStore::open(dir.path()).unwrap();
            store
                .append_user_message(&p, "s1", user_msg("persisted", "e1"), SessionOrigin::Dm)
                .unwrap();
            store.flush().unwrap();
        }
        let store = SessionStore::open(dir.path()).unwrap();
        let log = store.messages(&p, "s1", 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "persisted");
        assert_eq!(log[0].direction, Direction::User);
    }
}
