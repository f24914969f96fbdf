// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable bot state on an embedded ordered key/value store.
//!
//! Everything the bot must remember across restarts lives here: session
//! metadata, append-only message logs, the processed-event set, per-user
//! balances and receipt records.  All mutation goes through compare-and-swap
//! loops so concurrent workers cannot lose updates.

mod error;
mod store;
mod types;

pub use error::StoreError;
pub use store::{SessionStore, MESSAGE_LOG_CAP};
pub use types::{
    now_millis, BalanceRecord, Classification, Direction, MessageRecord, ProcessedMarker,
    ReceiptRecord, SessionMeta, SessionOrigin,
};
