// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] sled::Error),

    #[error("corrupt record at {key}: {detail}")]
    Corrupt { key: String, detail: String },

    #[error("event {0} already processed")]
    DuplicateEvent(String),

    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: u64, required: u64 },
}
