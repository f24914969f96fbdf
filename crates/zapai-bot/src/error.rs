// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The pipeline's sum-typed failure.
//!
//! Every processing failure carries a [`FailKind`]; the work queue's retry
//! policy inspects the kind, not the message.

use thiserror::Error;

use zapai_crypto::CryptoError;
use zapai_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// Relay or AI connectivity trouble; worth retrying.
    TransientNetwork,
    /// The remote answered and said no; retrying won't change its mind.
    RemoteRejected,
    /// Undecryptable envelope, unparseable payload, empty content.
    ProtocolMalformed,
    /// Queue full, rate limited, breaker open.
    Overloaded,
    /// Pre-debit balance check failed.
    InsufficientFunds,
    /// Store I/O failure or broken invariant.
    Internal,
}

#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {detail}")]
pub struct ProcessError {
    pub kind: FailKind,
    pub detail: String,
}

impl ProcessError {
    pub fn new(kind: FailKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(FailKind::TransientNetwork, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(FailKind::ProtocolMalformed, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(FailKind::Internal, detail)
    }

    /// Malformed input stays malformed and an unfunded user stays unfunded;
    /// everything else may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, FailKind::ProtocolMalformed | FailKind::InsufficientFunds)
    }
}

impl From<StoreError> for ProcessError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientFunds { balance, required } => Self::new(
                FailKind::InsufficientFunds,
                format!("balance {balance}, required {required}"),
            ),
            StoreError::DuplicateEvent(id) => {
                Self::new(FailKind::ProtocolMalformed, format!("event {id} already processed"))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for ProcessError {
    fn from(e: CryptoError) -> Self {
        Self::malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!ProcessError::malformed("x").is_retryable());
        assert!(!ProcessError::new(FailKind::InsufficientFunds, "x").is_retryable());
        assert!(ProcessError::transient("x").is_retryable());
        assert!(ProcessError::internal("x").is_retryable());
        assert!(ProcessError::new(FailKind::Overloaded, "x").is_retryable());
    }

    #[test]
    fn store_errors_map_to_kinds() {
        let e: ProcessError = StoreError::InsufficientFunds { balance: 1, required: 2 }.into();
        assert_eq!(e.kind, FailKind::InsufficientFunds);

        let e: ProcessError = StoreError::DuplicateEvent("abc".into()).into();
        assert_eq!(e.kind, FailKind::ProtocolMalformed);
    }
}
