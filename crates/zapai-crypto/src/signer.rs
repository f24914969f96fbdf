// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The [`Signer`] trait and its implementations.

use secp256k1::{All, Message, Secp256k1};

use zapai_proto::{compute_event_id, Event, EventDraft, Principal};

use crate::{envelope, error::CryptoError, keys::BotKeys};

/// Holder of the bot's secret key.
///
/// Signs event envelopes and seals/opens private-message content.  All
/// operations are CPU-bound and cheap, so the trait is synchronous; callers
/// invoke it inline from async tasks.
pub trait Signer: Send + Sync {
    /// The bot's public identity.
    fn public_key(&self) -> Principal;

    /// Compute the content-addressed id and signature, producing the final
    /// immutable event.
    fn sign(&self, draft: EventDraft) -> Result<Event, CryptoError>;

    /// Seal plaintext for a private message to `peer`.
    fn encrypt_to(&self, peer: &Principal, plaintext: &str) -> Result<String, CryptoError>;

    /// Open the sealed content of a private message from `peer`.
    fn decrypt_from(&self, peer: &Principal, payload: &str) -> Result<String, CryptoError>;
}

/// In-process signer backed by [`BotKeys`].
pub struct LocalSigner {
    keys: BotKeys,
    secp: Secp256k1<All>,
}

impl LocalSigner {
    pub fn new(keys: BotKeys) -> Self {
        Self { keys, secp: Secp256k1::new() }
    }
}

impl Signer for LocalSigner {
    fn public_key(&self) -> Principal {
        self.keys.public_key()
    }

    fn sign(&self, draft: EventDraft) -> Result<Event, CryptoError> {
        let pubkey = self.keys.public_key();
        let id = compute_event_id(&pubkey, &draft);

        let mut digest = [0u8; 32];
        hex::decode_to_slice(&id, &mut digest)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let msg = Message::from_digest(digest);
        let sig = self.secp.sign_schnorr(&msg, self.keys.keypair());

        Ok(Event {
            id,
            pubkey,
            created_at: draft.created_at,
            kind: draft.kind,
            tags: draft.tags,
            content: draft.content,
            sig: hex::encode(sig.serialize()),
        })
    }

    fn encrypt_to(&self, peer: &Principal, plaintext: &str) -> Result<String, CryptoError> {
        let key = envelope::conversation_key(&self.keys.secret_key(), peer)?;
        envelope::seal(&key, plaintext)
    }

    fn decrypt_from(&self, peer: &Principal, payload: &str) -> Result<String, CryptoError> {
        let key = envelope::conversation_key(&self.keys.secret_key(), peer)?;
        envelope::open(&key, payload)
    }
}

/// Signer without cryptography: the "ciphertext" is the plaintext and the
/// signature is a fixed placeholder.  Lets integration tests assert on
/// message content without deriving keys per test peer.
#[cfg(any(test, feature = "test-utils"))]
pub struct PlainSigner {
    public: Principal,
}

#[cfg(any(test, feature = "test-utils"))]
impl PlainSigner {
    pub fn new(public: Principal) -> Self {
        Self { public }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Signer for PlainSigner {
    fn public_key(&self) -> Principal {
        self.public
    }

    fn sign(&self, draft: EventDraft) -> Result<Event, CryptoError> {
        let id = compute_event_id(&self.public, &draft);
        Ok(Event {
            id,
            pubkey: self.public,
            created_at: draft.created_at,
            kind: draft.kind,
            tags: draft.tags,
            content: draft.content,
            sig: "00".repeat(64),
        })
    }

    fn encrypt_to(&self, _peer: &Principal, plaintext: &str) -> Result<String, CryptoError> {
        Ok(plaintext.to_string())
    }

    fn decrypt_from(&self, _peer: &Principal, payload: &str) -> Result<String, CryptoError> {
        Ok(payload.to_string())
    }
}
