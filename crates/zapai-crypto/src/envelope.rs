// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Envelope encryption for private messages.
//!
//! ChaCha20-Poly1305 AEAD under a conversation key derived from ECDH on the
//! network curve + HKDF-SHA256.  The conversation key is symmetric between
//! the two parties, so the same derivation opens envelopes in either
//! direction.  Wire form: `base64(nonce ‖ ciphertext‖tag)`.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::{ecdh, Parity, PublicKey, SecretKey, XOnlyPublicKey};
use sha2::Sha256;
use zeroize::Zeroize;

use zapai_proto::Principal;

use crate::error::CryptoError;

const HKDF_SALT: &[u8] = b"zapai-envelope-hkdf-salt-v1";
const HKDF_INFO: &[u8] = b"zapai-envelope-v1";
const NONCE_SIZE: usize = 12;

/// Derive the symmetric conversation key for `(secret, peer)`.
///
/// Uses the x coordinate of the ECDH point; principals are x-only keys, and
/// lifting with even parity on both sides yields the same point up to
/// negation, which shares the x coordinate.
pub fn conversation_key(secret: &SecretKey, peer: &Principal) -> Result<[u8; 32], CryptoError> {
    let xonly = XOnlyPublicKey::from_slice(peer.as_bytes())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let full = PublicKey::from_x_only_public_key(xonly, Parity::Even);

    let mut point = ecdh::shared_secret_point(&full, secret);
    let mut shared_x = [0u8; 32];
    shared_x.copy_from_slice(&point[..32]);
    point.zeroize();

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &shared_x);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    shared_x.zeroize();
    Ok(key)
}

/// Seal plaintext under a conversation key.
pub fn seal(key: &[u8; 32], plaintext: &str) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(payload))
}

/// Open a sealed payload under a conversation key.
pub fn open(key: &[u8; 32], payload: &str) -> Result<String, CryptoError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| CryptoError::MalformedPayload(e.to_string()))?;
    if raw.len() <= NONCE_SIZE {
        return Err(CryptoError::MalformedPayload(format!(
            "payload too short: {} bytes",
            raw.len()
        )));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|e| CryptoError::Decryption(e.to_string()))
}
