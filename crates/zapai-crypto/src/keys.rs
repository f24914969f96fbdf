// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The bot's long-lived identity keypair.
//!
//! Accepted input forms for `BOT_PRIVATE_KEY`:
//! - 64 hex characters (raw 32-byte secret key)
//! - `nsec1…` — the network's bech32 secret-key encoding

use bech32::FromBase32;
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use zeroize::Zeroize;

use zapai_proto::Principal;

use crate::error::CryptoError;

/// The bot's identity keypair on the network's curve.
pub struct BotKeys {
    keypair: Keypair,
    public: Principal,
}

impl std::fmt::Debug for BotKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotKeys")
            .field("public", &self.public.to_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl BotKeys {
    /// Parse a secret key from either hex or `nsec1…` form.
    pub fn parse(input: &str) -> Result<Self, CryptoError> {
        let trimmed = input.trim();
        if trimmed.starts_with("nsec1") {
            Self::from_nsec(trimmed)
        } else {
            Self::from_hex(trimmed)
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(hex_key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let result = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        result
    }

    pub fn from_nsec(nsec: &str) -> Result<Self, CryptoError> {
        let (hrp, data, _variant) =
            bech32::decode(nsec).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if hrp != "nsec" {
            return Err(CryptoError::InvalidKey(format!("expected nsec prefix, got {hrp}")));
        }
        let mut bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let result = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        result
    }

    fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let secp = Secp256k1::new();
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        Ok(Self {
            keypair,
            public: Principal::from_bytes(xonly.serialize()),
        })
    }

    /// Generate a fresh random keypair.  Used by tests and first-run tooling.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, _public) = secp.generate_keypair(&mut rand::thread_rng());
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        Self {
            keypair,
            public: Principal::from_bytes(xonly.serialize()),
        }
    }

    pub fn public_key(&self) -> Principal {
        self.public
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub(crate) fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bech32::ToBase32;

    const SECRET_HEX: &str = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";

    #[test]
    fn hex_key_parses_and_derives_public() {
        let keys = BotKeys::parse(SECRET_HEX).unwrap();
        assert_eq!(keys.public_key().to_hex().len(), 64);
    }

    #[test]
    fn nsec_and_hex_forms_agree() {
        let bytes = hex::decode(SECRET_HEX).unwrap();
        let nsec =
            bech32::encode("nsec", bytes.to_base32(), bech32::Variant::Bech32).unwrap();
        let from_hex = BotKeys::parse(SECRET_HEX).unwrap();
        let from_nsec = BotKeys::parse(&nsec).unwrap();
        assert_eq!(from_hex.public_key(), from_nsec.public_key());
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let bytes = hex::decode(SECRET_HEX).unwrap();
        let npub = bech32::encode("npub", bytes.to_base32(), bech32::Variant::Bech32).unwrap();
        assert!(matches!(BotKeys::parse(&npub), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn short_hex_is_rejected() {
        assert!(BotKeys::parse("abcdef").is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let keys = BotKeys::generate();
        let dbg = format!("{keys:?}");
        assert!(dbg.contains("REDACTED"));
    }
}
