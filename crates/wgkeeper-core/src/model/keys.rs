// ── WireGuard key material ──

use base64::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CoreError;

const KEY_LEN: usize = 32;

/// An X25519 keypair in WireGuard's base64 encoding.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub public: String,
    pub private: SecretString,
}

impl Keypair {
    pub fn generate() -> Self {
        let private = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&private);
        Self {
            public: BASE64_STANDARD.encode(public.as_bytes()),
            private: SecretString::from(BASE64_STANDARD.encode(private.to_bytes())),
        }
    }
}

/// A preshared key must be base64 of exactly 32 bytes.
pub fn validate_preshared_key(psk: &SecretString) -> Result<(), CoreError> {
    let decoded = BASE64_STANDARD
        .decode(psk.expose_secret().trim())
        .map_err(|_| CoreError::validation("preshared key is not valid base64"))?;
    if decoded.len() != KEY_LEN {
        return Err(CoreError::validation(format!(
            "preshared key must decode to {KEY_LEN} bytes, got {}",
            decoded.len()
        )));
    }
    Ok(())
}
