//! Authenticated encryption for exchange API credentials.
//!
//! AES-256-GCM with a random 96-bit nonce packed in front of the
//! ciphertext. The key comes from the PULSE_SECURITY__ENCRYPTION_KEY
//! setting (base64, 32 bytes decoded).
//!
//! Hard rules:
//!  - decrypted values never reach logs, errors, or metrics
//!  - plaintext lives only inside the calling scope, dropped right after use

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use rand::RngCore;

use crate::error::{PulseError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Credential cipher. Cheap to clone; the key is a fixed array.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material, even in debug output.
        f.write_str("Cipher { key: [redacted] }")
    }
}

impl Cipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let trimmed = key_b64.trim();
        if trimmed.is_empty() {
            return Err(PulseError::Config(
                "encryption key is not set — generate one with \
                 `head -c 32 /dev/urandom | base64`"
                    .to_string(),
            ));
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .map_err(|e| PulseError::Config(format!("encryption key is not valid base64: {e}")))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| PulseError::Config("encryption key must decode to 32 bytes".to_string()))?;
        Ok(Self { key })
    }

    /// Encrypt a non-empty plaintext. Returns nonce || ciphertext+tag.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Err(PulseError::Cipher("refusing to encrypt empty plaintext".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| PulseError::Cipher("invalid key length".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| PulseError::Cipher("encryption failed".to_string()))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(packed)
    }

    /// Decrypt nonce || ciphertext+tag back to the plaintext.
    ///
    /// Corrupted or truncated input, or a changed key, is a contract error.
    /// The caller must drop the returned value before leaving its scope.
    pub fn decrypt(&self, packed: &[u8]) -> Result<String> {
        if packed.len() < NONCE_LEN + TAG_LEN {
            return Err(PulseError::Cipher("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| PulseError::Cipher("invalid key length".to_string()))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| PulseError::Cipher("decryption failed — key changed or data corrupted".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| PulseError::Cipher("decrypted bytes are not valid UTF-8".to_string()))
    }
}

/// Replace every occurrence of each secret in `text` with `[redacted]`.
///
/// Used on error text from exchange clients before it is surfaced anywhere,
/// so a credential embedded in a vendor error message cannot leak.
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if !secret.is_empty() && out.contains(secret) {
            out = out.replace(secret, "[redacted]");
        }
    }
    out
}
