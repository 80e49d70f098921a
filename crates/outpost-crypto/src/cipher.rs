use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::ChaCha20Poly1305;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha3::Sha3_256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// PBKDF2 iterations for config-domain key derivation.
const PBKDF2_ROUNDS: u32 = 10_000;

/// Both AEADs take a 256-bit key and a 96-bit nonce.
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

// IMPORTANT: replace with a build-time secret in production packaging.
const APP_SECRET: &[u8] = b"outpost-config-secret-v1-change-in-production";

/// Errors produced by cipher construction and envelope operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Malformed or mis-sized key material at cipher construction.
    #[error("invalid key material: {reason}")]
    Key { reason: String },
    /// Malformed transport encoding for key bytes.
    #[error("malformed key encoding: {reason}")]
    Format { reason: String },
    /// Envelope failed authentication. Covers tampering, truncation, wrong
    /// key, and envelopes produced by the other domain; callers must not be
    /// able to tell these apart.
    #[error("envelope authentication failed")]
    Auth,
    /// The seal path failed (entropy source or AEAD fault). Fatal.
    #[error("envelope seal failed: {reason}")]
    Seal { reason: String },
}

/// Server-issued 256-bit key for the database domain. Held in memory only;
/// zeroed on drop.
#[derive(Clone)]
pub struct ServerKey([u8; KEY_LEN]);

impl ServerKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Accept raw key bytes; anything other than exactly 32 bytes is refused.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::Key {
                reason: format!("server key must be {KEY_LEN} bytes, got {}", bytes.len()),
            });
        }
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Decode a key from its base64 transport form.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let mut bytes = STANDARD.decode(text).map_err(|e| CryptoError::Format {
            reason: e.to_string(),
        })?;
        if bytes.len() != KEY_LEN {
            bytes.zeroize();
            return Err(CryptoError::Format {
                reason: format!("expected {KEY_LEN} decoded bytes"),
            });
        }
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Encode the key for transport.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl Drop for ServerKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerKey(..)")
    }
}

/// Config-domain cipher: AES-256-GCM keyed by PBKDF2-HMAC-SHA3-256 over the
/// application secret with the machine fingerprint as salt. Rotating the
/// application secret invalidates every existing config envelope everywhere.
pub struct ConfigCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ConfigCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCipher").finish_non_exhaustive()
    }
}

impl ConfigCipher {
    pub fn new(fingerprint: &str) -> Result<Self, CryptoError> {
        if fingerprint.is_empty() {
            return Err(CryptoError::Key {
                reason: "machine fingerprint cannot be empty".to_string(),
            });
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha3_256>(
            APP_SECRET,
            fingerprint.as_bytes(),
            PBKDF2_ROUNDS,
            key.as_mut_slice(),
        );

        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|e| CryptoError::Key {
            reason: e.to_string(),
        })?;
        Ok(Self { cipher })
    }

    /// Seal plaintext into a `base64(nonce || ciphertext || tag)` envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Seal {
                reason: e.to_string(),
            })?;
        Ok(encode_envelope(nonce.as_slice(), &ciphertext))
    }

    /// Open an envelope sealed by this machine's config cipher.
    pub fn open(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let (nonce, ciphertext) = split_envelope(envelope)?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Auth)
    }
}

/// Database-domain cipher: ChaCha20-Poly1305 keyed directly by a server-issued
/// secret. Deliberately machine-independent and a different AEAD family than
/// the config domain, so envelopes can never cross-decrypt.
pub struct DatabaseCipher {
    cipher: ChaCha20Poly1305,
}

impl DatabaseCipher {
    pub fn new(key: ServerKey) -> Result<Self, CryptoError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&key.0).map_err(|e| CryptoError::Key {
                reason: e.to_string(),
            })?;
        Ok(Self { cipher })
    }

    /// Seal plaintext into a `base64(nonce || ciphertext || tag)` envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Seal {
                reason: e.to_string(),
            })?;
        Ok(encode_envelope(nonce.as_slice(), &ciphertext))
    }

    /// Open an envelope sealed under the same server key.
    pub fn open(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let (nonce, ciphertext) = split_envelope(envelope)?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Auth)
    }
}

fn encode_envelope(nonce: &[u8], ciphertext: &[u8]) -> String {
    let mut raw = Vec::with_capacity(nonce.len() + ciphertext.len());
    raw.extend_from_slice(nonce);
    raw.extend_from_slice(ciphertext);
    STANDARD.encode(raw)
}

/// Decode an envelope and split off the nonce. Every malformation maps to
/// `Auth` so decode failures and tag failures are indistinguishable.
fn split_envelope(envelope: &str) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let raw = STANDARD.decode(envelope).map_err(|_| CryptoError::Auth)?;
    if raw.len() < NONCE_LEN {
        return Err(CryptoError::Auth);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    Ok((nonce.to_vec(), ciphertext.to_vec()))
}
