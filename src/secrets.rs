//! Encryption at rest for stored request headers.
//!
//! Header maps that carry credentials are sealed with AES-256-GCM under a
//! key derived from the deployment secret; everything else is stored as
//! plain JSON. Reads are transparent either way.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// AES-256-GCM with a 16-byte random nonce per record.
type HeaderAead = AesGcm<Aes256, U16>;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;
const MIN_SECRET_LEN: usize = 32;

/// Header names that force encryption of the whole map, matched
/// case-insensitively anywhere in the name.
const SENSITIVE_NAME_PATTERN: &str = r"(?i)(api[-_]?key|authorization|token|secret|password|auth)";

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Encryption secret must be at least {MIN_SECRET_LEN} characters, got {length}")]
    SecretTooShort { length: usize },

    #[error("Malformed encrypted header record: {reason}")]
    Malformed { reason: String },

    #[error("Header record failed authentication")]
    Authentication,

    #[error("Header serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SecretsError>;

pub type HeaderMap = BTreeMap<String, String>;

/// Seals and opens stored header maps. One instance per process; the key
/// is derived once from the deployment secret.
pub struct HeaderCipher {
    cipher: HeaderAead,
    sensitive: Regex,
}

impl HeaderCipher {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SecretsError::SecretTooShort {
                length: secret.len(),
            });
        }

        let key = Sha256::digest(secret.as_bytes());
        let cipher = HeaderAead::new_from_slice(&key).expect("SHA-256 output is a valid AES-256 key");
        let sensitive =
            Regex::new(SENSITIVE_NAME_PATTERN).expect("sensitive-header pattern is valid");

        Ok(Self { cipher, sensitive })
    }

    pub fn is_sensitive_name(&self, name: &str) -> bool {
        self.sensitive.is_match(name)
    }

    /// Serializes a header map for storage, encrypting when any name
    /// matches the sensitivity pattern. Returns `None` for an empty map.
    pub fn seal(&self, headers: &HeaderMap) -> Result<Option<String>> {
        if headers.is_empty() {
            return Ok(None);
        }

        let canonical = serde_json::to_string(headers)?;
        if !headers.keys().any(|name| self.is_sensitive_name(name)) {
            return Ok(Some(canonical));
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), canonical.as_bytes())
            .map_err(|_| SecretsError::Authentication)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(Some(format!(
            "{}:{}:{}",
            BASE64_STANDARD.encode(nonce),
            BASE64_STANDARD.encode(tag),
            BASE64_STANDARD.encode(ciphertext)
        )))
    }

    /// Recovers a header map from its stored form. `None` in, `None` out:
    /// absent headers are not an error, unlike a record that fails to
    /// decode or authenticate.
    pub fn open(&self, stored: Option<&str>) -> Result<Option<HeaderMap>> {
        let Some(stored) = stored else {
            return Ok(None);
        };

        if stored.trim_start().starts_with('{') {
            let headers: HeaderMap = serde_json::from_str(stored)?;
            return Ok(Some(headers));
        }

        let parts: Vec<&str> = stored.split(':').collect();
        if parts.len() != 3 {
            return Err(SecretsError::Malformed {
                reason: format!("expected 3 segments, got {}", parts.len()),
            });
        }

        let nonce = BASE64_STANDARD
            .decode(parts[0])
            .map_err(|e| SecretsError::Malformed {
                reason: format!("nonce: {e}"),
            })?;
        let tag = BASE64_STANDARD
            .decode(parts[1])
            .map_err(|e| SecretsError::Malformed {
                reason: format!("tag: {e}"),
            })?;
        let ciphertext = BASE64_STANDARD
            .decode(parts[2])
            .map_err(|e| SecretsError::Malformed {
                reason: format!("ciphertext: {e}"),
            })?;

        if nonce.len() != NONCE_LEN {
            return Err(SecretsError::Malformed {
                reason: format!("nonce must be {NONCE_LEN} bytes, got {}", nonce.len()),
            });
        }
        if tag.len() != TAG_LEN {
            return Err(SecretsError::Malformed {
                reason: format!("tag must be {TAG_LEN} bytes, got {}", tag.len()),
            });
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| SecretsError::Authentication)?;

        let headers: HeaderMap = serde_json::from_slice(&plaintext)?;
        Ok(Some(headers))
    }
}
