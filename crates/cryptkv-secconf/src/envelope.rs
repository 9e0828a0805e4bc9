use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tracing::instrument;

use crate::key_material::KeyMaterial;

/// Envelope layout version written as the first decoded byte.
const ENVELOPE_V1: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecconfError {
    /// The keystore blob is not usable key material.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    /// The stored bytes are not an envelope this version understands.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// Authentication failed: wrong key material or tampered ciphertext.
    #[error("decrypt failed: wrong key material or corrupted value")]
    Decrypt,
}

/// Encrypt `value` into a text-safe envelope:
/// base64(`version | nonce | ciphertext+tag`).
#[instrument(skip_all, fields(len = value.len()))]
pub fn encode(value: &[u8], key: &KeyMaterial) -> Result<Vec<u8>, SecconfError> {
    let cipher = build_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, value)
        .map_err(|e| SecconfError::Encrypt(e.to_string()))?;

    let mut raw = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    raw.push(ENVELOPE_V1);
    raw.extend_from_slice(nonce.as_slice());
    raw.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(raw).into_bytes())
}

/// Reverse of [`encode`].
#[instrument(skip_all, fields(len = envelope.len()))]
pub fn decode(envelope: &[u8], key: &KeyMaterial) -> Result<Vec<u8>, SecconfError> {
    let raw = STANDARD
        .decode(trim_ascii(envelope))
        .map_err(|e| SecconfError::Malformed(format!("base64: {e}")))?;

    let (version, rest) = raw
        .split_first()
        .ok_or_else(|| SecconfError::Malformed("empty envelope".to_string()))?;
    if *version != ENVELOPE_V1 {
        return Err(SecconfError::Malformed(format!(
            "unsupported envelope version {version}"
        )));
    }
    if rest.len() < NONCE_LEN + TAG_LEN {
        return Err(SecconfError::Malformed(format!(
            "envelope too short: {} bytes",
            raw.len()
        )));
    }

    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let cipher = build_cipher(key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SecconfError::Decrypt)
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, SecconfError> {
    let key = material.cipher_key()?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| SecconfError::InvalidKey(e.to_string()))
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    let end = input
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &input[start..end]
}
