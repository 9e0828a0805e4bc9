use std::io::Read;

use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};

use crate::{envelope::SecconfError, key_provider::KeyError};

const KEY_LEN: usize = 32;

/// Secret input for [`crate::encode`] and [`crate::decode`].
///
/// Held as the raw keystore blob and re-parsed on every use; the accepted
/// format is a standard base64 encoding of a 256-bit key, surrounding
/// whitespace ignored.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    blob: Vec<u8>,
}

impl KeyMaterial {
    pub fn from_bytes(blob: impl Into<Vec<u8>>) -> Self {
        Self { blob: blob.into() }
    }

    /// Read the whole keystore from `reader`.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, KeyError> {
        let mut blob = Vec::new();
        reader
            .read_to_end(&mut blob)
            .map_err(|e| KeyError::Io(e.to_string()))?;
        Ok(Self { blob })
    }

    /// Fresh random key material in keystore format.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self {
            blob: general_purpose::STANDARD.encode(bytes).into_bytes(),
        }
    }

    /// The keystore blob exactly as read. Never log this.
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub(crate) fn cipher_key(&self) -> Result<[u8; KEY_LEN], SecconfError> {
        let text = std::str::from_utf8(&self.blob)
            .map_err(|_| SecconfError::InvalidKey("keystore is not valid utf-8".into()))?;
        let bytes = general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| SecconfError::InvalidKey(e.to_string()))?;

        if bytes.len() != KEY_LEN {
            return Err(SecconfError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.blob.len())
            .finish_non_exhaustive()
    }
}
