use cryptkv_core::StoreError;
use cryptkv_secconf::KeyMaterial;

/// Transform applied to values on their way into and out of a store.
pub trait ValueCodec: Send + Sync + 'static {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, StoreError>;

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>, StoreError>;

    /// Stored bytes this codec could never have produced, such as the empty
    /// parent nodes of a hierarchical store. `list` leaves them out.
    fn is_placeholder(&self, _stored: &[u8]) -> bool {
        false
    }
}

/// Identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl ValueCodec for Plaintext {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(value.to_vec())
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        Ok(stored)
    }
}

/// AES-GCM envelope keyed by keystore material read once at construction.
#[derive(Clone)]
pub struct Secconf {
    key: KeyMaterial,
}

impl Secconf {
    pub fn new(key: KeyMaterial) -> Self {
        Self { key }
    }
}

impl std::fmt::Debug for Secconf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secconf").finish_non_exhaustive()
    }
}

impl ValueCodec for Secconf {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        cryptkv_secconf::encode(value, &self.key).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        cryptkv_secconf::decode(&stored, &self.key).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn is_placeholder(&self, stored: &[u8]) -> bool {
        stored.is_empty()
    }
}
