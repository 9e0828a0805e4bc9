//! The ciphertext envelope used to keep configuration values encrypted at rest.
//! Uses AES-GCM with key material sourced from a keystore file, the OS keyring,
//! or memory (tests).

pub mod envelope;
pub mod key_material;
pub mod key_provider;

pub use envelope::{decode, encode, SecconfError};
pub use key_material::KeyMaterial;
pub use key_provider::{FileKeyProvider, InMemoryKeyProvider, KeyError, KeyProvider, KeyringProvider};
