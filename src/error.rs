//! Defines the custom error types for the `seal-keyring` crate.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by the key store backing medium.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key material too short: expected at least {min} bytes, got {len}")]
    KeyTooShort { len: usize, min: usize },

    #[error("invalid key id: {0:?}")]
    InvalidKeyId(String),

    #[error("stored key data is corrupted: {0}")]
    Corrupted(String),

    #[error("key store cryptography failed: {0}")]
    Crypto(String),

    #[error("key container serialization failed")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The main error type for the `seal-keyring` crate.
///
/// Every failure kind is a distinct variant so callers can match on it
/// instead of inspecting messages. No variant ever carries key material.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key not found: {0}")]
    KeyNotFound(Uuid),

    #[error("Key is disabled: {0}")]
    KeyDisabled(Uuid),

    #[error("an active key already exists: {0}")]
    ActiveKeyExists(Uuid),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("re-encryption from key {old_key_id} to key {new_key_id} failed")]
    KeyRotation {
        old_key_id: Uuid,
        new_key_id: Uuid,
        #[source]
        source: Box<Error>,
    },

    #[error("key store error: {0}")]
    Storage(#[from] StorageError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("key manager has been shut down")]
    ShutDown,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "async")]
    #[error("async task failed: {0}")]
    AsyncTask(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns the innermost error, looking through `KeyRotation` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::KeyRotation { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_error_exposes_root_cause() {
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let err = Error::KeyRotation {
            old_key_id: old,
            new_key_id: new,
            source: Box::new(Error::KeyDisabled(old)),
        };
        assert!(matches!(err.root_cause(), Error::KeyDisabled(id) if *id == old));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn disabled_message_is_stable() {
        let id = Uuid::nil();
        assert_eq!(
            Error::KeyDisabled(id).to_string(),
            format!("Key is disabled: {id}")
        );
    }

    #[test]
    fn storage_message_includes_cause() {
        let err = Error::from(StorageError::KeyTooShort { len: 1, min: 32 });
        let message = err.to_string();
        assert!(message.starts_with("key store error: "));
        assert!(message.contains("too short"));
    }
}
