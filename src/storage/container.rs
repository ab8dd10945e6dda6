//! An encrypted container for key bytes protected by the storage secret.

use crate::common::utils::{decode_b64, encode_b64, random_bytes};
use crate::error::StorageError;
use crate::symmetric::aes_gcm;
use crate::symmetric::kdf::{self, SALT_SIZE};
use chrono::Utc;
use secrecy::SecretBox;
use serde::{Deserialize, Serialize};

const CONTAINER_FORMAT_VERSION: u32 = 1;
const STORAGE_KEY_INFO: &[u8] = b"seal-keyring/key-store/v1";

/// An encrypted container for storing key bytes at rest.
///
/// A per-container wrapping key is expanded from the storage secret with
/// HKDF-SHA256 over a random salt, and the key bytes are sealed with
/// AES-256-GCM. The key id is bound as associated data, so a container
/// copied under a different id does not open.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EncryptedKeyContainer {
    /// Container layout version.
    format_version: u32,

    /// Base64-encoded salt used for HKDF.
    salt: String,

    /// Base64-encoded `nonce || tag || ciphertext`.
    encrypted_data: String,

    /// Creation timestamp in RFC 3339 format.
    created_at: String,
}

impl EncryptedKeyContainer {
    /// Seals `key_data` for `key_id` under the storage secret.
    pub fn seal(
        storage_secret: &[u8],
        key_id: &str,
        key_data: &[u8],
    ) -> Result<Self, StorageError> {
        let salt = random_bytes(SALT_SIZE).map_err(|e| StorageError::Crypto(e.to_string()))?;
        let wrapping_key = kdf::derive_from_secret(storage_secret, &salt, STORAGE_KEY_INFO)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let sealed = aes_gcm::seal_combined(wrapping_key.as_slice(), key_data, key_id.as_bytes())
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        Ok(Self {
            format_version: CONTAINER_FORMAT_VERSION,
            salt: encode_b64(&salt),
            encrypted_data: encode_b64(&sealed),
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// Opens the container and returns the key bytes.
    pub fn open(
        &self,
        storage_secret: &[u8],
        key_id: &str,
    ) -> Result<SecretBox<[u8]>, StorageError> {
        if self.format_version != CONTAINER_FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported container version {}",
                self.format_version
            )));
        }
        let salt = decode_b64(&self.salt).map_err(|e| StorageError::Corrupted(e.to_string()))?;
        let sealed =
            decode_b64(&self.encrypted_data).map_err(|e| StorageError::Corrupted(e.to_string()))?;

        let wrapping_key = kdf::derive_from_secret(storage_secret, &salt, STORAGE_KEY_INFO)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        let key_data = aes_gcm::open_combined(wrapping_key.as_slice(), &sealed, key_id.as_bytes())
            .map_err(|e| StorageError::Corrupted(format!("container for {key_id}: {e}")))?;

        Ok(SecretBox::new(key_data.into_boxed_slice()))
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Serializes the container to a JSON string.
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a container from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SECRET: &[u8] = b"storage-level-secret";

    #[test]
    fn encrypted_container_roundtrip() -> Result<(), StorageError> {
        let key_data = [0x5au8; 32];
        let container = EncryptedKeyContainer::seal(SECRET, "key-1", &key_data)?;
        let opened = container.open(SECRET, "key-1")?;
        assert_eq!(opened.expose_secret(), &key_data);
        assert!(!container.created_at().is_empty());
        Ok(())
    }

    #[test]
    fn json_serialization_roundtrip() -> Result<(), StorageError> {
        let key_data = b"another-secret-of-some-length!!!";
        let container = EncryptedKeyContainer::seal(SECRET, "key-2", key_data)?;
        let json = container.to_json()?;
        assert!(!json.contains("another-secret"));

        let restored = EncryptedKeyContainer::from_json(&json)?;
        assert_eq!(restored.salt, container.salt);
        assert_eq!(
            restored.open(SECRET, "key-2")?.expose_secret(),
            b"another-secret-of-some-length!!!"
        );
        Ok(())
    }

    #[test]
    fn wrong_secret_or_id_fails() -> Result<(), StorageError> {
        let container = EncryptedKeyContainer::seal(SECRET, "key-3", &[1u8; 32])?;
        assert!(matches!(
            container.open(b"wrong-secret", "key-3"),
            Err(StorageError::Corrupted(_))
        ));
        assert!(matches!(
            container.open(SECRET, "key-4"),
            Err(StorageError::Corrupted(_))
        ));
        Ok(())
    }

    #[test]
    fn unknown_format_version_is_rejected() -> Result<(), StorageError> {
        let mut container = EncryptedKeyContainer::seal(SECRET, "key-5", &[1u8; 32])?;
        container.format_version = 99;
        assert!(matches!(
            container.open(SECRET, "key-5"),
            Err(StorageError::Corrupted(_))
        ));
        Ok(())
    }
}
