//! Key records, key status and encrypted payloads.

use crate::common::utils::base64_bytes;
use crate::error::Error;
use chrono::{DateTime, Utc};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

/// Cipher suite tag recorded on every key.
pub const KEY_ALGORITHM: &str = "AES-256-GCM";

/// Minimum length of any stored key material, in bytes.
pub const MIN_KEY_LENGTH: usize = 32;

/// 密钥状态
///
/// `Active -> Enabled -> Disabled -> Deleted`，仅由 `rotate_keys` 推进。
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyStatus {
    /// 当前用于新加密的唯一密钥
    Active,
    /// 已退役，仅用于解密旧数据
    Enabled,
    /// 解密能力已被撤销，仅保留用于审计
    Disabled,
    /// 记录和密钥材料均已删除
    Deleted,
}

impl KeyStatus {
    /// Whether payloads encrypted under a key in this state may be decrypted.
    pub fn can_decrypt(self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Enabled)
    }
}

/// Newtype around raw key bytes so they can live inside a `SecretBox`.
#[derive(Clone, Zeroize)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// 允许包含此 newtype 的 SecretBox 被克隆。
impl CloneableSecret for KeyMaterial {}

/// 密钥元数据，即 `KeyRecord` 中可以持久化的非秘密部分
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyMetadata {
    pub id: Uuid,
    pub algorithm: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: KeyStatus,
    pub status_since: DateTime<Utc>,
}

/// A versioned symmetric key.
///
/// The key material is kept in a `SecretBox`, so `Debug` output is redacted.
#[derive(Clone, Debug)]
pub struct KeyRecord {
    pub id: Uuid,
    pub algorithm: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Advisory: `created_at + rotation_interval`.
    pub expires_at: DateTime<Utc>,
    pub status: KeyStatus,
    /// Time of the last status transition.
    pub status_since: DateTime<Utc>,
    key_material: SecretBox<KeyMaterial>,
}

impl KeyRecord {
    pub(crate) fn from_parts(metadata: KeyMetadata, key_material: SecretBox<KeyMaterial>) -> Self {
        Self {
            id: metadata.id,
            algorithm: metadata.algorithm,
            version: metadata.version,
            created_at: metadata.created_at,
            expires_at: metadata.expires_at,
            status: metadata.status,
            status_since: metadata.status_since,
            key_material,
        }
    }

    pub fn metadata(&self) -> KeyMetadata {
        KeyMetadata {
            id: self.id,
            algorithm: self.algorithm.clone(),
            version: self.version,
            created_at: self.created_at,
            expires_at: self.expires_at,
            status: self.status,
            status_since: self.status_since,
        }
    }

    pub fn key_material(&self) -> &SecretBox<KeyMaterial> {
        &self.key_material
    }

    pub(crate) fn material_bytes(&self) -> &[u8] {
        self.key_material.expose_secret().as_bytes()
    }

    pub(crate) fn with_status(&self, status: KeyStatus, since: DateTime<Utc>) -> Self {
        let mut record = self.clone();
        record.status = status;
        record.status_since = since;
        record
    }
}

/// The output of an encryption. Immutable once produced; re-encryption
/// yields a new payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub key_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    /// Key version at encryption time, informational only.
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl EncryptedPayload {
    /// Serializes the payload to a JSON string, e.g. for a metadata sidecar.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a payload from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}
