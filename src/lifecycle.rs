//! 密钥生命周期管理器
//!
//! `KeyLifecycleManager` 独占密钥表：创建密钥、按策略推进
//! `Active -> Enabled -> Disabled -> Deleted` 状态机，并使用当前或历史密钥
//! 执行认证加解密。
//!
//! 读取通过 `ArcSwap` 快照无锁进行；所有修改在同一把写锁下
//! “克隆 - 持久化 - 替换”，因此读者永远不会看到半完成的状态转换。
use crate::common::config::{ConfigFile, DeletionPolicy, KdfConfig, RotationPolicy};
use crate::common::traits::KeyStorage;
use crate::common::types::{
    EncryptedPayload, KEY_ALGORITHM, KeyMaterial, KeyMetadata, KeyRecord, KeyStatus,
};
use crate::common::utils::{base64_bytes, random_bytes};
use crate::error::{Error, StorageError};
use crate::symmetric::aes_gcm::{self, KEY_SIZE};
use crate::symmetric::kdf::{self, SALT_SIZE};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

const ENVELOPE_FORMAT_VERSION: u32 = 1;

/// Outcome of one `rotate_keys` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSummary {
    /// The key that is Active after the rotation.
    pub new_active: Uuid,
    pub new_version: u32,
    /// The previously Active key, now Enabled.
    pub demoted: Option<Uuid>,
    /// Enabled keys whose retention elapsed, now Disabled.
    pub disabled: Vec<Uuid>,
    /// Disabled keys removed from the table and the key store.
    pub deleted: Vec<Uuid>,
}

/// Key material wrapped under the master secret, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrappedMaterial {
    kdf: KdfConfig,
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
    /// `nonce || tag || ciphertext`
    #[serde(with = "base64_bytes")]
    sealed: Vec<u8>,
}

/// What the manager hands to the key store for each record.
#[derive(Serialize, Deserialize)]
struct KeyEnvelope {
    format_version: u32,
    metadata: KeyMetadata,
    material: WrappedMaterial,
}

#[derive(Clone)]
struct KeyEntry {
    record: KeyRecord,
    wrapped: Arc<WrappedMaterial>,
}

#[derive(Clone, Default)]
struct KeyTable {
    entries: BTreeMap<Uuid, KeyEntry>,
    active: Option<Uuid>,
    /// Highest version ever handed out; never decreases.
    last_version: u32,
}

impl KeyTable {
    fn active_entry(&self) -> Option<&KeyEntry> {
        self.active.and_then(|id| self.entries.get(&id))
    }

    fn ids_with_status(&self, status: KeyStatus) -> Vec<Uuid> {
        self.entries
            .values()
            .filter(|entry| entry.record.status == status)
            .map(|entry| entry.record.id)
            .collect()
    }
}

/// 密钥生命周期管理器
///
/// 由调用方显式构造并注入 [`KeyStorage`]；生命周期 (`init`/`shutdown`)
/// 归构造者所有，不存在任何全局状态。
pub struct KeyLifecycleManager {
    policy: RotationPolicy,
    kdf: KdfConfig,
    master_secret: SecretString,
    store: Arc<dyn KeyStorage>,
    table: ArcSwap<KeyTable>,
    writer: Mutex<()>,
    closed: AtomicBool,
}

impl KeyLifecycleManager {
    /// 创建管理器。配置在此处校验；不会访问密钥存储。
    pub fn new(
        config: &ConfigFile,
        master_secret: SecretString,
        store: Arc<dyn KeyStorage>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            policy: config.rotation.clone(),
            kdf: config.kdf.clone(),
            master_secret,
            store,
            table: ArcSwap::from_pointee(KeyTable::default()),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// 从密钥存储加载所有已持久化的密钥，替换内存中的密钥表。
    pub fn init(&self) -> Result<(), Error> {
        let _guard = self.lock_writer();
        self.ensure_open()?;

        let mut table = KeyTable {
            last_version: self.table.load().last_version,
            ..KeyTable::default()
        };
        for stored_id in self.store.list()? {
            let Ok(id) = Uuid::parse_str(&stored_id) else {
                warn!(stored_id = %stored_id, "skipping non-key entry in key store");
                continue;
            };
            let entry = self.load_entry(id)?;
            if entry.record.status == KeyStatus::Deleted {
                warn!(key_id = %id, "skipping key persisted as deleted");
                continue;
            }
            if entry.record.status == KeyStatus::Active {
                if let Some(existing) = table.active {
                    return Err(StorageError::Corrupted(format!(
                        "more than one active key: {existing} and {id}"
                    ))
                    .into());
                }
                table.active = Some(id);
            }
            table.last_version = table.last_version.max(entry.record.version);
            table.entries.insert(id, entry);
        }

        info!(
            keys = table.entries.len(),
            active = ?table.active,
            last_version = table.last_version,
            "key table loaded"
        );
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// 关闭管理器并丢弃内存中的全部密钥材料。之后的调用返回 `ShutDown`。
    pub fn shutdown(&self) {
        let _guard = self.lock_writer();
        self.closed.store(true, Ordering::SeqCst);
        self.table.store(Arc::new(KeyTable::default()));
        info!("key manager shut down");
    }

    /// Creates the first Active key.
    ///
    /// Never demotes an existing key: if an Active key already exists this
    /// fails with [`Error::ActiveKeyExists`] and leaves it untouched.
    pub fn create_key(&self) -> Result<KeyRecord, Error> {
        let _guard = self.lock_writer();
        self.ensure_open()?;

        let mut table = KeyTable::clone(&self.table.load());
        if let Some(active) = table.active {
            return Err(Error::ActiveKeyExists(active));
        }
        let record = self.create_active(&mut table, Utc::now())?;
        self.table.store(Arc::new(table));
        Ok(record)
    }

    /// 执行一次密钥轮换。
    ///
    /// 按顺序：删除到期的 `Disabled` 密钥；将保留期已满的 `Enabled` 密钥禁用；
    /// 将当前 `Active` 密钥降级为 `Enabled`；创建新的 `Active` 密钥。
    /// 若中途持久化失败，内存密钥表与已成功持久化的部分保持一致后再返回错误；
    /// 新密钥创建失败时，被降级的旧密钥会被恢复为 `Active`。
    pub fn rotate_keys(&self) -> Result<RotationSummary, Error> {
        let _guard = self.lock_writer();
        self.ensure_open()?;

        let now = Utc::now();
        let mut table = KeyTable::clone(&self.table.load());
        let mut deleted = Vec::new();
        let mut disabled = Vec::new();
        let mut demoted = None;

        let result =
            self.apply_rotation(&mut table, now, &mut deleted, &mut disabled, &mut demoted);
        self.table.store(Arc::new(table));
        let record = result?;

        info!(
            new_key_id = %record.id,
            version = record.version,
            demoted = ?demoted,
            disabled = disabled.len(),
            deleted = deleted.len(),
            "key rotation complete"
        );
        Ok(RotationSummary {
            new_active: record.id,
            new_version: record.version,
            demoted,
            disabled,
            deleted,
        })
    }

    /// Returns the record for `key_id`, or `KeyNotFound` if it was deleted or never existed.
    pub fn get_key(&self, key_id: Uuid) -> Result<KeyRecord, Error> {
        self.ensure_open()?;
        self.table
            .load()
            .entries
            .get(&key_id)
            .map(|entry| entry.record.clone())
            .ok_or(Error::KeyNotFound(key_id))
    }

    /// The current Active key, if one has been provisioned.
    pub fn active_key(&self) -> Result<Option<KeyRecord>, Error> {
        self.ensure_open()?;
        Ok(self.table.load().active_entry().map(|entry| entry.record.clone()))
    }

    /// All live records, ordered by version.
    pub fn keys(&self) -> Result<Vec<KeyRecord>, Error> {
        self.ensure_open()?;
        let table = self.table.load();
        let mut records: Vec<KeyRecord> =
            table.entries.values().map(|entry| entry.record.clone()).collect();
        records.sort_by_key(|record| record.version);
        Ok(records)
    }

    /// Advisory: true when there is no Active key or it is past `expires_at`.
    pub fn needs_rotation(&self) -> Result<bool, Error> {
        self.ensure_open()?;
        Ok(match self.table.load().active_entry() {
            Some(entry) => Utc::now() >= entry.record.expires_at,
            None => true,
        })
    }

    /// 使用当前 `Active` 密钥加密；若尚无密钥则自动创建一个。
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, Error> {
        self.ensure_open()?;
        let key = self.active_or_create()?;
        encrypt_under(&key, plaintext)
    }

    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        let key = self.decryptable_key(payload.key_id)?;
        decrypt_under(&key, payload)
    }

    /// 在 `old_key_id` 下解密后，显式地用 `new_key_id` 重新加密。
    ///
    /// 任一步失败都包装为 [`Error::KeyRotation`]，包括目标密钥不存在或已被禁用。
    pub fn rotate_encryption(
        &self,
        payload: &EncryptedPayload,
        old_key_id: Uuid,
        new_key_id: Uuid,
    ) -> Result<EncryptedPayload, Error> {
        let wrap = |source: Error| Error::KeyRotation {
            old_key_id,
            new_key_id,
            source: Box::new(source),
        };
        self.ensure_open().map_err(wrap)?;

        let old_key = self.decryptable_key(old_key_id).map_err(wrap)?;
        let plaintext = Zeroizing::new(decrypt_under(&old_key, payload).map_err(wrap)?);
        let new_key = self.decryptable_key(new_key_id).map_err(wrap)?;
        let reencrypted = encrypt_under(&new_key, &plaintext).map_err(wrap)?;

        debug!(%old_key_id, %new_key_id, "payload re-encrypted");
        Ok(reencrypted)
    }

    // --- internals ---

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // 密钥表只以完整快照替换，锁中毒后继续使用是安全的
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    fn active_or_create(&self) -> Result<KeyRecord, Error> {
        if let Some(entry) = self.table.load().active_entry() {
            return Ok(entry.record.clone());
        }

        let _guard = self.lock_writer();
        self.ensure_open()?;
        let mut table = KeyTable::clone(&self.table.load());
        if let Some(entry) = table.active_entry() {
            return Ok(entry.record.clone());
        }
        info!("no active key provisioned, creating one for encryption");
        let record = self.create_active(&mut table, Utc::now())?;
        self.table.store(Arc::new(table));
        Ok(record)
    }

    fn decryptable_key(&self, key_id: Uuid) -> Result<KeyRecord, Error> {
        let table = self.table.load();
        let entry = table.entries.get(&key_id).ok_or(Error::KeyNotFound(key_id))?;
        match entry.record.status {
            status if status.can_decrypt() => Ok(entry.record.clone()),
            KeyStatus::Disabled => Err(Error::KeyDisabled(key_id)),
            _ => Err(Error::KeyNotFound(key_id)),
        }
    }

    /// Mutates `table` only after each step has been persisted.
    fn apply_rotation(
        &self,
        table: &mut KeyTable,
        now: DateTime<Utc>,
        deleted: &mut Vec<Uuid>,
        disabled: &mut Vec<Uuid>,
        demoted: &mut Option<Uuid>,
    ) -> Result<KeyRecord, Error> {
        let retention = self.policy.retention_period();

        for id in table.ids_with_status(KeyStatus::Disabled) {
            let due = match self.policy.deletion {
                DeletionPolicy::NextRotation => true,
                DeletionPolicy::AfterRetention => table
                    .entries
                    .get(&id)
                    .is_some_and(|entry| now - entry.record.status_since >= retention),
            };
            if !due {
                continue;
            }
            match self.store.delete(&id.to_string()) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            table.entries.remove(&id);
            deleted.push(id);
            info!(key_id = %id, "deleted disabled key");
        }

        for id in table.ids_with_status(KeyStatus::Enabled) {
            let Some(entry) = table.entries.get(&id) else {
                continue;
            };
            if now - entry.record.status_since < retention {
                continue;
            }
            let updated = self.transition(entry, KeyStatus::Disabled, now)?;
            table.entries.insert(id, updated);
            disabled.push(id);
            info!(key_id = %id, "disabled key past retention period");
        }

        let mut previous = None;
        if let Some(entry) = table.active_entry() {
            let id = entry.record.id;
            let updated = self.transition(entry, KeyStatus::Enabled, now)?;
            previous = Some((id, entry.record.status_since));
            table.entries.insert(id, updated);
            table.active = None;
            *demoted = Some(id);
        }

        let created = self.create_active(table, now);
        if created.is_err() {
            if let Some((id, since)) = previous {
                self.restore_active(table, id, since);
                *demoted = None;
            }
        }
        created
    }

    /// Puts a demoted key back to Active after the replacement could not be created.
    fn restore_active(&self, table: &mut KeyTable, key_id: Uuid, since: DateTime<Utc>) {
        let Some(entry) = table.entries.get(&key_id) else {
            return;
        };
        match self.transition(entry, KeyStatus::Active, since) {
            Ok(restored) => {
                table.entries.insert(key_id, restored);
                table.active = Some(key_id);
                warn!(key_id = %key_id, "new key creation failed, previous key restored to active");
            }
            Err(e) => {
                warn!(key_id = %key_id, error = %e, "cannot restore previous active key");
            }
        }
    }

    fn transition(
        &self,
        entry: &KeyEntry,
        status: KeyStatus,
        now: DateTime<Utc>,
    ) -> Result<KeyEntry, Error> {
        let updated = KeyEntry {
            record: entry.record.with_status(status, now),
            wrapped: Arc::clone(&entry.wrapped),
        };
        self.persist(&updated)?;
        debug!(key_id = %updated.record.id, ?status, "key status changed");
        Ok(updated)
    }

    fn create_active(&self, table: &mut KeyTable, now: DateTime<Utc>) -> Result<KeyRecord, Error> {
        let master = self.master_secret.expose_secret().as_bytes();
        if master.is_empty() {
            return Err(Error::KeyGeneration("master secret is empty".to_string()));
        }

        let version = table
            .last_version
            .checked_add(1)
            .ok_or_else(|| Error::KeyGeneration("key version space exhausted".to_string()))?;
        let material = Zeroizing::new(
            random_bytes(KEY_SIZE)
                .map_err(|e| Error::KeyGeneration(e.to_string()))?,
        );
        let metadata = KeyMetadata {
            id: Uuid::new_v4(),
            algorithm: KEY_ALGORITHM.to_string(),
            version,
            created_at: now,
            expires_at: now + self.policy.rotation_interval(),
            status: KeyStatus::Active,
            status_since: now,
        };
        let wrapped = self.wrap_material(&metadata, &material)?;

        let entry = KeyEntry {
            record: KeyRecord::from_parts(
                metadata,
                SecretBox::new(Box::new(KeyMaterial::new(material.to_vec()))),
            ),
            wrapped: Arc::new(wrapped),
        };
        self.persist(&entry)?;

        let record = entry.record.clone();
        table.last_version = version;
        table.active = Some(record.id);
        table.entries.insert(record.id, entry);
        info!(key_id = %record.id, version, "created active key");
        Ok(record)
    }

    fn wrap_material(
        &self,
        metadata: &KeyMetadata,
        material: &[u8],
    ) -> Result<WrappedMaterial, Error> {
        let salt = random_bytes(SALT_SIZE).map_err(|e| Error::KeyGeneration(e.to_string()))?;
        let wrapping_key = kdf::derive_from_password(
            self.master_secret.expose_secret().as_bytes(),
            &salt,
            &self.kdf,
        )
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        let sealed = aes_gcm::seal_combined(
            wrapping_key.as_slice(),
            material,
            envelope_aad(metadata).as_bytes(),
        )
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;

        Ok(WrappedMaterial {
            kdf: self.kdf.clone(),
            salt,
            sealed,
        })
    }

    fn persist(&self, entry: &KeyEntry) -> Result<(), Error> {
        let envelope = KeyEnvelope {
            format_version: ENVELOPE_FORMAT_VERSION,
            metadata: entry.record.metadata(),
            material: WrappedMaterial::clone(&entry.wrapped),
        };
        let json = serde_json::to_vec(&envelope)?;
        self.store.store(&entry.record.id.to_string(), &json)
    }

    fn load_entry(&self, id: Uuid) -> Result<KeyEntry, Error> {
        let corrupted = |reason: String| -> Error {
            StorageError::Corrupted(format!("key {id}: {reason}")).into()
        };

        let bytes = self.store.retrieve(&id.to_string())?;
        let envelope: KeyEnvelope = serde_json::from_slice(bytes.expose_secret())?;
        if envelope.format_version != ENVELOPE_FORMAT_VERSION {
            return Err(corrupted(format!(
                "unsupported envelope version {}",
                envelope.format_version
            )));
        }
        if envelope.metadata.id != id {
            return Err(corrupted(format!(
                "envelope belongs to key {}",
                envelope.metadata.id
            )));
        }

        let master = self.master_secret.expose_secret().as_bytes();
        if master.is_empty() {
            return Err(Error::Config(
                "master secret is empty, persisted keys cannot be unwrapped".to_string(),
            ));
        }
        let wrapping_key =
            kdf::derive_from_password(master, &envelope.material.salt, &envelope.material.kdf)
                .map_err(|e| corrupted(e.to_string()))?;
        let material = Zeroizing::new(
            aes_gcm::open_combined(
                wrapping_key.as_slice(),
                &envelope.material.sealed,
                envelope_aad(&envelope.metadata).as_bytes(),
            )
            .map_err(|e| corrupted(format!("cannot unwrap key material: {e}")))?,
        );
        if material.len() != KEY_SIZE {
            return Err(corrupted(format!("unexpected key length {}", material.len())));
        }

        debug!(key_id = %id, version = envelope.metadata.version, "loaded key");
        Ok(KeyEntry {
            record: KeyRecord::from_parts(
                envelope.metadata,
                SecretBox::new(Box::new(KeyMaterial::new(material.to_vec()))),
            ),
            wrapped: Arc::new(envelope.material),
        })
    }

    /// Sets a key's status directly, bypassing the rotation policy.
    #[cfg(test)]
    pub(crate) fn force_status(
        &self,
        key_id: Uuid,
        status: KeyStatus,
        since: DateTime<Utc>,
    ) -> Result<(), Error> {
        let _guard = self.lock_writer();
        let mut table = KeyTable::clone(&self.table.load());
        let entry = table.entries.get(&key_id).ok_or(Error::KeyNotFound(key_id))?;
        let updated = self.transition(entry, status, since)?;
        table.entries.insert(key_id, updated);
        if status == KeyStatus::Active {
            table.active = Some(key_id);
        } else if table.active == Some(key_id) {
            table.active = None;
        }
        self.table.store(Arc::new(table));
        Ok(())
    }
}

/// Binds the wrapped material to the key's immutable identity.
fn envelope_aad(metadata: &KeyMetadata) -> String {
    format!("{}|{}|{}", metadata.id, metadata.version, metadata.algorithm)
}

fn encrypt_under(key: &KeyRecord, plaintext: &[u8]) -> Result<EncryptedPayload, Error> {
    let sealed = aes_gcm::encrypt(key.material_bytes(), plaintext, key.id.as_bytes())
        .map_err(|e| Error::Encryption(e.to_string()))?;
    Ok(EncryptedPayload {
        key_id: key.id,
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
        auth_tag: sealed.tag,
        version: key.version,
        created_at: Utc::now(),
    })
}

fn decrypt_under(key: &KeyRecord, payload: &EncryptedPayload) -> Result<Vec<u8>, Error> {
    aes_gcm::decrypt(
        key.material_bytes(),
        &payload.nonce,
        &payload.ciphertext,
        &payload.auth_tag,
        key.id.as_bytes(),
    )
    .map_err(|e| Error::Decryption(e.to_string()))
}
