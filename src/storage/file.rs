use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use rand_core::{OsRng, TryRngCore};
use secrecy::{ExposeSecret, SecretBox};
use tracing::{debug, info, warn};

use crate::common::config::StorageConfig;
use crate::common::traits::KeyStorage;
use crate::common::types::MIN_KEY_LENGTH;
use crate::common::utils::random_bytes;
use crate::error::{Error, StorageError};
use crate::storage::container::EncryptedKeyContainer;

const KEY_FILE_EXTENSION: &str = "key";
const TEMP_FILE_PREFIX: &str = ".tmp-";
const MAX_KEY_ID_LEN: usize = 128;
const WIPE_CHUNK: usize = 8192;

/// 密钥文件存储
///
/// 每个密钥 ID 对应存储目录下的一个加密文件 `{key_id}.key`，内容是
/// 用存储密钥加密的 [`EncryptedKeyContainer`]。覆盖已有文件前，旧文件会被
/// 复制到备份目录 `{key_id}_{timestamp}`，并按配置的上限从最旧的开始清理。
///
/// 对同一个密钥 ID 的操作通过每个 ID 一把的锁串行执行；不同 ID 之间可以并发。
///
/// # Secure deletion
///
/// `delete` overwrites files with random bytes before unlinking them. This is
/// best effort only: on copy-on-write or log-structured filesystems (btrfs,
/// ZFS, APFS, most SSD firmware) the old blocks may survive and nothing here
/// guarantees they are unrecoverable.
pub struct FileKeyStore {
    config: StorageConfig,
    storage_secret: SecretBox<[u8]>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileKeyStore {
    /// 打开（必要时创建）密钥存储目录和备份目录。
    ///
    /// 新创建的目录（包括中间目录）权限被限制为仅属主可访问（0700）。
    /// 上次进程中断留下的 `.tmp-*` 临时文件会被覆写后删除，因此同一目录
    /// 不应同时被另一个正在写入的进程使用。
    pub fn open(config: StorageConfig, storage_secret: SecretBox<[u8]>) -> Result<Self, Error> {
        config.validate()?;
        if storage_secret.expose_secret().is_empty() {
            return Err(Error::Config("storage secret is empty".to_string()));
        }

        ensure_private_dir(&config.storage_dir)?;
        remove_stale_temp_files(&config.storage_dir)?;
        if let Some(backup_dir) = &config.backup_dir {
            ensure_private_dir(backup_dir)?;
            remove_stale_temp_files(backup_dir)?;
        }

        Ok(Self {
            config,
            storage_secret,
            key_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// 列出某个密钥的所有备份文件，按时间从旧到新排列。
    pub fn backups(&self, key_id: &str) -> Result<Vec<PathBuf>, Error> {
        validate_key_id(key_id)?;
        Ok(self.list_backups(key_id)?)
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.config
            .storage_dir
            .join(format!("{key_id}.{KEY_FILE_EXTENSION}"))
    }

    fn lock_for(&self, key_id: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Caller must hold the key's lock.
    fn store_locked(&self, key_id: &str, key_material: &[u8]) -> Result<(), Error> {
        let container =
            EncryptedKeyContainer::seal(self.storage_secret.expose_secret(), key_id, key_material)?;
        let json = container.to_json()?;

        let path = self.key_path(key_id);
        let replaced = path.is_file();
        if replaced {
            self.backup_existing(key_id, &path)?;
        }
        self.write_file(&path, json.as_bytes())?;

        debug!(key_id, replaced, "stored key material");
        Ok(())
    }

    /// Copies the current blob to the backup directory, then prunes.
    fn backup_existing(&self, key_id: &str, path: &Path) -> Result<(), StorageError> {
        let Some(backup_dir) = &self.config.backup_dir else {
            return Ok(());
        };

        if self.config.max_backups > 0 {
            let old_blob = fs::read(path).map_err(|e| StorageError::io(path, e))?;
            let backup_path = unique_backup_path(backup_dir, key_id);
            self.write_file(&backup_path, &old_blob)?;
            debug!(key_id, backup = %backup_path.display(), "backed up previous key blob");
        }

        self.prune_backups(key_id)
    }

    fn prune_backups(&self, key_id: &str) -> Result<(), StorageError> {
        let backups = self.list_backups(key_id)?;
        let excess = backups.len().saturating_sub(self.config.max_backups);
        for stale in backups.iter().take(excess) {
            fs::remove_file(stale).map_err(|e| StorageError::io(stale, e))?;
            debug!(key_id, backup = %stale.display(), "pruned old backup");
        }
        Ok(())
    }

    fn list_backups(&self, key_id: &str) -> Result<Vec<PathBuf>, StorageError> {
        let Some(backup_dir) = &self.config.backup_dir else {
            return Ok(Vec::new());
        };
        let prefix = format!("{key_id}_");

        let entries = fs::read_dir(backup_dir).map_err(|e| StorageError::io(backup_dir, e))?;
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(backup_dir, e))?;
            let is_file = entry.file_type().map(|ft| ft.is_file()).unwrap_or(false);
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
            if is_file && matches {
                backups.push(entry.path());
            }
        }
        // 时间戳格式可按字典序排序
        backups.sort();
        Ok(backups)
    }

    /// Writes `bytes` to `path`, via temp file + rename when atomic writes are on.
    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if self.config.atomic_writes {
            write_atomic(path, bytes)
        } else {
            write_direct(path, bytes)
        }
    }
}

impl KeyStorage for FileKeyStore {
    fn store(&self, key_id: &str, key_material: &[u8]) -> Result<(), Error> {
        validate_key_id(key_id)?;
        if key_material.len() < MIN_KEY_LENGTH {
            return Err(StorageError::KeyTooShort {
                len: key_material.len(),
                min: MIN_KEY_LENGTH,
            }
            .into());
        }

        let lock = self.lock_for(key_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store_locked(key_id, key_material)
    }

    fn retrieve(&self, key_id: &str) -> Result<SecretBox<[u8]>, Error> {
        validate_key_id(key_id)?;
        let lock = self.lock_for(key_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.key_path(key_id);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(key_id.to_string()));
            }
            Err(e) => return Err(StorageError::io(&path, e).into()),
        };
        let container = EncryptedKeyContainer::from_json(&json)?;
        Ok(container.open(self.storage_secret.expose_secret(), key_id)?)
    }

    fn delete(&self, key_id: &str) -> Result<(), Error> {
        validate_key_id(key_id)?;
        let lock = self.lock_for(key_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.key_path(key_id);
        if !path.is_file() {
            return Err(Error::NotFound(key_id.to_string()));
        }
        wipe_and_remove(&path)?;

        let backups = self.list_backups(key_id)?;
        for backup in &backups {
            wipe_and_remove(backup)?;
        }

        info!(key_id, backups = backups.len(), "deleted key material");
        Ok(())
    }

    fn rotate(&self, key_id: &str) -> Result<SecretBox<[u8]>, Error> {
        validate_key_id(key_id)?;
        let lock = self.lock_for(key_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.key_path(key_id).is_file() {
            return Err(Error::NotFound(key_id.to_string()));
        }
        let fresh = random_bytes(MIN_KEY_LENGTH).map_err(|e| StorageError::Crypto(e.to_string()))?;
        self.store_locked(key_id, &fresh)?;

        info!(key_id, "rotated stored key material");
        Ok(SecretBox::new(fresh.into_boxed_slice()))
    }

    fn exists(&self, key_id: &str) -> bool {
        validate_key_id(key_id).is_ok() && self.key_path(key_id).is_file()
    }

    fn list(&self) -> Result<Vec<String>, Error> {
        let dir = &self.config.storage_dir;
        let entries = fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(dir, e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != KEY_FILE_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|stem| stem.to_str()) {
                Some(id) if validate_key_id(id).is_ok() => ids.push(id.to_string()),
                _ => warn!(path = %path.display(), "ignoring unexpected file in key store"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Key ids become file names, so only ASCII alphanumerics and `-` are accepted.
fn validate_key_id(key_id: &str) -> Result<(), StorageError> {
    let valid = !key_id.is_empty()
        && key_id.len() <= MAX_KEY_ID_LEN
        && key_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKeyId(key_id.to_string()))
    }
}

/// Creates `dir` and any missing parents with mode 0700. Existing directories are left as is.
fn ensure_private_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| StorageError::io(dir, e))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))
    }
}

/// Wipes temp files left behind by writes that never reached `persist`.
fn remove_stale_temp_files(dir: &Path) -> Result<(), StorageError> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir, e))?;
        let is_file = entry.file_type().map(|ft| ft.is_file()).unwrap_or(false);
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TEMP_FILE_PREFIX));
        if !(is_file && is_temp) {
            continue;
        }
        let path = entry.path();
        match wipe_and_remove(&path) {
            Ok(()) => info!(path = %path.display(), "removed stale temp file"),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale temp file"),
        }
    }
    Ok(())
}

fn unique_backup_path(backup_dir: &Path, key_id: &str) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ");
    let base = backup_dir.join(format!("{key_id}_{timestamp}"));
    if !base.exists() {
        return base;
    }
    (1u32..)
        .map(|n| backup_dir.join(format!("{key_id}_{timestamp}-{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StorageError::io(dir, e))?;

    temp.write_all(bytes).map_err(|e| StorageError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| StorageError::io(path, e.error))?;

    // 目录项的持久化是尽力而为的
    #[cfg(unix)]
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

fn write_direct(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| StorageError::io(path, e))?;
    file.write_all(bytes).map_err(|e| StorageError::io(path, e))?;
    file.sync_all().map_err(|e| StorageError::io(path, e))
}

/// Overwrites the file with random bytes, syncs, then unlinks it.
fn wipe_and_remove(path: &Path) -> Result<(), StorageError> {
    let len = fs::metadata(path).map_err(|e| StorageError::io(path, e))?.len();
    {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        let mut buffer = vec![0u8; WIPE_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(WIPE_CHUNK as u64) as usize;
            OsRng
                .try_fill_bytes(&mut buffer[..chunk])
                .map_err(|e| StorageError::Crypto(e.to_string()))?;
            file.write_all(&buffer[..chunk])
                .map_err(|e| StorageError::io(path, e))?;
            remaining -= chunk as u64;
        }
        file.sync_all().map_err(|e| StorageError::io(path, e))?;
    }
    fs::remove_file(path).map_err(|e| StorageError::io(path, e))
}
