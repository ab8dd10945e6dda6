//!
//! 集成测试的通用辅助函数
//!
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use secrecy::{SecretBox, SecretString};
use seal_keyring::{
    ConfigFile, FileKeyStore, KdfConfig, KeyLifecycleManager, KeyStorage, StorageConfig,
};

pub const MASTER_SECRET: &str = "integration-master-secret";
pub const STORAGE_SECRET: &[u8] = b"integration-storage-secret";

/// 低开销的测试配置：Argon2 最小内存、单次迭代。
pub fn cheap_config(root: &Path) -> ConfigFile {
    ConfigFile {
        storage: StorageConfig {
            storage_dir: root.join("keys"),
            backup_dir: Some(root.join("backups")),
            max_backups: 3,
            atomic_writes: true,
        },
        kdf: KdfConfig {
            iterations: 1,
            memory_cost_kib: 8,
            parallelism: 1,
        },
        ..ConfigFile::default()
    }
}

pub fn open_store(config: &ConfigFile) -> Arc<dyn KeyStorage> {
    Arc::new(
        FileKeyStore::open(config.storage.clone(), SecretBox::new(Box::from(STORAGE_SECRET)))
            .unwrap(),
    )
}

/// 构造并初始化一个管理器。
pub fn open_manager(config: &ConfigFile) -> Arc<KeyLifecycleManager> {
    let manager =
        KeyLifecycleManager::new(config, SecretString::from(MASTER_SECRET), open_store(config))
            .unwrap();
    manager.init().unwrap();
    Arc::new(manager)
}

pub fn doc_ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
