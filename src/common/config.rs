//!
//! # 通用配置模块
//!
//! 包含密钥存储、密钥轮换策略、密钥派生以及重加密扫描所使用的配置结构。
//! 所有配置在构造时校验，而不是在首次使用时。秘密（存储密钥、主密钥）
//! 不属于配置文件，由调用方在构造时显式传入。
//!
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Argon2 requires at least eight KiB of memory per lane.
const ARGON2_MIN_MEMORY_PER_LANE_KIB: u32 = 8;

/// 存储配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// 密钥存储目录
    pub storage_dir: PathBuf,
    /// 备份目录，`None` 表示不保留备份
    pub backup_dir: Option<PathBuf>,
    /// 每个密钥保留的最大备份数量
    pub max_backups: usize,
    /// 是否通过“临时文件 + 重命名”的方式原子写入
    pub atomic_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./keys"),
            backup_dir: None,
            max_backups: 3,
            atomic_writes: true,
        }
    }
}

/// `Disabled` 状态的密钥何时被最终删除。
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// 在禁用它的那次轮换之后的下一次轮换中删除。
    #[default]
    NextRotation,
    /// 禁用后再经过一个完整的保留期才删除。
    AfterRetention,
}

/// 密钥轮换策略，定义了密钥的生命周期。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RotationPolicy {
    /// 两次计划轮换之间的天数（仅作参考，用于计算 `expires_at`）。
    pub rotation_interval_days: u32,
    /// `Enabled` 密钥在被禁用前至少保持可解密的天数。
    pub retention_period_days: u32,
    /// `Disabled` 密钥的删除时机。
    pub deletion: DeletionPolicy,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_days: 90,
            retention_period_days: 30,
            deletion: DeletionPolicy::NextRotation,
        }
    }
}

impl RotationPolicy {
    pub fn rotation_interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.rotation_interval_days))
    }

    pub fn retention_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_period_days))
    }
}

/// Argon2id 参数，用于从主密钥派生每个密钥的包装密钥。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KdfConfig {
    /// 迭代次数（Argon2 time cost）
    pub iterations: u32,
    /// 内存开销（KiB）
    pub memory_cost_kib: u32,
    /// 并行度
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory_cost_kib: 19456, // 19 MiB
            parallelism: 1,
        }
    }
}

/// 重加密扫描配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    /// 同时处理的文档数量上限
    pub max_parallelism: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { max_parallelism: 4 }
    }
}

/// 完整配置文件，列出了所有可识别的选项。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ConfigFile {
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 轮换配置
    #[serde(default)]
    pub rotation: RotationPolicy,
    /// 密钥派生配置
    #[serde(default)]
    pub kdf: KdfConfig,
    /// 扫描配置
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl ConfigFile {
    /// 从已经读入内存的 JSON 文本解析并校验配置。
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: ConfigFile = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验所有选项。
    pub fn validate(&self) -> Result<(), Error> {
        self.storage.validate()?;
        self.kdf.validate()?;
        if self.sweep.max_parallelism == 0 {
            return Err(Error::Config(
                "sweep.max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.storage_dir.as_os_str().is_empty() {
            return Err(Error::Config("storage.storage_dir is empty".to_string()));
        }
        if let Some(backup_dir) = &self.backup_dir {
            if backup_dir.as_os_str().is_empty() {
                return Err(Error::Config("storage.backup_dir is empty".to_string()));
            }
            if backup_dir == &self.storage_dir {
                return Err(Error::Config(
                    "storage.backup_dir must differ from storage.storage_dir".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl KdfConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.iterations == 0 {
            return Err(Error::Config("kdf.iterations must be at least 1".to_string()));
        }
        if self.parallelism == 0 {
            return Err(Error::Config("kdf.parallelism must be at least 1".to_string()));
        }
        let min_memory = self.parallelism.saturating_mul(ARGON2_MIN_MEMORY_PER_LANE_KIB);
        if self.memory_cost_kib < min_memory {
            return Err(Error::Config(format!(
                "kdf.memory_cost_kib must be at least {min_memory}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConfigFile::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.max_backups, 3);
        assert!(config.storage.atomic_writes);
        assert_eq!(config.rotation.deletion, DeletionPolicy::NextRotation);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() -> Result<(), Error> {
        let config = ConfigFile::from_json(
            r#"{
                "storage": { "storage_dir": "/var/lib/keys", "backup_dir": "/var/lib/keys-backup" },
                "rotation": { "retention_period_days": 7, "deletion": "after_retention" }
            }"#,
        )?;
        assert_eq!(config.storage.storage_dir, PathBuf::from("/var/lib/keys"));
        assert_eq!(config.storage.max_backups, 3);
        assert_eq!(config.rotation.retention_period_days, 7);
        assert_eq!(config.rotation.rotation_interval_days, 90);
        assert_eq!(config.rotation.deletion, DeletionPolicy::AfterRetention);
        assert_eq!(config.kdf, KdfConfig::default());
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ConfigFile::default();
        config.kdf.iterations = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ConfigFile::default();
        config.kdf.parallelism = 4;
        config.kdf.memory_cost_kib = 16;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ConfigFile::default();
        config.storage.backup_dir = Some(config.storage.storage_dir.clone());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ConfigFile::default();
        config.sweep.max_parallelism = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_backups_is_allowed() {
        let mut config = ConfigFile::default();
        config.storage.max_backups = 0;
        assert!(config.validate().is_ok());
    }
}
