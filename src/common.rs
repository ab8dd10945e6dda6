//! 通用模块，包含配置、共享的数据类型、trait 和工具函数

pub mod config;
pub mod traits;
pub mod types;
pub mod utils;

pub use self::config::{
    ConfigFile, DeletionPolicy, KdfConfig, RotationPolicy, StorageConfig, SweepConfig,
};
pub use self::traits::KeyStorage;
pub use self::types::{
    EncryptedPayload, KEY_ALGORITHM, KeyMaterial, KeyMetadata, KeyRecord, KeyStatus, MIN_KEY_LENGTH,
};
