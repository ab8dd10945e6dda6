//! The storage module, defining how key material is persisted at rest.
// 中文: 存储模块，定义密钥材料如何加密落盘。

pub mod container;
pub mod file;

pub use container::EncryptedKeyContainer;
pub use file::FileKeyStore;
