//! 对称加密核心模块
//!
//! - `aes_gcm`: AES-256-GCM 认证加密（分离的认证标签）
//! - `kdf`: 包装密钥派生（Argon2id 用于主密钥，HKDF-SHA256 用于存储密钥）

pub mod aes_gcm;
pub mod kdf;
