use crate::error::Error;
use secrecy::SecretBox;

/// 密钥存储接口
///
/// 负责把原始密钥字节加密后持久化。实现不包含任何业务逻辑，
/// 也从不决定密钥状态。对同一个 `key_id` 的操作必须串行执行。
pub trait KeyStorage: Send + Sync {
    /// 加密并写入 `key_id` 对应的密钥字节，必要时先备份旧数据。
    fn store(&self, key_id: &str, key_material: &[u8]) -> Result<(), Error>;

    /// 读取并解密 `key_id` 对应的密钥字节。
    fn retrieve(&self, key_id: &str) -> Result<SecretBox<[u8]>, Error>;

    /// 覆写后删除 `key_id` 对应的数据及其所有备份。
    fn delete(&self, key_id: &str) -> Result<(), Error>;

    /// 为 `key_id` 生成新的随机密钥字节并写入，返回新字节。
    fn rotate(&self, key_id: &str) -> Result<SecretBox<[u8]>, Error>;

    /// 检查密钥是否存在
    fn exists(&self, key_id: &str) -> bool;

    /// 列出所有密钥 ID
    fn list(&self) -> Result<Vec<String>, Error>;
}
