//! AES-256-GCM 对称加密实现
use aes_gcm::aead::{AeadInPlace, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce, Tag};
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16; // AES-GCM's tag is 16 bytes

/// AES-GCM 系统的独立错误类型
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AesGcmSystemError {
    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Ciphertext is malformed or truncated: {0}")]
    MalformedCiphertext(String),
}

/// 加密结果：随机 nonce、密文与分离的认证标签
#[derive(Debug, Clone)]
pub struct SealedBytes {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, AesGcmSystemError> {
    if key.len() != KEY_SIZE {
        return Err(AesGcmSystemError::InvalidKeySize {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| AesGcmSystemError::InvalidKeySize {
        expected: KEY_SIZE,
        actual: key.len(),
    })
}

/// 使用 AES-256-GCM 加密数据，每次调用生成新的随机 96 位 nonce。
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    additional_data: &[u8],
) -> Result<SealedBytes, AesGcmSystemError> {
    let cipher = cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, additional_data, &mut buffer)
        .map_err(|_| AesGcmSystemError::EncryptionFailed)?;

    Ok(SealedBytes {
        nonce: nonce.to_vec(),
        ciphertext: buffer,
        tag: tag.to_vec(),
    })
}

/// 解密并校验认证标签。
pub fn decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>, AesGcmSystemError> {
    if nonce.len() != NONCE_SIZE {
        return Err(AesGcmSystemError::MalformedCiphertext(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(AesGcmSystemError::MalformedCiphertext(format!(
            "tag must be {TAG_SIZE} bytes, got {}",
            tag.len()
        )));
    }
    let cipher = cipher(key)?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            additional_data,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| AesGcmSystemError::DecryptionFailed)?;
    Ok(buffer)
}

/// 加密为单一字节串：`nonce || tag || ciphertext`
pub fn seal_combined(
    key: &[u8],
    plaintext: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>, AesGcmSystemError> {
    let sealed = encrypt(key, plaintext, additional_data)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + sealed.ciphertext.len());
    out.extend_from_slice(&sealed.nonce);
    out.extend_from_slice(&sealed.tag);
    out.extend_from_slice(&sealed.ciphertext);
    Ok(out)
}

/// `seal_combined` 的逆操作
pub fn open_combined(
    key: &[u8],
    combined: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>, AesGcmSystemError> {
    if combined.len() < NONCE_SIZE + TAG_SIZE {
        return Err(AesGcmSystemError::MalformedCiphertext(
            "Ciphertext is too short".to_string(),
        ));
    }
    let (nonce, rest) = combined.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);
    decrypt(key, nonce, ciphertext, tag, additional_data)
}
