//! Wrapping-key derivation.
//!
//! The master secret is password grade, so it goes through Argon2id with a
//! fresh salt per wrap. The storage secret is treated as high-entropy key
//! material and expanded with HKDF-SHA256.

use crate::common::config::KdfConfig;
use crate::symmetric::aes_gcm::KEY_SIZE;
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Salt length used for both derivations.
pub const SALT_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("secret is empty")]
    EmptySecret,

    #[error("Argon2 derivation failed: {0}")]
    Argon2(String),

    #[error("HKDF expansion failed")]
    Hkdf,
}

/// 使用 Argon2id 从主密钥派生 256 位包装密钥。
pub fn derive_from_password(
    secret: &[u8],
    salt: &[u8],
    config: &KdfConfig,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, KdfError> {
    if secret.is_empty() {
        return Err(KdfError::EmptySecret);
    }
    let params = Params::new(
        config.memory_cost_kib,
        config.iterations,
        config.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| KdfError::Argon2(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(secret, salt, &mut okm[..])
        .map_err(|e| KdfError::Argon2(e.to_string()))?;
    Ok(okm)
}

/// 使用 HKDF-SHA256 从存储密钥派生 256 位包装密钥。
pub fn derive_from_secret(
    secret: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, KdfError> {
    if secret.is_empty() {
        return Err(KdfError::EmptySecret);
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(info, &mut okm[..]).map_err(|_| KdfError::Hkdf)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfConfig {
        KdfConfig {
            iterations: 1,
            memory_cost_kib: 8,
            parallelism: 1,
        }
    }

    #[test]
    fn password_derivation_depends_on_salt() {
        let a = derive_from_password(b"master", &[1u8; SALT_SIZE], &cheap()).unwrap();
        let b = derive_from_password(b"master", &[1u8; SALT_SIZE], &cheap()).unwrap();
        let c = derive_from_password(b"master", &[2u8; SALT_SIZE], &cheap()).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn empty_secrets_are_rejected() {
        assert!(matches!(
            derive_from_password(b"", &[0u8; SALT_SIZE], &cheap()),
            Err(KdfError::EmptySecret)
        ));
        assert!(matches!(
            derive_from_secret(b"", &[0u8; SALT_SIZE], b"info"),
            Err(KdfError::EmptySecret)
        ));
    }

    #[test]
    fn hkdf_separates_by_info() {
        let salt = [9u8; SALT_SIZE];
        let a = derive_from_secret(b"storage-secret", &salt, b"a").unwrap();
        let b = derive_from_secret(b"storage-secret", &salt, b"b").unwrap();
        assert_ne!(*a, *b);
    }
}
