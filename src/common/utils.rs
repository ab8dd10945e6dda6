use base64::{Engine as _, engine::general_purpose};
use rand_core::{OsError, OsRng, TryRngCore};

/// 从操作系统随机源生成指定长度的随机字节
pub fn random_bytes(len: usize) -> Result<Vec<u8>, OsError> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes)
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode_b64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::STANDARD.decode(text)
}

/// Serde adapter storing a byte vector as a standard Base64 string.
pub(crate) mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_b64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::decode_b64(&text).map_err(D::Error::custom)
    }
}
