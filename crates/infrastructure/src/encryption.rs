use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};

use scheduler_core::{SchedulerError, SchedulerResult};

const CIPHER_PREFIX: &str = "AES:";
const NONCE_LEN: usize = 12;

/// 存储值加密抽象接口
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> SchedulerResult<String>;

    /// 解密失败返回 `Decryption` 错误，不会静默吞掉
    fn decrypt(&self, ciphertext: &str) -> SchedulerResult<String>;
}

/// AES-256-GCM 加密，密钥由进程本地的密钥材料经 SHA-256 派生
///
/// 密文格式为 `AES:` + base64(随机nonce || 密文)。
pub struct ValueCipher {
    cipher: Aes256Gcm,
}

impl ValueCipher {
    pub fn new(secret: &str) -> SchedulerResult<Self> {
        if secret.is_empty() {
            return Err(SchedulerError::config_error("加密密钥不能为空"));
        }
        let key = Sha256::digest(secret.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
        })
    }
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueCipher(..)")
    }
}

impl Encryptor for ValueCipher {
    fn encrypt(&self, plaintext: &str) -> SchedulerResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SchedulerError::Encryption(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(format!(
            "{CIPHER_PREFIX}{}",
            general_purpose::STANDARD.encode(payload)
        ))
    }

    fn decrypt(&self, ciphertext: &str) -> SchedulerResult<String> {
        let encoded = ciphertext
            .strip_prefix(CIPHER_PREFIX)
            .ok_or_else(|| SchedulerError::Decryption("缺少密文前缀".to_string()))?;
        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SchedulerError::Decryption(format!("base64解码失败: {e}")))?;
        if payload.len() <= NONCE_LEN {
            return Err(SchedulerError::Decryption("密文长度不足".to_string()));
        }

        let (nonce_bytes, body) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| SchedulerError::Decryption("认证失败，密钥不匹配或数据被篡改".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| SchedulerError::Decryption(format!("明文不是有效的UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_symmetric() {
        let cipher = ValueCipher::new("node-secret").unwrap();
        let encrypted = cipher.encrypt(r#"{"host":"10.0.0.1"}"#).unwrap();
        assert!(encrypted.starts_with("AES:"));
        assert!(!encrypted.contains("10.0.0.1"));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), r#"{"host":"10.0.0.1"}"#);

        // 每次加密使用新的nonce
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn test_decrypt_with_wrong_key_is_distinct_error() {
        let encrypted = ValueCipher::new("a").unwrap().encrypt("payload").unwrap();
        let err = ValueCipher::new("b").unwrap().decrypt(&encrypted).unwrap_err();
        assert!(matches!(err, SchedulerError::Decryption(_)));
    }

    #[test]
    fn test_decrypt_malformed_input() {
        let cipher = ValueCipher::new("secret").unwrap();
        for input in ["plain", "AES:%%%", "AES:AAAA"] {
            assert!(matches!(
                cipher.decrypt(input),
                Err(SchedulerError::Decryption(_))
            ));
        }
        assert!(ValueCipher::new("").is_err());
    }
}
