use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Invalid CONFIG_ENC_KEY: must be 32 bytes (hex or base64)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Secret blob is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Secret blob is truncated")]
    Malformed,

    #[error("Secret authentication failed: wrong key or tampered data")]
    Authentication,

    #[error("Decrypted secret is not valid UTF-8")]
    Utf8,
}

/**
 * \brief 对称加密保险库：AES-256-GCM，随机 96 位 nonce，128 位 tag。
 *
 * 密文格式：base64(nonce ‖ tag ‖ ciphertext)。密钥在进程启动时加载一次，之后只读。
 */
#[derive(Clone)]
pub struct Vault {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Vault { key: <redacted> }")
    }
}

impl Vault {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /**
     * \brief 解析 hex（64 字符）或 base64 编码的 32 字节密钥。
     */
    pub fn from_encoded(raw: &str) -> Result<Self, VaultError> {
        let raw = raw.trim();
        let bytes = if raw.len() == KEY_LENGTH * 2 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(raw).map_err(|_| VaultError::InvalidKey)?
        } else if !raw.is_empty() {
            BASE64.decode(raw).map_err(|_| VaultError::InvalidKey)?
        } else {
            return Err(VaultError::InvalidKey);
        };
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { key })
    }

    /**
     * \brief 生成一个新的随机密钥（hex 编码），供 `keygen` 使用。
     */
    pub fn generate_key_hex() -> String {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    /**
     * \brief 加密明文；`None` 输入返回 `None`。
     */
    pub fn encrypt(&self, plaintext: Option<&str>) -> Result<Option<String>, VaultError> {
        let Some(plaintext) = plaintext else {
            return Ok(None);
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce, b"", &mut buffer)
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LENGTH + TAG_LENGTH + buffer.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(tag.as_slice());
        blob.extend_from_slice(&buffer);
        Ok(Some(BASE64.encode(blob)))
    }

    /**
     * \brief 解密密文；`None` 或空串返回 `None`，tag 校验失败返回 `Authentication`。
     */
    pub fn decrypt(&self, blob: Option<&str>) -> Result<Option<String>, VaultError> {
        let blob = match blob {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(None),
        };
        let bytes = BASE64.decode(blob)?;
        if bytes.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(VaultError::Malformed);
        }
        let nonce = Nonce::from_slice(&bytes[..NONCE_LENGTH]);
        let tag = Tag::from_slice(&bytes[NONCE_LENGTH..NONCE_LENGTH + TAG_LENGTH]);
        let mut buffer = bytes[NONCE_LENGTH + TAG_LENGTH..].to_vec();

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt_in_place_detached(nonce, b"", &mut buffer, tag)
            .map_err(|_| VaultError::Authentication)?;

        String::from_utf8(buffer)
            .map(Some)
            .map_err(|_| VaultError::Utf8)
    }
}
