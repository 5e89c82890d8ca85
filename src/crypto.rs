//! Cryptography module for per-file encryption and package signatures.
//!
//! Files are encrypted with AES-256-CTR: the keystream is seekable and the
//! ciphertext has the same length as the plaintext, which is what makes
//! mid-file resume possible. A write interrupted by the time budget returns
//! its IV to the caller, and the resuming call re-supplies that IV verbatim
//! and seeks the keystream to the saved byte position.

use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::WprimeError;

pub const KEY_SIZE: usize = 32; // 256 bits for AES-256
pub const IV_SIZE: usize = 16; // 128-bit CTR counter block
pub const SALT_SIZE: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Incremental cipher for one file's byte stream.
pub struct FileCipher {
    inner: Aes256Ctr,
    iv: [u8; IV_SIZE],
}

impl FileCipher {
    /// Start a cipher at byte zero. An empty `iv` means "generate a fresh IV
    /// for this file"; a non-empty one must be exactly [`IV_SIZE`] bytes.
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8]) -> Result<Self, WprimeError> {
        let iv: [u8; IV_SIZE] = if iv.is_empty() {
            generate_iv()
        } else {
            iv.try_into().map_err(|_| {
                WprimeError::Crypto(format!("IV must be {} bytes, got {}", IV_SIZE, iv.len()))
            })?
        };
        let inner = Aes256Ctr::new(key.into(), &iv.into());
        Ok(FileCipher { inner, iv })
    }

    /// Continue an interrupted file at `position` with the IV the yield
    /// returned. A fresh IV here would corrupt the ciphertext stream, so an
    /// empty IV is rejected.
    pub fn resume_at(key: &[u8; KEY_SIZE], iv: &[u8], position: u64) -> Result<Self, WprimeError> {
        if iv.is_empty() {
            return Err(WprimeError::Crypto(
                "resuming mid-file requires the IV from the interrupted run".into(),
            ));
        }
        let mut cipher = FileCipher::new(key, iv)?;
        cipher
            .inner
            .try_seek(position)
            .map_err(|e| WprimeError::Crypto(format!("keystream seek failed: {}", e)))?;
        Ok(cipher)
    }

    pub fn iv(&self) -> [u8; IV_SIZE] {
        self.iv
    }

    /// Encrypt or decrypt `buf` in place (CTR is symmetric).
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

/// Signature binding an archive to its exporting site and options. Computed
/// once at finalization time, not per file.
pub fn encryption_signature(key: &[u8; KEY_SIZE], blog_id: u64, export_options: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&blog_id.to_le_bytes());
    mac.update(export_options.as_bytes());
    to_hex(&mac.finalize().into_bytes())
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
