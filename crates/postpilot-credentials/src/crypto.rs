//! Token material encryption.
//!
//! AES-256 with PKCS7 padding and a machine-specific key derived from
//! hostname + username. Encrypted blobs are base64-encoded for storage
//! in a sqlite text column.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use postpilot_core::error::{PostPilotError, Result};
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 16;

/// Derive a machine-specific AES-256 key from hostname + username.
pub fn derive_machine_key() -> [u8; 32] {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "postpilot".into());
    let username = whoami::username();
    let salt = format!("postpilot::{username}@{hostname}::credentials");

    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    let result = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}

/// Encrypt plaintext and return a base64 blob for storage.
pub fn seal(plaintext: &str, key: &[u8; 32]) -> String {
    BASE64.encode(encrypt_aes256(plaintext.as_bytes(), key))
}

/// Decode a base64 blob and decrypt it back to plaintext.
pub fn open(blob: &str, key: &[u8; 32]) -> Result<String> {
    let encrypted = BASE64
        .decode(blob.trim())
        .map_err(|e| PostPilotError::Crypto(format!("Base64 decode failed: {e}")))?;
    let decrypted = decrypt_aes256(&encrypted, key);
    String::from_utf8(decrypted)
        .map_err(|e| PostPilotError::Crypto(format!("Decryption produced invalid UTF-8: {e}")))
}

/// AES-256-ECB encrypt with PKCS7 padding.
fn encrypt_aes256(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let cipher = Aes256::new(GenericArray::from_slice(key));

    // PKCS7 padding
    let padding_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut padded = data.to_vec();
    padded.extend(std::iter::repeat_n(padding_len as u8, padding_len));

    let mut encrypted = Vec::with_capacity(padded.len());
    for chunk in padded.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        encrypted.extend_from_slice(&block);
    }

    encrypted
}

/// AES-256-ECB decrypt with PKCS7 unpadding.
fn decrypt_aes256(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut decrypted = Vec::with_capacity(data.len());
    for chunk in data.chunks(BLOCK_SIZE) {
        if chunk.len() == BLOCK_SIZE {
            let mut block = GenericArray::clone_from_slice(chunk);
            cipher.decrypt_block(&mut block);
            decrypted.extend_from_slice(&block);
        }
    }

    // Remove PKCS7 padding
    if let Some(&pad_len) = decrypted.last() {
        let pad_len = pad_len as usize;
        if pad_len <= BLOCK_SIZE && pad_len <= decrypted.len() {
            let valid = decrypted[decrypted.len() - pad_len..]
                .iter()
                .all(|&b| b == pad_len as u8);
            if valid {
                decrypted.truncate(decrypted.len() - pad_len);
            }
        }
    }

    decrypted
}
