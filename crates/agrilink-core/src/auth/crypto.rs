//! At-rest encryption for the persisted session file.
//!
//! The key is derived with Argon2 from a device secret and a random salt, and
//! the payload is sealed with ChaCha20-Poly1305. Salt and nonce travel with
//! the ciphertext.

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const SEALED_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct SealedBlob {
    version: u8,
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn derive_key(secret: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
    Ok(key)
}

/// Encrypt `plaintext` under `secret`, returning a self-describing blob.
pub fn seal(secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(secret, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("Encryption failed"))?;

    let blob = SealedBlob {
        version: SEALED_VERSION,
        salt: salt.to_vec(),
        nonce: nonce.to_vec(),
        ciphertext,
    };
    serde_json::to_vec(&blob).context("Failed to serialize sealed blob")
}

/// Decrypt a blob produced by [`seal`]. Fails on a wrong secret or tampering.
pub fn open(secret: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let blob: SealedBlob = serde_json::from_slice(sealed).context("Malformed sealed blob")?;
    if blob.version != SEALED_VERSION {
        return Err(anyhow!("Unsupported sealed blob version {}", blob.version));
    }
    if blob.nonce.len() != NONCE_LEN {
        return Err(anyhow!("Invalid nonce length {}", blob.nonce.len()));
    }

    let key = derive_key(secret, &blob.salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map_err(|_| anyhow!("Decryption failed - wrong device secret or corrupt data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let sealed = seal(b"device-secret", b"{\"user_id\":\"u1\"}").unwrap();
        assert!(!sealed.windows(7).any(|w| w == b"user_id"));
        let opened = open(b"device-secret", &sealed).unwrap();
        assert_eq!(opened, b"{\"user_id\":\"u1\"}");
    }

    #[test]
    fn test_open_with_wrong_secret_fails() {
        let sealed = seal(b"device-secret", b"payload").unwrap();
        assert!(open(b"other-secret", &sealed).is_err());
    }

    #[test]
    fn test_open_garbage_fails() {
        assert!(open(b"device-secret", b"not a blob").is_err());
    }
}
