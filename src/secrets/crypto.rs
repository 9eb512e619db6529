//! Encryption for the file backend.
//!
//! - AES-256-GCM for secrets at rest
//! - Argon2id to turn the user's password and a per-file salt into a key

use crate::Result;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, bail};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// AES-256-GCM nonce size (96 bits)
const NONCE_SIZE: usize = 12;
/// AES-256 key size (256 bits)
const KEY_SIZE: usize = 32;
/// KDF salt size
pub(super) const SALT_SIZE: usize = 16;

/// Argon2id cost: 19 MiB, 2 passes, 1 lane.
#[cfg(not(test))]
const KDF_MEMORY_KIB: u32 = 19 * 1024;
#[cfg(not(test))]
const KDF_ITERATIONS: u32 = 2;

#[cfg(test)]
const KDF_MEMORY_KIB: u32 = Params::MIN_M_COST;
#[cfg(test)]
const KDF_ITERATIONS: u32 = Params::MIN_T_COST;

const KDF_PARALLELISM: u32 = 1;

/// Returns a fresh random salt.
pub(super) fn new_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives the AES key for one file from the password and that file's salt.
pub(super) fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let params = Params::new(
        KDF_MEMORY_KIB,
        KDF_ITERATIONS,
        KDF_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow!("Invalid key derivation parameters: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut())
        .map_err(|e| anyhow!("Key derivation failed: {e}"))?;
    Ok(key)
}

/// Encrypt plaintext bytes with AES-256-GCM.
/// Returns: nonce (12 bytes) || ciphertext+tag
pub(super) fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {e}"))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data produced by `encrypt()`.
pub(super) fn decrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        bail!("Ciphertext too short");
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    // GCM authentication failure is the only error here, and with a good file that means the
    // password is wrong.
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| anyhow!("Decryption failed, the keyring password may be wrong"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let salt = new_salt();
        let key = derive_key("hunter2", &salt).unwrap();
        let sealed = encrypt(&key, b"refresh-token").unwrap();
        assert_ne!(b"refresh-token".as_slice(), &sealed[NONCE_SIZE..]);
        assert_eq!(b"refresh-token".to_vec(), decrypt(&key, &sealed).unwrap());
    }

    #[test]
    fn test_wrong_password() {
        let salt = new_salt();
        let key = derive_key("hunter2", &salt).unwrap();
        let sealed = encrypt(&key, b"refresh-token").unwrap();
        let wrong = derive_key("hunter3", &salt).unwrap();
        assert!(decrypt(&wrong, &sealed).is_err());
        assert!(decrypt(&key, &sealed[..4]).is_err());
    }

    #[test]
    fn test_derive_key_depends_on_salt() {
        let a = derive_key("hunter2", &new_salt()).unwrap();
        let b = derive_key("hunter2", &new_salt()).unwrap();
        assert_ne!(*a, *b);
        let salt = new_salt();
        assert_eq!(
            *derive_key("hunter2", &salt).unwrap(),
            *derive_key("hunter2", &salt).unwrap()
        );
    }
}
