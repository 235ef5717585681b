//! Passphrase protection for the account key at rest.
//!
//! The 32-byte Ed25519 seed is sealed with ChaCha20-Poly1305 under a key
//! stretched from the passphrase with Argon2id. The public key is stored in
//! the clear next to it so the account can be identified without unlocking.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

const KEYSTORE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SEED_AAD: &[u8] = b"mau-account-key-v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeystoreError {
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("corrupt account key file: {0}")]
    Corrupt(&'static str),
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

/// Argon2id cost parameters, persisted so they can be raised later without
/// breaking existing accounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

/// The serialized account key file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedAccount {
    version: u8,
    pub name: String,
    pub email: String,
    public_key: String,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    sealed_seed: String,
}

impl SealedAccount {
    /// Seals `key` under `passphrase`.
    pub fn seal(
        key: &SigningKey,
        name: &str,
        email: &str,
        passphrase: &str,
        kdf: KdfParams,
    ) -> Result<Self, KeystoreError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let wrap_key = stretch(passphrase, &salt, kdf)?;
        let seed = Zeroizing::new(key.to_bytes());
        let sealed_seed = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_slice()))
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: seed.as_slice(),
                    aad: SEED_AAD,
                },
            )
            .map_err(|_| KeystoreError::Kdf("sealing the account key failed".into()))?;

        Ok(Self {
            version: KEYSTORE_VERSION,
            name: name.to_owned(),
            email: email.to_owned(),
            public_key: hex::encode(key.verifying_key().as_bytes()),
            kdf,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            sealed_seed: hex::encode(sealed_seed),
        })
    }

    /// Public key stored alongside the sealed seed.
    pub fn public_key(&self) -> Result<VerifyingKey, KeystoreError> {
        let bytes: [u8; 32] = decode(&self.public_key, "public_key")?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeystoreError::Corrupt("public_key"))
    }

    /// Recovers the signing key. A key that does not match the stored public
    /// key is reported as corruption, a failed authentication tag as a wrong
    /// passphrase.
    pub fn unseal(&self, passphrase: &str) -> Result<SigningKey, KeystoreError> {
        if self.version != KEYSTORE_VERSION {
            return Err(KeystoreError::Corrupt("unsupported version"));
        }
        let salt: [u8; SALT_LEN] = decode(&self.salt, "salt")?;
        let nonce: [u8; NONCE_LEN] = decode(&self.nonce, "nonce")?;
        let sealed = hex::decode(&self.sealed_seed).map_err(|_| KeystoreError::Corrupt("sealed_seed"))?;

        let wrap_key = stretch(passphrase, &salt, self.kdf)?;
        let seed = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_slice()))
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: SEED_AAD,
                },
            )
            .map_err(|_| KeystoreError::WrongPassphrase)?;
        let seed = Zeroizing::new(seed);
        let seed: &[u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::Corrupt("seed length"))?;

        let key = SigningKey::from_bytes(seed);
        if key.verifying_key() != self.public_key()? {
            return Err(KeystoreError::Corrupt("key does not match public_key"));
        }
        Ok(key)
    }
}

fn stretch(passphrase: &str, salt: &[u8], kdf: KdfParams) -> Result<Zeroizing<[u8; 32]>, KeystoreError> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(32))
        .map_err(|e| KeystoreError::Kdf(e.to_string()))?;
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| KeystoreError::Kdf(e.to_string()))?;
    Ok(key)
}

fn decode<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N], KeystoreError> {
    hex::decode(value)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(KeystoreError::Corrupt(field))
}

#[cfg(test)]
pub(crate) const TEST_KDF: KdfParams = KdfParams {
    m_cost: 64,
    t_cost: 1,
    p_cost: 1,
};
