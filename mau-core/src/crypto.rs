//! Per-recipient payload encryption.
//!
//! A sealed payload carries one key slot per recipient followed by the body.
//! The body is ChaCha20-Poly1305 under a random content key, authenticated
//! together with the header. Each slot wraps the content key for one
//! recipient: an ephemeral X25519 public key plus the content key encrypted
//! under HKDF-SHA256 of the Diffie-Hellman secret. Recipient X25519 keys are
//! the Montgomery form of their Ed25519 identity keys, so one keypair serves
//! both signing and decryption.
//!
//! Layout:
//!
//! ```text
//! "MAUE" | version u8 | slot count u16 | slots (32 + 48 bytes each) | nonce (12) | body
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"MAUE";
const VERSION: u8 = 0x01;
const PREFIX_LEN: usize = MAGIC.len() + 1 + 2;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SLOT_LEN: usize = KEY_LEN + KEY_LEN + TAG_LEN;
const WRAP_INFO: &[u8] = b"mau file key v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// None of the key slots opens with the local key.
    #[error("not an intended recipient of this payload")]
    NotRecipient,
    #[error("corrupt payload: {0}")]
    Corrupt(&'static str),
    #[error("too many recipients: {0}")]
    TooManyRecipients(usize),
    #[error("payload encryption failed")]
    Encrypt,
}

/// Encrypts `plaintext` so that exactly the holders of `recipients` can open it.
pub fn seal(plaintext: &[u8], recipients: &[VerifyingKey]) -> Result<Vec<u8>, CryptoError> {
    let slot_count =
        u16::try_from(recipients.len()).map_err(|_| CryptoError::TooManyRecipients(recipients.len()))?;

    let mut content_key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(content_key.as_mut_slice());

    let mut out = Vec::with_capacity(
        PREFIX_LEN + recipients.len() * SLOT_LEN + NONCE_LEN + plaintext.len() + TAG_LEN,
    );
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&slot_count.to_be_bytes());

    for recipient in recipients {
        let recipient = montgomery_public(recipient);
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);
        let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, &recipient)?;
        let wrapped = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_slice()))
            .encrypt(&Nonce::default(), content_key.as_slice())
            .map_err(|_| CryptoError::Encrypt)?;
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&wrapped);
    }

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let header_len = out.len();
    out.extend_from_slice(&nonce);

    let body = ChaCha20Poly1305::new(Key::from_slice(content_key.as_slice()))
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &out[..header_len],
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypts a sealed payload with the local identity key.
///
/// Returns [`CryptoError::NotRecipient`] when no slot was addressed to
/// `key`, and [`CryptoError::Corrupt`] for anything structurally wrong or
/// failing authentication after the content key was recovered.
pub fn open(sealed: &[u8], key: &SigningKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < PREFIX_LEN {
        return Err(CryptoError::Corrupt("truncated header"));
    }
    if &sealed[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::Corrupt("bad magic"));
    }
    if sealed[MAGIC.len()] != VERSION {
        return Err(CryptoError::Corrupt("unsupported version"));
    }
    let slot_count = usize::from(u16::from_be_bytes([sealed[PREFIX_LEN - 2], sealed[PREFIX_LEN - 1]]));
    let header_len = PREFIX_LEN + slot_count * SLOT_LEN;
    if sealed.len() < header_len + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Corrupt("truncated payload"));
    }

    let scalar = Zeroizing::new(key.to_scalar_bytes());
    let secret = StaticSecret::from(*scalar);
    let own_public = PublicKey::from(&secret);

    let content_key = sealed[PREFIX_LEN..header_len]
        .chunks_exact(SLOT_LEN)
        .find_map(|slot| unwrap_slot(slot, &secret, &own_public))
        .ok_or(CryptoError::NotRecipient)?;

    let nonce = &sealed[header_len..header_len + NONCE_LEN];
    ChaCha20Poly1305::new(Key::from_slice(content_key.as_slice()))
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &sealed[header_len + NONCE_LEN..],
                aad: &sealed[..header_len],
            },
        )
        .map_err(|_| CryptoError::Corrupt("body failed authentication"))
}

fn unwrap_slot(
    slot: &[u8],
    secret: &StaticSecret,
    own_public: &PublicKey,
) -> Option<Zeroizing<[u8; KEY_LEN]>> {
    let ephemeral: [u8; KEY_LEN] = slot[..KEY_LEN].try_into().ok()?;
    let ephemeral = PublicKey::from(ephemeral);
    let shared = secret.diffie_hellman(&ephemeral);
    if !shared.was_contributory() {
        return None;
    }
    let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral, own_public).ok()?;
    let content_key = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_slice()))
        .decrypt(&Nonce::default(), &slot[KEY_LEN..])
        .ok()?;
    let content_key: [u8; KEY_LEN] = content_key.try_into().ok()?;
    Some(Zeroizing::new(content_key))
}

// Each wrap key is used exactly once (fresh ephemeral per slot), so a zero
// nonce is sound for the slot encryption.
fn derive_wrap_key(
    shared: &[u8; KEY_LEN],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    Hkdf::<Sha256>::new(Some(&salt[..]), shared)
        .expand(WRAP_INFO, okm.as_mut_slice())
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(okm)
}

fn montgomery_public(key: &VerifyingKey) -> PublicKey {
    PublicKey::from(key.to_montgomery().to_bytes())
}
