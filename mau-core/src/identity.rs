//! Exportable public identities.
//!
//! An identity is a JSON document carrying an Ed25519 public key, a name and
//! an email, bound together by a self-signature from the same key. It is the
//! blob an account hands out so that others can add it as a friend.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Identity document format understood by this build.
pub const IDENTITY_VERSION: u8 = 1;

/// Domain separator for identity self-signatures.
const SIGNATURE_CONTEXT: &[u8] = b"mau-identity-v1";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed identity document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported identity version: {0}")]
    UnsupportedVersion(u8),
    #[error("identity field `{0}` is not valid hex")]
    InvalidEncoding(&'static str),
    #[error("identity public key is not a valid Ed25519 key")]
    InvalidKey,
    #[error("identity self-signature does not verify")]
    InvalidSignature,
    #[error("identity belongs to this account")]
    OwnIdentity,
}

#[derive(Serialize, Deserialize)]
struct IdentityDocument {
    version: u8,
    public_key: String,
    name: String,
    email: String,
    signature: String,
}

/// A verified public identity: key, name, email and its self-signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicIdentity {
    key: VerifyingKey,
    name: String,
    email: String,
    signature: Signature,
    fingerprint: Fingerprint,
}

impl PublicIdentity {
    /// Builds the identity for `key`, signing name and email with it.
    #[must_use]
    pub fn sign(key: &SigningKey, name: &str, email: &str) -> Self {
        let public = key.verifying_key();
        let signature = key.sign(&signed_message(&public, name, email));
        Self {
            fingerprint: Fingerprint::of(&public),
            key: public,
            name: name.to_owned(),
            email: email.to_owned(),
            signature,
        }
    }

    /// Parses and verifies an exported identity.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let doc: IdentityDocument = serde_json::from_slice(bytes)?;
        if doc.version != IDENTITY_VERSION {
            return Err(IdentityError::UnsupportedVersion(doc.version));
        }

        let key_bytes: [u8; 32] = decode_fixed(&doc.public_key, "public_key")?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::InvalidKey)?;

        let sig_bytes: [u8; 64] = decode_fixed(&doc.signature, "signature")?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify_strict(&signed_message(&key, &doc.name, &doc.email), &signature)
            .map_err(|_| IdentityError::InvalidSignature)?;

        Ok(Self {
            fingerprint: Fingerprint::of(&key),
            key,
            name: doc.name,
            email: doc.email,
            signature,
        })
    }

    /// Serializes the identity into its exportable form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        let doc = IdentityDocument {
            version: IDENTITY_VERSION,
            public_key: hex::encode(self.key.as_bytes()),
            name: self.name.clone(),
            email: self.email.clone(),
            signature: hex::encode(self.signature.to_bytes()),
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

fn decode_fixed<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N], IdentityError> {
    hex::decode(value)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(IdentityError::InvalidEncoding(field))
}

/// Length-prefixed encoding so that `("ab", "c")` and `("a", "bc")` sign differently.
fn signed_message(key: &VerifyingKey, name: &str, email: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 32 + 8 + name.len() + email.len());
    msg.extend_from_slice(SIGNATURE_CONTEXT);
    msg.extend_from_slice(key.as_bytes());
    for field in [name, email] {
        #[allow(clippy::cast_possible_truncation)] // names and emails are far below 4 GiB
        msg.extend_from_slice(&(field.len() as u32).to_be_bytes());
        msg.extend_from_slice(field.as_bytes());
    }
    msg
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn sample() -> (SigningKey, PublicIdentity) {
        let key = SigningKey::generate(&mut OsRng);
        let identity = PublicIdentity::sign(&key, "Mohamed Mahmoud", "mohamed@example.com");
        (key, identity)
    }

    #[test]
    fn given_exported_identity_when_imported_then_fields_match() {
        let (key, identity) = sample();
        let imported = PublicIdentity::from_bytes(&identity.to_bytes().unwrap()).unwrap();
        assert_eq!(imported.name(), "Mohamed Mahmoud");
        assert_eq!(imported.email(), "mohamed@example.com");
        assert_eq!(imported.fingerprint(), Fingerprint::of(&key.verifying_key()));
        assert_eq!(imported, identity);
    }

    #[test]
    fn given_imported_identity_when_exported_again_then_bytes_are_identical() {
        let (_, identity) = sample();
        let bytes = identity.to_bytes().unwrap();
        let again = PublicIdentity::from_bytes(&bytes).unwrap().to_bytes().unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn given_garbage_when_imported_then_malformed() {
        let err = PublicIdentity::from_bytes(b"not an identity").unwrap_err();
        assert!(matches!(err, IdentityError::Malformed(_)));
    }

    #[test]
    fn given_tampered_name_when_imported_then_signature_rejected() {
        let (_, identity) = sample();
        let text = String::from_utf8(identity.to_bytes().unwrap()).unwrap();
        let tampered = text.replace("Mohamed Mahmoud", "Mallory");
        let err = PublicIdentity::from_bytes(tampered.as_bytes()).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidSignature));
    }

    #[test]
    fn given_future_version_when_imported_then_unsupported() {
        let (_, identity) = sample();
        let mut doc: serde_json::Value = serde_json::from_slice(&identity.to_bytes().unwrap()).unwrap();
        doc["version"] = serde_json::json!(9);
        let err = PublicIdentity::from_bytes(&serde_json::to_vec(&doc).unwrap()).unwrap_err();
        assert!(matches!(err, IdentityError::UnsupportedVersion(9)));
    }

    #[test]
    fn given_truncated_key_when_imported_then_invalid_encoding() {
        let (_, identity) = sample();
        let mut doc: serde_json::Value = serde_json::from_slice(&identity.to_bytes().unwrap()).unwrap();
        doc["public_key"] = serde_json::json!("abcd");
        let err = PublicIdentity::from_bytes(&serde_json::to_vec(&doc).unwrap()).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidEncoding("public_key")));
    }

    #[test]
    fn given_swapped_field_boundaries_when_signed_then_messages_differ() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        assert_ne!(signed_message(&key, "ab", "c"), signed_message(&key, "a", "bc"));
    }
}
