use anyhow::{Context, Result, anyhow, ensure};
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use rcgen::{CertificateParams, DnType, KeyPair};
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::parse_x509_certificate;

use crate::fingerprint::Fingerprint;

/// Server name presented in certificates and expected by clients. Identity is
/// established by fingerprint, never by name.
pub const SERVER_NAME: &str = "mau";

/// Raw DER-encoded certificate and private key material.
///
/// Produced by [`self_signed_cert`] and consumed by the QUIC transport to
/// build its TLS config.
pub struct CertKeyPair {
    pub cert_der: Vec<u8>,
    pub private_key_pkcs8_der: Vec<u8>,
}

/// Generates a self-signed certificate whose key is the account's Ed25519
/// key, so the certificate itself carries the account fingerprint.
pub fn self_signed_cert(key: &SigningKey, fingerprint: &Fingerprint) -> Result<CertKeyPair> {
    let pkcs8 = key
        .to_pkcs8_der()
        .context("failed to encode account key as PKCS#8")?;
    let key_pair = KeyPair::try_from(pkcs8.as_bytes()).context("failed to load account key")?;

    let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("invalid certificate subject")?;
    params
        .distinguished_name
        .push(DnType::CommonName, fingerprint.to_string());

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed certificate")?;

    Ok(CertKeyPair {
        cert_der: cert.der().to_vec(),
        private_key_pkcs8_der: pkcs8.as_bytes().to_vec(),
    })
}

/// Extracts the Ed25519 key from a DER certificate and returns its
/// fingerprint.
///
/// Only the `subjectPublicKeyInfo` field counts, so text in names or
/// extensions cannot impersonate the real key.
pub fn fingerprint_from_cert(cert_der: &[u8]) -> Result<Fingerprint> {
    let (_, cert) = parse_x509_certificate(cert_der)
        .map_err(|e| anyhow!("certificate is not valid DER: {e}"))?;
    let spki = cert.public_key();
    ensure!(
        spki.algorithm.algorithm == OID_SIG_ED25519,
        "certificate key is not Ed25519"
    );
    let raw = <[u8; 32]>::try_from(&*spki.subject_public_key.data)
        .context("Ed25519 key has the wrong length")?;
    let key = VerifyingKey::from_bytes(&raw).context("certificate carries an invalid Ed25519 key")?;
    Ok(Fingerprint::of(&key))
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn cert_for(key: &SigningKey) -> CertKeyPair {
        self_signed_cert(key, &Fingerprint::of(&key.verifying_key())).unwrap()
    }

    #[test]
    fn given_account_key_when_generating_cert_then_returns_non_empty_der() {
        let pair = cert_for(&SigningKey::generate(&mut OsRng));
        assert!(!pair.cert_der.is_empty());
        assert!(!pair.private_key_pkcs8_der.is_empty());
    }

    #[test]
    fn given_cert_when_fingerprinted_then_matches_account_key() {
        let key = SigningKey::generate(&mut OsRng);
        let pair = cert_for(&key);
        assert_eq!(
            fingerprint_from_cert(&pair.cert_der).unwrap(),
            Fingerprint::of(&key.verifying_key())
        );
    }

    #[test]
    fn given_two_keys_when_generating_certs_then_fingerprints_differ() {
        let a = cert_for(&SigningKey::generate(&mut OsRng));
        let b = cert_for(&SigningKey::generate(&mut OsRng));
        assert_ne!(
            fingerprint_from_cert(&a.cert_der).unwrap(),
            fingerprint_from_cert(&b.cert_der).unwrap()
        );
    }

    #[test]
    fn given_same_key_when_generating_cert_twice_then_fingerprint_stable() {
        let key = SigningKey::generate(&mut OsRng);
        assert_eq!(
            fingerprint_from_cert(&cert_for(&key).cert_der).unwrap(),
            fingerprint_from_cert(&cert_for(&key).cert_der).unwrap()
        );
    }

    #[test]
    fn given_non_ed25519_cert_when_fingerprinted_then_error() {
        let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let err = fingerprint_from_cert(other.cert.der()).unwrap_err();
        assert!(err.to_string().contains("not Ed25519"));
    }

    #[test]
    fn given_foreign_cert_naming_an_account_when_fingerprinted_then_still_rejected() {
        let victim = Fingerprint::of(&SigningKey::generate(&mut OsRng).verifying_key());
        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, victim.to_string());
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let err = fingerprint_from_cert(cert.der()).unwrap_err();
        assert!(err.to_string().contains("not Ed25519"));
    }

    #[test]
    fn given_garbage_when_fingerprinted_then_error() {
        assert!(fingerprint_from_cert(b"").is_err());
        assert!(fingerprint_from_cert(&[0x30, 0x82, 0xff]).is_err());
        assert!(fingerprint_from_cert(&[0x04, 0x00]).is_err());
    }

    #[test]
    fn given_truncated_cert_when_fingerprinted_then_error() {
        let pair = cert_for(&SigningKey::generate(&mut OsRng));
        assert!(fingerprint_from_cert(&pair.cert_der[..pair.cert_der.len() / 2]).is_err());
    }
}
