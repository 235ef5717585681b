//! # mau-core
//!
//! Shared building blocks for mau, friend-to-friend encrypted file
//! distribution.
//!
//! This crate provides the foundational types used by [`mau-engine`] and the
//! `mau` binary.
//!
//! ## Responsibilities
//!
//! - **Identity**: Ed25519 account keys, fingerprints, and the exportable,
//!   self-signed identity document friends exchange.
//!
//! - **Trust store**: the account's friends and which of them are followed,
//!   persisted under the account root.
//!
//! - **Payload crypto**: per-recipient encryption of published files.
//!
//! - **Protocol primitives**: frame format (magic / version / type / length),
//!   JSON payloads for the sync exchange, and transport traits.
//!
//! - **Filesystem helpers**: filename sanitisation and atomic writes.

pub mod account;
pub mod crypto;
pub mod fingerprint;
pub mod fs;
pub mod identity;
pub mod keystore;
pub mod protocol;
pub mod store;
pub mod tls;
pub mod transport;

pub use account::{Account, AccountError, FileRecord, Friend, TrustState};
pub use fingerprint::Fingerprint;
