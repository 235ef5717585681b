//! # mau-engine
//!
//! Networking for mau, embedded into the CLI.
//!
//! This crate provides:
//! - **Server**: streams an account's published files to any peer over QUIC
//!   and advertises the account on the local network
//! - **Client**: downloads a followed friend's files, checking the key the
//!   friend proves during the handshake
//! - **Resolvers**: pluggable fingerprint to address lookup (static address,
//!   mDNS)
//! - **Sync context**: cancellation and deadlines shared by every network step

pub mod client;
pub mod context;
pub mod discovery;
pub mod error;
pub mod quic;
pub mod resolver;
pub mod server;

#[cfg(test)]
mod test_support;

pub use client::{Client, SyncConfig, SyncReport};
pub use context::SyncContext;
pub use error::{RecordError, SyncError};
pub use resolver::{FingerprintResolver, LocalFriendAddress, StaticAddress};
pub use server::{ServeConfig, Server};
