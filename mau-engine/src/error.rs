use thiserror::Error;

use mau_core::crypto::CryptoError;
use mau_core::fingerprint::Fingerprint;
use mau_core::fs::FilenameError;

use crate::context::Interrupted;

/// Why a call to [`Client::download_friend`](crate::client::Client::download_friend) failed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The fingerprint is not a friend, or is a friend that is not followed.
    /// Raised before any network activity.
    #[error("friend {0} is not followed")]
    FriendNotFollowed(Fingerprint),
    #[error("no resolver found an address for {0}")]
    AddressNotFound(Fingerprint),
    #[error("could not reach {fingerprint} at {}", addresses.join(", "))]
    Unreachable {
        fingerprint: Fingerprint,
        addresses: Vec<String>,
    },
    /// The server proved ownership of a different key. Never retried.
    #[error("peer presented certificate for {actual}, expected {expected}")]
    IncorrectPeerCertificate {
        expected: Fingerprint,
        actual: Fingerprint,
    },
    #[error("sync timed out")]
    Timeout,
    #[error("sync cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer reported {code}: {message}")]
    Remote { code: String, message: String },
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
}

impl From<Interrupted> for SyncError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Timeout => Self::Timeout,
            Interrupted::Cancelled => Self::Cancelled,
        }
    }
}

/// Why a single received record was not stored. Never aborts a sync.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid file name: {0}")]
    InvalidName(#[from] FilenameError),
    #[error("decryption failed: {0}")]
    Decryption(CryptoError),
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("could not store file: {0}")]
    Storage(String),
}
