//! The local account: identity key, trust store and published files.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError};
use crate::fingerprint::Fingerprint;
use crate::fs::{FilenameError, sanitize_filename, write_atomic};
use crate::identity::{IdentityError, PublicIdentity};
use crate::keystore::{KdfParams, KeystoreError, SealedAccount};
use crate::store::{ENCRYPTED_SUFFIX, Layout, plain_name};
use crate::tls::{self, CertKeyPair};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("friend {0} not found")]
    FriendNotFound(Fingerprint),
    #[error("an account already exists at {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("no account at {}", .0.display())]
    NotFound(PathBuf),
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("corrupt account: {0}")]
    CorruptAccount(String),
    #[error("invalid file name: {0}")]
    InvalidFileName(#[from] FilenameError),
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<KeystoreError> for AccountError {
    fn from(e: KeystoreError) -> Self {
        match e {
            KeystoreError::WrongPassphrase => Self::WrongPassphrase,
            other => Self::CorruptAccount(other.to_string()),
        }
    }
}

/// A peer's public identity as held by an account.
///
/// Keeps the identity document exactly as it was imported so that
/// [`Friend::identity`] hands back the bytes the friend exported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Friend {
    identity: PublicIdentity,
    raw: Arc<[u8]>,
}

impl Friend {
    fn parse(raw: Vec<u8>) -> Result<Self, IdentityError> {
        let identity = PublicIdentity::from_bytes(&raw)?;
        Ok(Self {
            identity,
            raw: raw.into(),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn email(&self) -> &str {
        self.identity.email()
    }

    pub fn public_key(&self) -> &VerifyingKey {
        self.identity.public_key()
    }

    /// The exportable identity document of this friend.
    pub fn identity(&self) -> &[u8] {
        &self.raw
    }
}

/// Relationship between an account and a fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustState {
    Unknown,
    Known,
    /// Known and subscribed to; the only state that authorizes sync.
    Followed,
}

#[derive(Clone, Debug)]
enum FriendEntry {
    Known(Friend),
    Followed(Friend),
}

impl FriendEntry {
    fn friend(&self) -> &Friend {
        match self {
            Self::Known(f) | Self::Followed(f) => f,
        }
    }

    fn state(&self) -> TrustState {
        match self {
            Self::Known(_) => TrustState::Known,
            Self::Followed(_) => TrustState::Followed,
        }
    }
}

/// A stored encrypted file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub path: PathBuf,
    pub modified_at: SystemTime,
    pub size: u64,
}

/// An opened account.
///
/// The private key never leaves this type; callers encrypt, decrypt and
/// build TLS material through it.
pub struct Account {
    layout: Layout,
    key: SigningKey,
    identity: PublicIdentity,
    friends: RwLock<HashMap<Fingerprint, FriendEntry>>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("root", &self.layout.root())
            .field("fingerprint", &self.identity.fingerprint())
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Creates a new account with a fresh keypair under `root`.
    pub fn create(
        root: impl Into<PathBuf>,
        name: &str,
        email: &str,
        passphrase: &str,
    ) -> Result<Self, AccountError> {
        Self::create_with_kdf(root, name, email, passphrase, KdfParams::default())
    }

    /// Like [`Account::create`] with explicit Argon2 cost parameters.
    pub fn create_with_kdf(
        root: impl Into<PathBuf>,
        name: &str,
        email: &str,
        passphrase: &str,
        kdf: KdfParams,
    ) -> Result<Self, AccountError> {
        let layout = Layout::new(root);
        let account_file = layout.account_file();
        if account_file.exists() {
            return Err(AccountError::AlreadyExists(layout.root().to_path_buf()));
        }

        let key = SigningKey::generate(&mut OsRng);
        let sealed = SealedAccount::seal(&key, name, email, passphrase, kdf)?;
        let json = serde_json::to_vec_pretty(&sealed)
            .map_err(|e| AccountError::CorruptAccount(e.to_string()))?;
        write_atomic(&account_file, &json, None)?;
        std::fs::create_dir_all(layout.following_dir())?;

        let identity = PublicIdentity::sign(&key, name, email);
        std::fs::create_dir_all(layout.files_dir(&identity.fingerprint()))?;
        info!(fingerprint = %identity.fingerprint(), root = %layout.root().display(), "Account created");

        Ok(Self {
            layout,
            key,
            identity,
            friends: RwLock::new(HashMap::new()),
        })
    }

    /// Unlocks the account under `root` and loads its friends and follows.
    pub fn open(root: impl Into<PathBuf>, passphrase: &str) -> Result<Self, AccountError> {
        let layout = Layout::new(root);
        let sealed = read_sealed(&layout)?;
        let key = sealed.unseal(passphrase)?;
        let identity = PublicIdentity::sign(&key, &sealed.name, &sealed.email);

        let friends = load_friends(&layout, &identity.fingerprint())?;
        debug!(fingerprint = %identity.fingerprint(), friends = friends.len(), "Account opened");

        Ok(Self {
            layout,
            key,
            identity,
            friends: RwLock::new(friends),
        })
    }

    /// Reads the public identity of the account under `root` without
    /// unlocking it.
    pub fn peek(root: impl Into<PathBuf>) -> Result<(Fingerprint, String, String), AccountError> {
        let sealed = read_sealed(&Layout::new(root))?;
        let key = sealed.public_key()?;
        Ok((Fingerprint::of(&key), sealed.name, sealed.email))
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn email(&self) -> &str {
        self.identity.email()
    }

    pub fn public_identity(&self) -> &PublicIdentity {
        &self.identity
    }

    /// The identity document to hand out to friends.
    pub fn export(&self) -> Result<Vec<u8>, AccountError> {
        Ok(self.identity.to_bytes()?)
    }

    /// Self-signed TLS certificate whose key is the account key.
    pub fn certificate(&self) -> anyhow::Result<CertKeyPair> {
        tls::self_signed_cert(&self.key, &self.fingerprint())
    }

    // ── Trust store ─────────────────────────────────────────────

    /// Imports a friend's exported identity.
    ///
    /// Re-adding an existing friend replaces the stored record and keeps the
    /// follow state.
    pub fn add_friend(&self, mut reader: impl Read) -> Result<Friend, AccountError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        let friend = Friend::parse(raw)?;
        let fp = friend.fingerprint();
        if fp == self.fingerprint() {
            return Err(IdentityError::OwnIdentity.into());
        }

        let mut friends = self.friends.write().unwrap_or_else(PoisonError::into_inner);
        write_atomic(&self.layout.friend_file(&fp), friend.identity(), None)?;
        let entry = match friends.get(&fp) {
            Some(FriendEntry::Followed(_)) => {
                write_atomic(&self.layout.follow_marker(&fp), friend.identity(), None)?;
                FriendEntry::Followed(friend.clone())
            }
            _ => FriendEntry::Known(friend.clone()),
        };
        friends.insert(fp, entry);
        info!(fingerprint = %fp, name = friend.name(), "Friend added");
        Ok(friend)
    }

    /// Forgets a friend and its follow. Removing an unknown friend succeeds.
    pub fn remove_friend(&self, fp: &Fingerprint) -> Result<(), AccountError> {
        let mut friends = self.friends.write().unwrap_or_else(PoisonError::into_inner);
        remove_if_exists(&self.layout.friend_file(fp))?;
        if friends.remove(fp).is_some() {
            info!(fingerprint = %fp, "Friend removed");
        }
        // A marker left behind is an orphan and is discarded at next open.
        remove_if_exists(&self.layout.follow_marker(fp))?;
        Ok(())
    }

    pub fn follow(&self, fp: &Fingerprint) -> Result<(), AccountError> {
        let mut friends = self.friends.write().unwrap_or_else(PoisonError::into_inner);
        let friend = friends
            .get(fp)
            .map(|entry| entry.friend().clone())
            .ok_or(AccountError::FriendNotFound(*fp))?;
        write_atomic(&self.layout.follow_marker(fp), friend.identity(), None)?;
        friends.insert(*fp, FriendEntry::Followed(friend));
        info!(fingerprint = %fp, "Following friend");
        Ok(())
    }

    /// Stops following. A known friend that is not followed is left alone.
    pub fn unfollow(&self, fp: &Fingerprint) -> Result<(), AccountError> {
        let mut friends = self.friends.write().unwrap_or_else(PoisonError::into_inner);
        match friends.get(fp) {
            None => Err(AccountError::FriendNotFound(*fp)),
            Some(FriendEntry::Known(_)) => Ok(()),
            Some(FriendEntry::Followed(friend)) => {
                let friend = friend.clone();
                remove_if_exists(&self.layout.follow_marker(fp))?;
                friends.insert(*fp, FriendEntry::Known(friend));
                info!(fingerprint = %fp, "Unfollowed friend");
                Ok(())
            }
        }
    }

    pub fn friend(&self, fp: &Fingerprint) -> Option<Friend> {
        let friends = self.friends.read().unwrap_or_else(PoisonError::into_inner);
        friends.get(fp).map(|entry| entry.friend().clone())
    }

    /// The friend behind `fp` if, and only if, it is followed.
    pub fn followed_friend(&self, fp: &Fingerprint) -> Option<Friend> {
        let friends = self.friends.read().unwrap_or_else(PoisonError::into_inner);
        match friends.get(fp) {
            Some(FriendEntry::Followed(friend)) => Some(friend.clone()),
            _ => None,
        }
    }

    pub fn trust_state(&self, fp: &Fingerprint) -> TrustState {
        let friends = self.friends.read().unwrap_or_else(PoisonError::into_inner);
        friends.get(fp).map_or(TrustState::Unknown, FriendEntry::state)
    }

    /// All friends with their trust state, ordered by name.
    pub fn friends(&self) -> Vec<(Friend, TrustState)> {
        let friends = self.friends.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = friends
            .values()
            .map(|entry| (entry.friend().clone(), entry.state()))
            .collect();
        all.sort_by(|(a, _), (b, _)| {
            a.name()
                .cmp(b.name())
                .then_with(|| a.fingerprint().cmp(&b.fingerprint()))
        });
        all
    }

    pub fn followed(&self) -> Vec<Friend> {
        self.friends()
            .into_iter()
            .filter(|(_, state)| *state == TrustState::Followed)
            .map(|(friend, _)| friend)
            .collect()
    }

    // ── Files ───────────────────────────────────────────────────

    /// Encrypts the content of `reader` for `recipients` (and this account)
    /// and publishes it as `name`.
    pub fn add_file(
        &self,
        mut reader: impl Read,
        name: &str,
        recipients: &[Friend],
    ) -> Result<FileRecord, AccountError> {
        let name = sanitize_filename(name)?;
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext)?;

        let mut keys = vec![self.key.verifying_key()];
        for friend in recipients {
            if !keys.contains(friend.public_key()) {
                keys.push(*friend.public_key());
            }
        }
        let sealed = crypto::seal(&plaintext, &keys)?;

        let path = self.layout.file_path(&self.fingerprint(), name);
        write_atomic(&path, &sealed, None)?;
        let record = record_at(name, path)?;
        info!(name, recipients = recipients.len(), size = record.size, "File published");
        Ok(record)
    }

    pub fn remove_file(&self, name: &str) -> Result<(), AccountError> {
        let name = sanitize_filename(name)?;
        let path = self.layout.file_path(&self.fingerprint(), name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(AccountError::FileNotFound(name.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    /// Own published files modified strictly after `since`, oldest first.
    pub fn files_since(&self, since: SystemTime) -> Result<Vec<FileRecord>, AccountError> {
        self.files_of(&self.fingerprint(), since)
    }

    /// Files stored under `owner`'s directory modified strictly after
    /// `since`, oldest first.
    pub fn files_of(&self, owner: &Fingerprint, since: SystemTime) -> Result<Vec<FileRecord>, AccountError> {
        let dir = self.layout.files_dir(owner);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(plain_name) else {
                continue;
            };
            if sanitize_filename(name).is_err() {
                continue;
            }
            let record = record_at(name, entry.path())?;
            if record.modified_at > since {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.name.cmp(&b.name)));
        Ok(records)
    }

    /// Decrypts a stored file owned by `owner` (this account or a friend).
    pub fn read_file(&self, owner: &Fingerprint, name: &str) -> Result<Vec<u8>, AccountError> {
        let name = sanitize_filename(name)?;
        let path = self.layout.file_path(owner, name);
        let sealed = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AccountError::FileNotFound(name.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.open_payload(&sealed)?)
    }

    /// Decrypts a sealed payload with the account key.
    pub fn open_payload(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open(sealed, &self.key)
    }

    /// Atomically stores a downloaded payload from `owner`, keeping the
    /// remote modification time.
    pub fn store_download(
        &self,
        owner: &Fingerprint,
        name: &str,
        payload: &[u8],
        modified_at: SystemTime,
    ) -> Result<PathBuf, AccountError> {
        let name = sanitize_filename(name)?;
        let path = self.layout.file_path(owner, name);
        write_atomic(&path, payload, Some(modified_at))?;
        debug!(owner = %owner, name, "Stored download");
        Ok(path)
    }
}

fn read_sealed(layout: &Layout) -> Result<SealedAccount, AccountError> {
    let account_file = layout.account_file();
    let json = match std::fs::read(&account_file) {
        Ok(json) => json,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AccountError::NotFound(layout.root().to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&json).map_err(|e| AccountError::CorruptAccount(e.to_string()))
}

fn load_friends(layout: &Layout, own: &Fingerprint) -> Result<HashMap<Fingerprint, FriendEntry>, AccountError> {
    let mut friends = HashMap::new();
    for entry in std::fs::read_dir(layout.config_dir())? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(fp) = file_name
            .to_str()
            .and_then(|name| name.strip_suffix(ENCRYPTED_SUFFIX))
            .and_then(|stem| stem.parse::<Fingerprint>().ok())
        else {
            continue;
        };
        let friend = match Friend::parse(std::fs::read(entry.path())?) {
            Ok(friend) if friend.fingerprint() == fp && fp != *own => friend,
            Ok(_) => {
                warn!(fingerprint = %fp, "Friend record does not match its file name, ignoring");
                continue;
            }
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "Unreadable friend record, ignoring");
                continue;
            }
        };
        friends.insert(fp, FriendEntry::Known(friend));
    }

    let following = match std::fs::read_dir(layout.following_dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(friends),
        Err(e) => return Err(e.into()),
    };
    for entry in following {
        let entry = entry?;
        let fp = entry.file_name().to_str().and_then(|name| name.parse::<Fingerprint>().ok());
        match fp.and_then(|fp| friends.remove(&fp).map(|e| (fp, e))) {
            Some((fp, entry)) => {
                friends.insert(fp, FriendEntry::Followed(entry.friend().clone()));
            }
            None => {
                debug!(marker = %entry.path().display(), "Discarding orphan follow marker");
                if let Err(e) = remove_if_exists(&entry.path()) {
                    warn!(marker = %entry.path().display(), error = %e, "Could not discard orphan follow marker");
                }
            }
        }
    }
    Ok(friends)
}

fn record_at(name: &str, path: PathBuf) -> Result<FileRecord, AccountError> {
    let metadata = std::fs::metadata(&path)?;
    Ok(FileRecord {
        name: name.to_owned(),
        modified_at: metadata.modified()?,
        size: metadata.len(),
        path,
    })
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
