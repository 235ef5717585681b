//! Downloads a followed friend's new files.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use mau_core::account::Account;
use mau_core::crypto::CryptoError;
use mau_core::fingerprint::Fingerprint;
use mau_core::fs::sanitize_filename;
use mau_core::protocol::{
    self, ErrorPayload, FileHeaderPayload, Frame, FrameReader, MessageType, SyncRequestPayload,
};
use mau_core::transport::{Connection, Connector};

use crate::context::SyncContext;
use crate::error::{RecordError, SyncError};
use crate::quic::QuicConnector;
use crate::resolver::FingerprintResolver;

/// Largest buffer reserved up front for an incoming file.
const MAX_PREALLOC: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Budget for each connection attempt, within the caller's deadline.
    pub connect_timeout: Duration,
    /// Files announced as larger than this are received but not stored.
    pub max_file_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_file_size: 256 * 1024 * 1024,
        }
    }
}

/// Where a sync currently stands. Logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncPhase {
    TrustChecked,
    Resolved,
    Connected,
    Streaming,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TrustChecked => "trust-checked",
            Self::Resolved => "resolved",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A file written to disk by a sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub path: PathBuf,
    pub modified_at: SystemTime,
    pub size: u64,
}

/// A record that was received but could not be stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordFailure {
    pub name: String,
    pub error: RecordError,
}

/// Outcome of a successful [`Client::download_friend`].
#[derive(Clone, Debug)]
pub struct SyncReport {
    pub friend: Fingerprint,
    /// Address the friend was reached at.
    pub address: String,
    pub stored: Vec<StoredFile>,
    /// Records not encrypted for this account.
    pub skipped: usize,
    pub failures: Vec<RecordFailure>,
    /// Newest modification time among stored and skipped records, held
    /// strictly below the oldest failed record so the next sync offers it
    /// again. Pass it as `since` next time to resume; `None` means keep the
    /// previous `since`.
    pub watermark: Option<SystemTime>,
    earliest_failure: Option<SystemTime>,
}

impl SyncReport {
    fn new(friend: Fingerprint, address: String) -> Self {
        Self {
            friend,
            address,
            stored: Vec::new(),
            skipped: 0,
            failures: Vec::new(),
            watermark: None,
            earliest_failure: None,
        }
    }

    fn advance(&mut self, modified_at: SystemTime) {
        if self.watermark.is_none_or(|w| w < modified_at) {
            self.watermark = Some(modified_at);
        }
        self.hold_below_failure();
    }

    fn fail(&mut self, modified_at: SystemTime, failure: RecordFailure) {
        if self.earliest_failure.is_none_or(|f| modified_at < f) {
            self.earliest_failure = Some(modified_at);
        }
        self.failures.push(failure);
        self.hold_below_failure();
    }

    fn hold_below_failure(&mut self) {
        let (Some(watermark), Some(failed)) = (self.watermark, self.earliest_failure) else {
            return;
        };
        if watermark >= failed {
            self.watermark = failed.checked_sub(Duration::from_nanos(1));
        }
    }
}

pub struct Client<K: Connector = QuicConnector> {
    account: Arc<Account>,
    connector: K,
    config: SyncConfig,
}

impl Client<QuicConnector> {
    pub fn new(account: Arc<Account>, config: SyncConfig) -> anyhow::Result<Self> {
        Ok(Self::with_connector(account, QuicConnector::new()?, config))
    }
}

impl<K: Connector> Client<K> {
    pub fn with_connector(account: Arc<Account>, connector: K, config: SyncConfig) -> Self {
        Self {
            account,
            connector,
            config,
        }
    }

    /// Fetches every file `fingerprint` published after `since` and keeps
    /// those encrypted for this account.
    ///
    /// `fingerprint` must be a followed friend; this is checked before any
    /// resolver runs. Resolvers are tried in order, all within `ctx`. A peer
    /// proving a different key ends the call at once.
    pub async fn download_friend(
        &self,
        ctx: &SyncContext,
        fingerprint: &Fingerprint,
        since: SystemTime,
        resolvers: &[&dyn FingerprintResolver],
    ) -> Result<SyncReport, SyncError> {
        let result = self.sync(ctx, fingerprint, since, resolvers).await;
        match &result {
            Ok(report) => info!(
                friend = %fingerprint,
                address = %report.address,
                stored = report.stored.len(),
                skipped = report.skipped,
                failed = report.failures.len(),
                "Sync complete"
            ),
            Err(e) => warn!(friend = %fingerprint, error = %e, "Sync failed"),
        }
        result
    }

    async fn sync(
        &self,
        ctx: &SyncContext,
        fingerprint: &Fingerprint,
        since: SystemTime,
        resolvers: &[&dyn FingerprintResolver],
    ) -> Result<SyncReport, SyncError> {
        if self.account.followed_friend(fingerprint).is_none() {
            return Err(SyncError::FriendNotFollowed(*fingerprint));
        }
        enter(SyncPhase::TrustChecked, fingerprint);

        let (mut conn, address) = self.connect(ctx, fingerprint, resolvers).await?;
        enter(SyncPhase::Connected, fingerprint);

        let mut report = SyncReport::new(*fingerprint, address);
        let streamed = match ctx.run(self.receive(&mut conn, since, &mut report)).await {
            Ok(streamed) => streamed,
            Err(interrupted) => Err(interrupted.into()),
        };
        conn.close().await;
        streamed?;

        enter(SyncPhase::Done, fingerprint);
        Ok(report)
    }

    /// Walks the resolvers until one yields an address that accepts a
    /// connection from the expected key.
    async fn connect(
        &self,
        ctx: &SyncContext,
        fingerprint: &Fingerprint,
        resolvers: &[&dyn FingerprintResolver],
    ) -> Result<(K::Conn, String), SyncError> {
        let mut tried = Vec::new();

        for resolver in resolvers {
            if let Some(interrupted) = ctx.interrupted() {
                return Err(interrupted.into());
            }
            let Some(address) = resolver.resolve(ctx, fingerprint).await else {
                debug!(friend = %fingerprint, resolver = ?resolver, "No address from resolver");
                continue;
            };
            enter(SyncPhase::Resolved, fingerprint);

            let attempt = ctx.child(Some(self.config.connect_timeout));
            let mut conn = match attempt.run(self.connector.connect(&address)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!(friend = %fingerprint, address = %address, error = %format!("{e:#}"), "Connection attempt failed");
                    tried.push(address);
                    continue;
                }
                Err(interrupted) => {
                    if let Some(outer) = ctx.interrupted() {
                        return Err(outer.into());
                    }
                    warn!(friend = %fingerprint, address = %address, reason = %interrupted, "Connection attempt abandoned");
                    tried.push(address);
                    continue;
                }
            };

            match conn.peer_fingerprint() {
                Some(actual) if actual == *fingerprint => return Ok((conn, address)),
                Some(actual) => {
                    conn.close().await;
                    return Err(SyncError::IncorrectPeerCertificate {
                        expected: *fingerprint,
                        actual,
                    });
                }
                None => {
                    conn.close().await;
                    return Err(SyncError::Transport(anyhow::anyhow!(
                        "{address} did not authenticate"
                    )));
                }
            }
        }

        if let Some(interrupted) = ctx.interrupted() {
            return Err(interrupted.into());
        }
        if tried.is_empty() {
            Err(SyncError::AddressNotFound(*fingerprint))
        } else {
            Err(SyncError::Unreachable {
                fingerprint: *fingerprint,
                addresses: tried,
            })
        }
    }

    async fn receive(
        &self,
        conn: &mut K::Conn,
        since: SystemTime,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        protocol::write_payload(conn, MessageType::SyncRequest, &SyncRequestPayload { since })
            .await
            .map_err(SyncError::Transport)?;
        enter(SyncPhase::Streaming, &report.friend);

        let mut reader = FrameReader::new();
        loop {
            let frame = next_frame(&mut reader, conn).await?;
            match frame.header.msg_type {
                MessageType::FileHeader => {
                    let header: FileHeaderPayload = protocol::decode_payload(&frame.payload)
                        .map_err(|e| SyncError::Protocol(format!("malformed file header: {e}")))?;
                    let payload = self.receive_body(&mut reader, conn, &header).await?;
                    self.record(report, &header, payload.as_deref());
                }
                MessageType::EndOfStream => return Ok(()),
                MessageType::Error => {
                    let error: ErrorPayload = protocol::decode_payload(&frame.payload)
                        .map_err(|e| SyncError::Protocol(format!("malformed error frame: {e}")))?;
                    return Err(SyncError::Remote {
                        code: error.code,
                        message: error.message,
                    });
                }
                other => return Err(SyncError::Protocol(format!("unexpected {other:?} frame"))),
            }
        }
    }

    /// Reads the chunks following `header`. Returns `None` when the file is
    /// over the size limit; its chunks are consumed and dropped.
    async fn receive_body(
        &self,
        reader: &mut FrameReader,
        conn: &mut K::Conn,
        header: &FileHeaderPayload,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        let keep = header.size <= self.config.max_file_size;
        let capacity = usize::try_from(header.size.min(MAX_PREALLOC)).unwrap_or_default();
        let mut body = keep.then(|| Vec::with_capacity(capacity));

        let mut received = 0u64;
        while received < header.size {
            let frame = next_frame(reader, conn).await?;
            if frame.header.msg_type != MessageType::FileChunk {
                return Err(SyncError::Protocol(format!(
                    "{:?} frame inside {}",
                    frame.header.msg_type, header.name
                )));
            }
            let len = frame.payload.len() as u64;
            if len == 0 || received + len > header.size {
                return Err(SyncError::Protocol(format!(
                    "chunks of {} exceed the announced {} bytes",
                    header.name, header.size
                )));
            }
            received += len;
            if let Some(body) = body.as_mut() {
                body.extend_from_slice(&frame.payload);
            }
        }
        Ok(body)
    }

    fn record(&self, report: &mut SyncReport, header: &FileHeaderPayload, payload: Option<&[u8]>) {
        let outcome = match payload {
            Some(payload) => self.store(&report.friend, header, payload),
            None => Err(RecordError::TooLarge {
                size: header.size,
                limit: self.config.max_file_size,
            }),
        };
        match outcome {
            Ok(Some(stored)) => {
                debug!(name = %stored.name, path = %stored.path.display(), "Record stored");
                report.advance(header.modified_at);
                report.stored.push(stored);
            }
            Ok(None) => {
                debug!(name = %header.name, "Not a recipient, skipping");
                report.advance(header.modified_at);
                report.skipped += 1;
            }
            Err(error) => {
                warn!(name = %header.name, error = %error, "Record not stored");
                report.fail(
                    header.modified_at,
                    RecordFailure {
                        name: header.name.clone(),
                        error,
                    },
                );
            }
        }
    }

    /// Verifies the record decrypts for this account, then persists it still
    /// encrypted. `Ok(None)` means it was meant for someone else.
    fn store(
        &self,
        owner: &Fingerprint,
        header: &FileHeaderPayload,
        payload: &[u8],
    ) -> Result<Option<StoredFile>, RecordError> {
        let name = sanitize_filename(&header.name)?;
        match self.account.open_payload(payload) {
            Ok(_) => {}
            Err(CryptoError::NotRecipient) => return Ok(None),
            Err(e) => return Err(RecordError::Decryption(e)),
        }
        let path = self
            .account
            .store_download(owner, name, payload, header.modified_at)
            .map_err(|e| RecordError::Storage(e.to_string()))?;
        Ok(Some(StoredFile {
            name: name.to_owned(),
            path,
            modified_at: header.modified_at,
            size: payload.len() as u64,
        }))
    }
}

fn enter(phase: SyncPhase, friend: &Fingerprint) {
    debug!(friend = %friend, phase = %phase, "Sync phase");
}

async fn next_frame<C: Connection>(reader: &mut FrameReader, conn: &mut C) -> Result<Frame, SyncError> {
    reader
        .next_frame(conn)
        .await
        .map_err(SyncError::Transport)?
        .ok_or_else(|| SyncError::Protocol("stream ended before the end-of-stream marker".into()))
}
