//! Serves an account's published files to whoever asks.
//!
//! Every request receives the full catalog newer than the requested instant.
//! Files are encrypted per recipient, so the server does not filter: a client
//! that is not a recipient simply cannot open what it receives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mau_core::account::{Account, FileRecord};
use mau_core::protocol::{
    self, ERROR_BAD_REQUEST, ERROR_INTERNAL, FileHeaderPayload, FrameReader, MAX_PAYLOAD_LEN,
    MessageType, SyncRequestPayload,
};
use mau_core::transport::{Connection, Listener, ListenerFactory};

use crate::discovery::Advertiser;
use crate::quic::QuicListenerFactory;

/// Server behaviour knobs.
#[derive(Clone, Debug)]
pub struct ServeConfig {
    /// Register the account on the local network while serving.
    pub advertise: bool,
    /// How long [`Server::serve`] waits for in-flight connections after
    /// [`Server::close`], and how long each connection waits for its peer
    /// to hang up.
    pub drain_timeout: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            advertise: true,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Server<F: ListenerFactory = QuicListenerFactory> {
    account: Arc<Account>,
    factory: F,
    config: ServeConfig,
    shutdown: CancellationToken,
}

impl Server<QuicListenerFactory> {
    /// A QUIC server presenting the account's certificate.
    pub fn new(account: Arc<Account>, config: ServeConfig) -> anyhow::Result<Self> {
        let factory = QuicListenerFactory::new(&account)?;
        Ok(Self::with_factory(account, factory, config))
    }
}

impl<F: ListenerFactory> Server<F> {
    pub fn with_factory(account: Arc<Account>, factory: F, config: ServeConfig) -> Self {
        Self {
            account,
            factory,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn bind(&self, addr: &str) -> anyhow::Result<F::L> {
        self.factory.bind(addr).await
    }

    /// Accepts connections on `listener` until [`close`](Self::close) is
    /// called, then drains in-flight connections.
    ///
    /// A failing connection never stops the loop. Only a listener that can no
    /// longer accept ends it early, with an error.
    pub async fn serve(&self, mut listener: F::L) -> anyhow::Result<()> {
        let local_addr = listener.local_addr();
        let _advertiser = if self.config.advertise {
            self.advertise(&local_addr)
        } else {
            None
        };
        info!(addr = %local_addr, fingerprint = %self.account.fingerprint(), "Serving");

        let mut tasks = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    debug!("Server close requested");
                    break Ok(());
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task panicked");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        debug!(peer = %conn.peer(), "Connection accepted");
                        tasks.spawn(handle_connection(
                            Arc::clone(&self.account),
                            conn,
                            self.config.drain_timeout,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "Listener stopped accepting");
                        break Err(e);
                    }
                },
            }
        };
        drop(listener);

        if !tasks.is_empty() {
            info!(connections = tasks.len(), "Draining connections");
            let drained = tokio::time::timeout(self.config.drain_timeout, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(connections = tasks.len(), "Abandoning connections after drain timeout");
                tasks.abort_all();
            }
        }
        info!(addr = %local_addr, "Server stopped");
        outcome
    }

    /// Stops accepting; [`serve`](Self::serve) returns once drained.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled by [`close`](Self::close), for wiring to signals.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn advertise(&self, local_addr: &str) -> Option<Advertiser> {
        let port = match local_addr.parse::<SocketAddr>() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(addr = %local_addr, error = %e, "Cannot advertise a non-socket address");
                return None;
            }
        };
        match Advertiser::register(&self.account.fingerprint(), port) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Local network advertisement unavailable");
                None
            }
        }
    }
}

async fn handle_connection<C: Connection>(account: Arc<Account>, mut conn: C, linger: Duration) {
    let peer = conn.peer();
    match serve_catalog(&account, &mut conn).await {
        Ok(Some(sent)) => info!(peer = %peer, files = sent, "Catalog sent"),
        Ok(None) => debug!(peer = %peer, "Peer left without a request"),
        Err(e) => warn!(peer = %peer, error = %format!("{e:#}"), "Sync request failed"),
    }
    // Dropping a QUIC connection discards unsent data; let the client hang up.
    if tokio::time::timeout(linger, conn.closed()).await.is_err() {
        debug!(peer = %peer, "Peer did not close in time");
    }
}

/// Answers one sync request. Returns the number of files sent, or `None`
/// when the peer left before asking for anything.
async fn serve_catalog<C: Connection>(account: &Account, conn: &mut C) -> anyhow::Result<Option<usize>> {
    let request = match read_request(conn).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(None),
        Err(e) => {
            protocol::write_error(conn, ERROR_BAD_REQUEST, &format!("{e:#}")).await?;
            conn.shutdown().await?;
            return Err(e);
        }
    };
    debug!(peer = %conn.peer(), since = ?request.since, "Sync requested");

    let records = match account.files_since(request.since) {
        Ok(records) => records,
        Err(e) => {
            protocol::write_error(conn, ERROR_INTERNAL, "catalog unavailable").await?;
            conn.shutdown().await?;
            return Err(e).context("failed to list published files");
        }
    };

    let mut sent = 0;
    for record in &records {
        if send_file(conn, record).await? {
            sent += 1;
        }
    }

    protocol::write_frame(conn, MessageType::EndOfStream, &[]).await?;
    conn.shutdown().await?;
    Ok(Some(sent))
}

async fn read_request<C: Connection>(conn: &mut C) -> anyhow::Result<Option<SyncRequestPayload>> {
    let Some(frame) = FrameReader::new().next_frame(conn).await? else {
        return Ok(None);
    };
    if frame.header.msg_type != MessageType::SyncRequest {
        return Err(anyhow!("expected a sync request, got {:?}", frame.header.msg_type));
    }
    protocol::decode_payload(&frame.payload)
        .map(Some)
        .context("malformed sync request")
}

/// Streams one file as a header followed by chunks. Files deleted since the
/// listing are skipped.
async fn send_file<C: Connection>(conn: &mut C, record: &FileRecord) -> anyhow::Result<bool> {
    let mut file = match tokio::fs::File::open(&record.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(name = %record.name, "File vanished before sending");
            return Ok(false);
        }
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", record.path.display())),
    };
    let size = file.metadata().await?.len();

    let header = FileHeaderPayload {
        name: record.name.clone(),
        modified_at: record.modified_at,
        size,
    };
    protocol::write_payload(conn, MessageType::FileHeader, &header).await?;

    let mut chunk = vec![0u8; MAX_PAYLOAD_LEN];
    let mut remaining = size;
    while remaining > 0 {
        let len = usize::try_from(remaining).map_or(MAX_PAYLOAD_LEN, |r| r.min(MAX_PAYLOAD_LEN));
        file.read_exact(&mut chunk[..len])
            .await
            .with_context(|| format!("{} shrank while being sent", record.name))?;
        protocol::write_frame(conn, MessageType::FileChunk, &chunk[..len]).await?;
        remaining -= len as u64;
    }
    debug!(name = %record.name, size, "File sent");
    Ok(true)
}
