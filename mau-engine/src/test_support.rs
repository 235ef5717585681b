//! Accounts and servers for engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use mau_core::account::{Account, Friend};
use mau_core::keystore::KdfParams;
use mau_core::transport::{Connector, Listener};

use crate::quic::{QuicConnection, QuicConnector, QuicListenerFactory};
use crate::server::{ServeConfig, Server};

const FAST_KDF: KdfParams = KdfParams {
    m_cost: 64,
    t_cost: 1,
    p_cost: 1,
};

pub fn new_account(name: &str) -> (TempDir, Arc<Account>) {
    let dir = tempfile::tempdir().unwrap();
    let email = format!("{}@example.com", name.to_lowercase().replace(' ', "."));
    let account = Account::create_with_kdf(dir.path(), name, &email, "password", FAST_KDF).unwrap();
    (dir, Arc::new(account))
}

pub fn befriend(account: &Account, other: &Account) -> Friend {
    account.add_friend(other.export().unwrap().as_slice()).unwrap()
}

pub fn serve_config() -> ServeConfig {
    ServeConfig {
        advertise: false,
        drain_timeout: Duration::from_secs(2),
    }
}

/// A server for `account` listening on an ephemeral localhost port.
pub struct RunningServer {
    pub addr: String,
    pub server: Arc<Server>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    pub async fn start(account: &Arc<Account>) -> Self {
        Self::start_on(account, "127.0.0.1:0", serve_config()).await
    }

    pub async fn start_on(account: &Arc<Account>, bind: &str, config: ServeConfig) -> Self {
        let factory = QuicListenerFactory::new(account).unwrap();
        let server = Arc::new(Server::with_factory(Arc::clone(account), factory, config));
        let listener = server.bind(bind).await.unwrap();
        let addr = listener.local_addr();
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });
        Self { addr, server, task }
    }

    pub async fn stop(self) {
        self.server.close();
        self.task.await.unwrap().unwrap();
    }
}

/// Counts dial attempts, delegating to QUIC.
#[derive(Clone)]
pub struct CountingConnector {
    inner: Arc<QuicConnector>,
    attempts: Arc<AtomicUsize>,
}

impl CountingConnector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QuicConnector::new().unwrap()),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for CountingConnector {
    type Conn = QuicConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(addr)
    }
}

/// Binds nothing usable: a UDP port that was just released.
pub fn dead_address() -> String {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().to_string()
}

