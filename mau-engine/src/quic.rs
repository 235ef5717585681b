use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, info};

use mau_core::account::Account;
use mau_core::fingerprint::Fingerprint;
use mau_core::tls::{self, CertKeyPair};
use mau_core::transport::{Connection, Connector, Listener, ListenerFactory};

const ALPN_PROTOCOL: &[u8] = b"mau/1";
/// Upper bound on waiting for a CONNECTION_CLOSE to be delivered.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    /// Accepts the peer's stream; the client always speaks first.
    Server,
    Client,
}

/// A QUIC connection backed by a single bi-directional stream.
///
/// Establishment is lazy on the server side: [`accept`](QuicListener::accept)
/// returns as soon as a connection attempt arrives and the TLS handshake plus
/// stream acceptance happen on the first [`read`](Connection::read) or
/// [`write_all`](Connection::write_all), inside the connection's own task.
pub struct QuicConnection {
    role: Role,
    incoming: Option<quinn::Incoming>,
    connection: Option<quinn::Connection>,
    /// Client-side endpoint, owned so it can be drained on close.
    endpoint: Option<quinn::Endpoint>,

    send: Option<quinn::SendStream>,
    recv: Option<quinn::RecvStream>,
    peer_addr: String,
    peer_fingerprint: Option<Fingerprint>,
}

impl QuicConnection {
    async fn ensure_connection(&mut self) -> anyhow::Result<&quinn::Connection> {
        if self.connection.is_none() {
            let incoming = self
                .incoming
                .take()
                .context("QUIC connection attempt already consumed")?;
            let connection = incoming
                .await
                .context("failed to complete QUIC handshake")?;
            debug!(peer = %self.peer_addr, "QUIC handshake complete");
            self.connection = Some(connection);
        }
        self.connection
            .as_ref()
            .context("QUIC connection not established")
    }

    async fn ensure_streams(&mut self) -> anyhow::Result<()> {
        if self.send.is_none() {
            let role = self.role;
            let connection = self.ensure_connection().await?;
            let (send, recv) = match role {
                Role::Server => connection
                    .accept_bi()
                    .await
                    .context("failed to accept bi-directional QUIC stream")?,
                Role::Client => connection
                    .open_bi()
                    .await
                    .context("failed to open bi-directional QUIC stream")?,
            };
            self.send = Some(send);
            self.recv = Some(recv);
        }
        Ok(())
    }
}

impl Connection for QuicConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_fingerprint
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.ensure_streams().await?;
            let n = self
                .recv
                .as_mut()
                .context("QUIC stream not established")?
                .read(buf)
                .await
                .context("failed to read from QUIC stream")?;
            Ok(n.unwrap_or(0))
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.ensure_streams().await?;
            self.send
                .as_mut()
                .context("QUIC stream not established")?
                .write_all(buf)
                .await
                .context("failed to write to QUIC stream")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            if let Some(ref mut send) = self.send {
                send.finish().context("failed to finish QUIC send stream")
            } else {
                Ok(())
            }
        }
    }

    fn closed(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            if let Some(connection) = &self.connection {
                let reason = connection.closed().await;
                debug!(peer = %self.peer_addr, reason = %reason, "QUIC connection closed");
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            if let Some(connection) = &self.connection {
                connection.close(0u32.into(), b"done");
            }
            if let Some(endpoint) = &self.endpoint {
                let _ = tokio::time::timeout(CLOSE_LINGER, endpoint.wait_idle()).await;
            }
        }
    }
}

/// A QUIC listener wrapping a [`quinn::Endpoint`].
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    local_addr: String,
}

impl Listener for QuicListener {
    type Conn = QuicConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let incoming = self
                .endpoint
                .accept()
                .await
                .context("QUIC endpoint closed")?;

            let peer_addr = incoming.remote_address().to_string();
            debug!(peer = %peer_addr, "Incoming QUIC connection");

            Ok(QuicConnection {
                role: Role::Server,
                incoming: Some(incoming),
                connection: None,
                endpoint: None,
                send: None,
                recv: None,
                peer_addr,
                peer_fingerprint: None,
            })
        }
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        // Refuse new handshakes; connections already accepted keep running.
        self.endpoint.set_server_config(None);
    }
}

/// Factory that binds [`QuicListener`] instances presenting the account's
/// certificate.
pub struct QuicListenerFactory {
    server_config: quinn::ServerConfig,
}

impl QuicListenerFactory {
    pub fn new(account: &Account) -> anyhow::Result<Self> {
        let pair = account.certificate()?;
        Ok(Self {
            server_config: build_server_config(pair)?,
        })
    }
}

impl ListenerFactory for QuicListenerFactory {
    type L = QuicListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let socket_addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid bind address: {addr}"))?;

            let endpoint = quinn::Endpoint::server(self.server_config.clone(), socket_addr)
                .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;

            let local_addr = endpoint
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();

            info!(addr = %local_addr, "QUIC listener bound");

            Ok(QuicListener {
                endpoint,
                local_addr,
            })
        }
    }
}

/// Dials QUIC servers and records the fingerprint each one proves during the
/// handshake. Which fingerprint is acceptable is decided by the caller.
pub struct QuicConnector {
    client_config: quinn::ClientConfig,
}

impl QuicConnector {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client_config: build_client_config()?,
        })
    }
}

impl Connector for QuicConnector {
    type Conn = QuicConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let target = tokio::net::lookup_host(addr)
                .await
                .with_context(|| format!("failed to resolve {addr}"))?
                .next()
                .with_context(|| format!("{addr} resolved to no address"))?;

            let bind: SocketAddr = if target.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let mut endpoint =
                quinn::Endpoint::client(bind).context("failed to create client endpoint")?;
            endpoint.set_default_client_config(self.client_config.clone());

            let connection = endpoint
                .connect(target, tls::SERVER_NAME)
                .context("invalid QUIC connect parameters")?
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;

            let peer_fingerprint = fingerprint_of(&connection);
            debug!(peer = %target, fingerprint = ?peer_fingerprint, "Connected over QUIC");

            Ok(QuicConnection {
                role: Role::Client,
                incoming: None,
                connection: Some(connection),
                endpoint: Some(endpoint),
                send: None,
                recv: None,
                peer_addr: target.to_string(),
                peer_fingerprint,
            })
        }
    }
}

fn fingerprint_of(connection: &quinn::Connection) -> Option<Fingerprint> {
    let certs = connection
        .peer_identity()?
        .downcast::<Vec<CertificateDer<'static>>>()
        .ok()?;
    tls::fingerprint_from_cert(certs.first()?).ok()
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn build_server_config(pair: CertKeyPair) -> anyhow::Result<quinn::ServerConfig> {
    let cert_der = CertificateDer::from(pair.cert_der);
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pair.private_key_pkcs8_der));

    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS versions")?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .context("failed to build rustls server config")?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicServerConfig = tls_config
        .try_into()
        .context("failed to build QUIC server config")?;

    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic_config)))
}

fn build_client_config() -> anyhow::Result<quinn::ClientConfig> {
    let provider = provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PeerKeyVerifier { provider }))
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicClientConfig = tls_config
        .try_into()
        .context("failed to build QUIC client config")?;

    Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
}

/// Accepts any self-signed certificate carrying an Ed25519 key, and checks
/// the handshake signature against that key.
///
/// There is no chain of trust: the certificate only binds the connection to
/// a key, and the caller compares the key's fingerprint with the friend it
/// meant to reach.
#[derive(Debug)]
struct PeerKeyVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PeerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        tls::fingerprint_from_cert(end_entity)
            .map(|_| ServerCertVerified::assertion())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::new_account;

    fn account() -> (TempDir, Arc<Account>) {
        new_account("Server")
    }

    async fn bound_listener() -> (TempDir, Arc<Account>, QuicListener) {
        let (dir, account) = account();
        let factory = QuicListenerFactory::new(&account).unwrap();
        let listener = factory.bind("127.0.0.1:0").await.unwrap();
        (dir, account, listener)
    }

    #[tokio::test]
    async fn given_invalid_address_when_binding_then_returns_error() {
        let (_dir, account) = account();
        let factory = QuicListenerFactory::new(&account).unwrap();
        let result = factory.bind("999.999.999.999:0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn given_valid_address_when_binding_then_returns_listener_with_local_addr() {
        let (_dir, _account, listener) = bound_listener().await;
        let addr = listener.local_addr();
        assert!(addr.starts_with("127.0.0.1:"));
        let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn given_client_connects_when_handshake_completes_then_server_fingerprint_is_proven() {
        let (_dir, account, mut listener) = bound_listener().await;
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
            conn.shutdown().await.unwrap();
            conn.closed().await;
        });

        let mut client = QuicConnector::new().unwrap().connect(&addr).await.unwrap();
        assert_eq!(client.peer_fingerprint(), Some(account.fingerprint()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        client.close().await;

        server.await.unwrap();
    }

    #[tokio::test]
    async fn given_large_payload_when_sent_and_received_then_data_is_intact() {
        let (_dir, _account, mut listener) = bound_listener().await;
        let addr = listener.local_addr();

        let payload: Vec<u8> = (0u32..131_072).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let client = tokio::spawn(async move {
            let mut conn = QuicConnector::new().unwrap().connect(&addr).await.unwrap();
            conn.write_all(&payload).await.unwrap();
            conn.shutdown().await.unwrap();
            conn.closed().await;
        });

        let mut server_conn = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = server_conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
        server_conn.close().await;

        client.await.unwrap();
    }

    #[tokio::test]
    async fn given_stalled_handshake_when_accepting_then_next_connection_is_served() {
        let (_dir, _account, mut listener) = bound_listener().await;
        let addr = listener.local_addr();

        let stalled_client = tokio::spawn({
            let addr = addr.clone();
            async move { QuicConnector::new().unwrap().connect(&addr).await.is_ok() }
        });
        let stalled = listener.accept().await.unwrap();

        let client = tokio::spawn(async move {
            let mut conn = QuicConnector::new().unwrap().connect(&addr).await.unwrap();
            conn.write_all(b"hi").await.unwrap();
            conn.shutdown().await.unwrap();
            conn.closed().await;
        });
        let mut served = listener.accept().await.unwrap();
        assert_ne!(stalled.peer(), served.peer());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), served.read(&mut buf))
            .await
            .expect("second connection blocked behind the first")
            .unwrap();
        assert_eq!(&buf[..n], b"hi");
        served.close().await;
        client.await.unwrap();

        drop(stalled);
        stalled_client.abort();
    }

    #[tokio::test]
    async fn given_nothing_listening_when_connecting_then_fails_within_timeout() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        drop(socket);

        let connector = QuicConnector::new().unwrap();
        let attempt = tokio::time::timeout(Duration::from_millis(500), connector.connect(&addr)).await;
        assert!(matches!(attempt, Err(_) | Ok(Err(_))));
    }

    #[tokio::test]
    async fn given_unresolvable_host_when_connecting_then_error() {
        let connector = QuicConnector::new().unwrap();
        assert!(connector.connect("not an address").await.is_err());
    }
}
