use std::future::Future;

use crate::fingerprint::Fingerprint;

/// A transport-agnostic, authenticated byte stream to one peer.
///
/// Provides identity (`peer`, `peer_fingerprint`) and byte-level I/O
/// (`read`, `write_all`, `shutdown`) so the sync server and client work with
/// any transport without knowing whether it is QUIC or an in-memory pipe.
pub trait Connection: Send + 'static {
    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"127.0.0.1:54321"`).
    fn peer(&self) -> String;

    /// Fingerprint of the key the remote end proved possession of during the
    /// handshake, if the transport authenticates that side.
    fn peer_fingerprint(&self) -> Option<Fingerprint>;

    /// Reads bytes into `buf`, returning how many bytes were read.
    ///
    /// Returns `Ok(0)` when the remote end has finished its side.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;

    /// Writes the entirety of `buf` to the connection.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half of the connection, signalling to the
    /// remote end that no more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;

    /// Resolves once the remote end has closed the whole connection.
    fn closed(&mut self) -> impl Future<Output = ()> + Send + '_;

    /// Closes the whole connection and waits briefly for the close to reach
    /// the peer.
    fn close(&mut self) -> impl Future<Output = ()> + Send + '_;
}

/// An async listener that accepts incoming [`Connection`]s.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local address the listener is bound to
    /// (e.g. `"0.0.0.0:9000"`).
    fn local_addr(&self) -> String;

    /// Waits for the next inbound connection.
    ///
    /// Transports with a handshake may return before it completes; the
    /// handshake then finishes on first use of the connection so a slow peer
    /// never stalls the accept loop.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// Separating creation from usage lets the server remain generic over the
/// transport.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    ///
    /// Use `"<ip>:0"` to let the OS assign an available port.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}

/// Factory for creating outbound [`Connection`]s (client side).
///
/// This is the counterpart to [`ListenerFactory`]: where the listener
/// accepts inbound connections (server), the connector initiates outbound
/// connections (client). The returned connection has completed its
/// handshake, so [`Connection::peer_fingerprint`] is available.
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to the given address.
    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a;
}
