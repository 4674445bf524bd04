/// Remote transport for sshsocks
///
/// The proxy never opens sockets to destinations itself. Every outbound
/// connection is a channel on one authenticated remote session:
/// - `Transport` is the live session (dial, liveness, close)
/// - `TransportFactory` establishes a fresh session on demand

mod ssh;

pub use ssh::{SshTransport, SshTransportFactory};

use async_trait::async_trait;
use sshsocks_common::{Result, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream returned by a dial
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A dialed TCP connection carried over the transport
pub type Connection = Box<dyn ProxyStream>;

/// An authenticated remote session able to open TCP connections.
///
/// `dial` is called concurrently from every client task, so implementations
/// must be `Sync` and must not serialize dials behind a session-wide lock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a TCP connection to `addr` from the remote side
    async fn dial(&self, addr: SocketAddr) -> Result<Connection>;

    /// Block until the session ends and return why it ended
    async fn wait_for_close(&self) -> TunnelError;

    /// Close the session; connections dialed through it fail afterwards
    async fn close(&self);

    /// Human-readable peer description for logs
    fn remote(&self) -> String;
}

/// Produces a new authenticated transport per call.
///
/// Authentication, host verification, and network failures all surface as
/// `TunnelError::TransportEstablish`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}
