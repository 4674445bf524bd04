use super::{Connection, Transport, TransportFactory};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelOpenFailure, Disconnect};
use russh_keys::key;
use sshsocks_common::{AuthMethod, Result, TunnelConfig, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Keepalive cadence; a session missing `KEEPALIVE_MAX` replies is torn down
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 3;

/// russh event handler.
///
/// The session task owns the handler, so the handler being dropped is the
/// signal that the session is gone. `_alive` is never written; its drop
/// wakes every `wait_for_close` caller.
struct ClientHandler {
    _alive: watch::Sender<()>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Host keys are not pinned.
        debug!("SSH: accepting host key {}", server_public_key.fingerprint());
        Ok(true)
    }
}

/// Transport backed by one russh client session
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    alive: watch::Receiver<()>,
    remote: String,
}

impl SshTransport {
    /// Connect and authenticate against the server named in `config`
    pub async fn connect(config: &TunnelConfig) -> Result<Self> {
        let auth = config.auth()?;
        let remote = config.server_endpoint();

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let (alive_tx, alive_rx) = watch::channel(());
        let handler = ClientHandler { _alive: alive_tx };

        debug!("SSH: connecting to {}", remote);
        let mut handle = tokio::time::timeout(
            config.connect_timeout(),
            client::connect(ssh_config, remote.as_str(), handler),
        )
        .await
        .map_err(|_| TunnelError::establish(format!("timed out connecting to {}", remote)))?
        .map_err(|e| TunnelError::establish(format!("connect to {}: {}", remote, e)))?;

        let authenticated = match auth {
            AuthMethod::Password(password) => handle
                .authenticate_password(config.username.as_str(), password)
                .await
                .map_err(|e| TunnelError::establish(format!("password auth: {}", e)))?,
            AuthMethod::PrivateKey(path) => {
                let key_pair = russh_keys::load_secret_key(&path, None).map_err(|e| {
                    TunnelError::establish(format!("load key {}: {}", path.display(), e))
                })?;
                handle
                    .authenticate_publickey(config.username.as_str(), Arc::new(key_pair))
                    .await
                    .map_err(|e| TunnelError::establish(format!("public key auth: {}", e)))?
            }
        };

        if !authenticated {
            return Err(TunnelError::establish(format!(
                "server {} rejected credentials for {}",
                remote, config.username
            )));
        }

        info!("SSH: connected to {} as {}", remote, config.username);

        Ok(Self {
            handle,
            alive: alive_rx,
            remote,
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn dial(&self, addr: SocketAddr) -> Result<Connection> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(addr.ip().to_string(), addr.port().into(), "127.0.0.1", 0)
            .await
            .map_err(|e| match e {
                russh::Error::ChannelOpenFailure(ChannelOpenFailure::ConnectFailed) => {
                    TunnelError::DialRefused {
                        addr,
                        reason: e.to_string(),
                    }
                }
                russh::Error::SendError | russh::Error::Disconnect => {
                    TunnelError::closed(format!("session with {} is gone", self.remote))
                }
                other => TunnelError::Dial {
                    addr,
                    reason: other.to_string(),
                },
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn wait_for_close(&self) -> TunnelError {
        let mut alive = self.alive.clone();
        // Nothing is ever sent; `changed` only returns once the handler drops.
        while alive.changed().await.is_ok() {}
        TunnelError::closed(format!("session with {} ended", self.remote))
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("SSH: disconnect from {} failed: {}", self.remote, e);
        }
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }
}

/// Factory producing a new `SshTransport` from a fixed configuration
pub struct SshTransportFactory {
    config: Arc<TunnelConfig>,
}

impl SshTransportFactory {
    pub fn new(config: Arc<TunnelConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for SshTransportFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let transport = SshTransport::connect(&self.config).await?;
        Ok(Arc::new(transport))
    }
}
