use super::socks5::{handle_client, ClientContext};
use sshsocks_common::{ProxyConfig, Result, TunnelError};
use sshsocks_core::{quit_channel, QuitSignal, QuitTrigger, Resolver, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of one proxy generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    /// Accepting on the contained (actual) address
    Listening(SocketAddr),
    /// Accept loop exited; listener being released
    Draining,
    Stopped,
}

/// SOCKS5 proxy server bound to one transport.
///
/// Built fresh for every transport; `serve` consumes it.
pub struct Socks5Server {
    config: Arc<ProxyConfig>,
    transport: Arc<dyn Transport>,
    resolver: Arc<Resolver>,
    quit: QuitSignal,
    state: watch::Sender<ProxyState>,
}

/// Stops the accept loop of the server it was created with
#[derive(Debug)]
pub struct StopHandle {
    trigger: QuitTrigger,
}

impl StopHandle {
    /// Stop accepting; relays already running are left to finish
    pub fn stop(self) {
        self.trigger.fire();
    }
}

impl Socks5Server {
    /// Create a server and the handle that stops it
    pub fn new(
        config: Arc<ProxyConfig>,
        transport: Arc<dyn Transport>,
        resolver: Arc<Resolver>,
    ) -> (Self, StopHandle) {
        let (trigger, quit) = quit_channel();
        let (state, _) = watch::channel(ProxyState::Created);

        let server = Self {
            config,
            transport,
            resolver,
            quit,
            state,
        };
        (server, StopHandle { trigger })
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    /// Bind `bind_addr` and accept until stopped or the listener fails
    pub async fn serve(self, bind_addr: SocketAddr) -> Result<()> {
        let result = self.accept_loop(bind_addr).await;
        self.state.send_replace(ProxyState::Stopped);
        result
    }

    async fn accept_loop(&self, bind_addr: SocketAddr) -> Result<()> {
        if self.quit.is_fired() {
            return Ok(());
        }

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr,
                source,
            })?;
        let actual_addr = listener.local_addr()?;

        self.state.send_replace(ProxyState::Listening(actual_addr));
        info!(
            "SOCKS5 proxy listening on {} via {}",
            actual_addr,
            self.transport.remote()
        );

        let ctx = ClientContext {
            transport: self.transport.clone(),
            resolver: self.resolver.clone(),
            handshake_timeout: self.config.handshake_timeout,
            dial_timeout: self.config.dial_timeout,
        };

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = self.quit.fired() => None,
                accepted = listener.accept() => Some(accepted),
            };

            let (socket, addr) = match accepted {
                None => break Ok(()),
                Some(Ok(pair)) => pair,
                Some(Err(_)) if self.quit.is_fired() => break Ok(()),
                Some(Err(e)) => {
                    warn!("SOCKS5 accept on {} failed: {}", actual_addr, e);
                    break Err(TunnelError::from(e));
                }
            };

            if self.quit.is_fired() {
                debug!("SOCKS5: Dropping connection from {} after stop", addr);
                drop(socket);
                break Ok(());
            }

            debug!("SOCKS5: New connection from {}", addr);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, ctx).await {
                    warn!("SOCKS5 error for {}: {}", addr, e);
                }
            });
        };

        self.state.send_replace(ProxyState::Draining);
        drop(listener);
        info!("SOCKS5 proxy on {} stopped accepting", actual_addr);
        result
    }
}
