//! Session supervisor
//!
//! Owns one (transport, proxy) generation at a time. When the SSH session
//! dies the proxy is stopped, the transport closed, and after the reconnect
//! delay both are rebuilt on the same local port.

use crate::proxy::{ProxyState, Socks5Server};
use sshsocks_common::{ProxyConfig, ReconnectPolicy, Result, TunnelError};
use sshsocks_core::{QuitSignal, Resolver, Transport, TransportFactory};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Snapshot published on every proxy state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// 0 until the first proxy is built, then incremented per reconnect
    pub generation: u64,
    pub proxy: ProxyState,
}

/// Why a generation ended
enum Outcome {
    Shutdown,
    SessionLost(TunnelError),
    ProxyExited(Result<()>),
}

pub struct Supervisor {
    config: Arc<ProxyConfig>,
    factory: Arc<dyn TransportFactory>,
    resolver: Arc<Resolver>,
    policy: ReconnectPolicy,
    shutdown: QuitSignal,
    status: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ProxyConfig>,
        factory: Arc<dyn TransportFactory>,
        shutdown: QuitSignal,
    ) -> Self {
        let resolver = Arc::new(Resolver::from_config(&config));
        match resolver.server() {
            Some(server) => info!("Resolving destinations via {}", server),
            None => info!("Resolving destinations via the system resolver"),
        }
        let (status, _) = watch::channel(SupervisorStatus {
            generation: 0,
            proxy: ProxyState::Created,
        });

        Self {
            config,
            factory,
            resolver,
            policy: ReconnectPolicy::default(),
            shutdown,
            status,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Fatal: the first connect failing, the first proxy failing to bind,
    /// and reconnect attempts running out under the configured policy.
    pub async fn run(self) -> Result<()> {
        let mut transport = tokio::select! {
            biased;
            _ = self.shutdown.fired() => {
                info!("Shutdown requested before the tunnel came up");
                return Ok(());
            }
            connected = self.factory.connect() => connected?,
        };
        info!("SSH session established with {}", transport.remote());

        let mut generation = 0;
        loop {
            generation += 1;

            match self.run_generation(generation, transport).await {
                Outcome::Shutdown => {
                    info!("Tunnel shut down");
                    return Ok(());
                }
                Outcome::SessionLost(e) => warn!("SSH session lost: {}", e),
                Outcome::ProxyExited(Err(e @ TunnelError::Bind { .. })) if generation == 1 => {
                    error!("SOCKS5 proxy could not start: {}", e);
                    return Err(e);
                }
                Outcome::ProxyExited(Err(e)) => warn!("SOCKS5 proxy failed: {}", e),
                Outcome::ProxyExited(Ok(())) => warn!("SOCKS5 proxy exited unexpectedly"),
            }

            transport = match self.reconnect().await? {
                Some(transport) => transport,
                None => {
                    info!("Tunnel shut down while reconnecting");
                    return Ok(());
                }
            };
        }
    }

    async fn run_generation(&self, generation: u64, transport: Arc<dyn Transport>) -> Outcome {
        let (server, stop) =
            Socks5Server::new(self.config.clone(), transport.clone(), self.resolver.clone());
        let mut state = server.state();
        self.publish(generation, *state.borrow_and_update());

        debug!(
            "Starting proxy generation {} via {}",
            generation,
            transport.remote()
        );
        let mut serving = tokio::spawn(server.serve(self.config.bind_addr));
        let mut state_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.fired() => break Outcome::Shutdown,
                lost = transport.wait_for_close() => break Outcome::SessionLost(lost),
                joined = &mut serving => break Outcome::ProxyExited(flatten(joined)),
                changed = state.changed(), if state_open => match changed {
                    Ok(()) => {
                        let current = *state.borrow_and_update();
                        self.publish(generation, current);
                    }
                    Err(_) => state_open = false,
                },
            }
        };

        // Old listener must be gone before the transport goes and before
        // any later generation binds the same port.
        stop.stop();
        if !matches!(outcome, Outcome::ProxyExited(_)) {
            if let Err(e) = flatten(serving.await) {
                warn!("SOCKS5 proxy generation {} ended with error: {}", generation, e);
            }
        }
        self.publish(generation, ProxyState::Stopped);

        transport.close().await;
        debug!("Proxy generation {} torn down", generation);
        outcome
    }

    /// Wait out the delay and connect again, as often as the policy allows.
    /// `None` means shutdown arrived first.
    async fn reconnect(&self) -> Result<Option<Arc<dyn Transport>>> {
        let mut failures = 0;

        loop {
            if !self.policy.allows(failures) {
                error!("Giving up after {} failed reconnect attempts", failures);
                return Err(TunnelError::ReconnectExhausted { attempts: failures });
            }

            info!("Reconnecting in {:?}", self.policy.delay);
            tokio::select! {
                biased;
                _ = self.shutdown.fired() => return Ok(None),
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.fired() => return Ok(None),
                attempt = self.factory.connect() => attempt,
            };

            match attempt {
                Ok(transport) => {
                    info!("SSH session re-established with {}", transport.remote());
                    return Ok(Some(transport));
                }
                Err(e) => {
                    failures += 1;
                    warn!("Reconnect attempt {} failed: {}", failures, e);
                }
            }
        }
    }

    fn publish(&self, generation: u64, proxy: ProxyState) {
        self.status.send_replace(SupervisorStatus { generation, proxy });
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| TunnelError::Other(anyhow::anyhow!("proxy task failed: {}", e)))?
}
