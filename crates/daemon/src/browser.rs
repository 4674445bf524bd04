use crate::proxy::ProxyState;
use crate::supervisor::SupervisorStatus;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Starts a Chromium-family browser pointed at the local SOCKS5 proxy.
///
/// The browser runs incognito with DNS prefetching off and a throwaway
/// profile directory, so every lookup goes through the tunnel's resolver.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    path: PathBuf,
    local_port: u16,
    profile_dir: PathBuf,
}

impl BrowserLauncher {
    pub fn new(path: impl Into<PathBuf>, local_port: u16) -> Self {
        Self {
            path: path.into(),
            local_port,
            profile_dir: std::env::temp_dir().join("chrome"),
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--incognito".to_string(),
            "--dns-prefetch-disable".to_string(),
            "--single-process".to_string(),
            format!("--proxy-server=socks5://localhost:{}", self.local_port),
            format!("--user-data-dir={}", self.profile_dir.display()),
        ]
    }

    /// Spawn the browser; the returned task logs its exit
    pub fn launch(&self) -> Result<JoinHandle<()>> {
        let mut child = Command::new(&self.path)
            .args(self.args())
            .spawn()
            .with_context(|| format!("Failed to launch browser {}", self.path.display()))?;
        info!("Launched browser {}", self.path.display());

        let path = self.path.clone();
        Ok(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!("Browser {} exited", path.display()),
                Ok(status) => warn!("Browser {} exited with {}", path.display(), status),
                Err(e) => warn!("Failed to wait for browser {}: {}", path.display(), e),
            }
        }))
    }

    /// Launch once the first proxy generation is listening.
    ///
    /// Gives up quietly if the supervisor ends before that happens.
    pub fn launch_when_listening(
        self,
        mut status: watch::Receiver<SupervisorStatus>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listening = status
                .wait_for(|s| matches!(s.proxy, ProxyState::Listening(_)))
                .await
                .is_ok();
            if !listening {
                debug!("Proxy never came up; browser not launched");
                return;
            }

            match self.launch() {
                Ok(watcher) => {
                    let _ = watcher.await;
                }
                Err(e) => warn!("{:#}", e),
            }
        })
    }
}
