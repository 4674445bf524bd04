//! sshsocks daemon library
//!
//! Local SOCKS5 proxy, the supervisor that keeps it bound to a live SSH
//! session, signal handling, and the optional browser launcher.

pub mod browser;
pub mod proxy;
pub mod shutdown;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use browser::BrowserLauncher;
pub use proxy::{ProxyState, Socks5Server, StopHandle};
pub use supervisor::{Supervisor, SupervisorStatus};
