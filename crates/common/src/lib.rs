pub mod config;
pub mod error;
pub mod types;

pub use config::{defaults, AuthMethod, ConfigError, ProxyConfig, ReconnectPolicy, TunnelConfig};
pub use error::{Result, TunnelError};
pub use types::TargetAddr;
