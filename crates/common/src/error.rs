use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;

/// Common error types for sshsocks
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transport establishment failed: {0}")]
    TransportEstablish(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Resolution of {name} failed: {cause}")]
    ResolutionFailed { name: String, cause: String },

    #[error("Dial to {addr} refused: {reason}")]
    DialRefused { addr: SocketAddr, reason: String },

    #[error("Dial to {addr} failed: {reason}")]
    Dial { addr: SocketAddr, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection timeout")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for sshsocks operations
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn establish(msg: impl Into<String>) -> Self {
        Self::TransportEstablish(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::TransportClosed(msg.into())
    }

    pub fn resolution(name: impl Into<String>, cause: impl ToString) -> Self {
        Self::ResolutionFailed {
            name: name.into(),
            cause: cause.to_string(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_error_names_the_host() {
        let err = TunnelError::resolution("test.local", "NXDomain");
        assert_eq!(err.to_string(), "Resolution of test.local failed: NXDomain");
    }

    #[test]
    fn config_errors_convert_transparently() {
        let err = TunnelError::from(ConfigError::MissingCredentials);
        assert!(matches!(err, TunnelError::Config(_)));
        assert_eq!(err.to_string(), ConfigError::MissingCredentials.to_string());

        let bind = TunnelError::Bind {
            addr: "0.0.0.0:1080".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.to_string().starts_with("Failed to bind 0.0.0.0:1080"));
    }
}
