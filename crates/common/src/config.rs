use serde::{Deserialize, Deserializer, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default values used when the config file leaves a field out
pub mod defaults {
    /// SSH port on the remote host
    pub const SERVER_PORT: u16 = 22;

    /// Local SOCKS5 listening port
    pub const LOCAL_PORT: u16 = 1080;

    /// Port assumed for a custom DNS server given without one
    pub const DNS_PORT: u16 = 53;

    /// Pause between tearing down a dead session and dialing a new one
    pub const RECONNECT_DELAY_SECS: u64 = 5;

    /// SSH connect + authentication timeout
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Per-query timeout for the custom DNS resolver
    pub const DNS_TIMEOUT_SECS: u64 = 5;

    /// Upper bound on the SOCKS5 negotiation phase of a client
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

    /// Upper bound on opening one connection through the tunnel
    pub const DIAL_TIMEOUT_SECS: u64 = 15;
}

/// Tunnel configuration as read from the YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// SSH user name
    #[serde(default)]
    pub username: String,

    /// Password authentication (exclusive with `private_key_path`)
    #[serde(default)]
    pub password: String,

    /// Private key authentication (exclusive with `password`)
    #[serde(default)]
    pub private_key_path: String,

    /// Remote SSH host
    #[serde(default, alias = "serverAddr")]
    pub server_address: String,

    /// Remote SSH port
    #[serde(default = "default_server_port", deserialize_with = "port")]
    pub server_port: u16,

    /// Local SOCKS5 port
    #[serde(default = "default_local_port", deserialize_with = "port")]
    pub local_port: u16,

    /// Optional DNS server used instead of the system resolver
    #[serde(default, rename = "customDNS")]
    pub custom_dns: String,

    /// Launch a browser wired to the proxy once it is up
    #[serde(default)]
    pub use_chrome: bool,

    /// Browser executable
    #[serde(default)]
    pub chrome_path: String,

    /// Backoff between reconnect attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Reconnect attempts before giving up; unlimited when absent
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// SSH connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_server_port() -> u16 {
    defaults::SERVER_PORT
}

fn default_local_port() -> u16 {
    defaults::LOCAL_PORT
}

/// Ports may be written as numbers or as quoted strings
fn port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

fn default_reconnect_delay() -> u64 {
    defaults::RECONNECT_DELAY_SECS
}

fn default_connect_timeout() -> u64 {
    defaults::CONNECT_TIMEOUT_SECS
}

/// How the SSH session authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    PrivateKey(PathBuf),
}

/// Settings the SOCKS5 proxy and its resolver run with.
///
/// Immutable once built; shared by `Arc` across every proxy generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the listener binds; `0.0.0.0:<localPort>` from the file
    pub bind_addr: SocketAddr,

    /// DNS server queried directly instead of the system resolver
    pub custom_dns: Option<SocketAddr>,

    /// Upper bound on a client's SOCKS5 negotiation
    pub handshake_timeout: Duration,

    /// Per-query timeout when `custom_dns` is set
    pub dns_timeout: Duration,

    /// Upper bound on one `Transport::dial`
    pub dial_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(local_port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port),
            custom_dns: None,
            handshake_timeout: Duration::from_secs(defaults::HANDSHAKE_TIMEOUT_SECS),
            dns_timeout: Duration::from_secs(defaults::DNS_TIMEOUT_SECS),
            dial_timeout: Duration::from_secs(defaults::DIAL_TIMEOUT_SECS),
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_custom_dns(mut self, server: SocketAddr) -> Self {
        self.custom_dns = Some(server);
        self
    }

    pub fn with_dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    pub fn local_port(&self) -> u16 {
        self.bind_addr.port()
    }
}

/// What the supervisor does when re-establishing a lost session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed pause before every reconnect attempt
    pub delay: Duration,

    /// Reconnect attempts made before giving up; `Some(0)` gives up as soon
    /// as the first session is lost, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(defaults::RECONNECT_DELAY_SECS),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt may start after `failed` consecutive failures
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }
}

impl TunnelConfig {
    /// Load configuration from a YAML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => {}
            _ => return Err(ConfigError::BadExtension(path.display().to_string())),
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth()?;

        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingField("username"));
        }
        if self.server_address.trim().is_empty() {
            return Err(ConfigError::MissingField("serverAddress"));
        }
        if self.use_chrome && self.chrome_path.trim().is_empty() {
            return Err(ConfigError::MissingField("chromePath"));
        }

        self.custom_dns_addr()?;
        Ok(())
    }

    /// Select the authentication mode; exactly one credential must be set
    pub fn auth(&self) -> Result<AuthMethod, ConfigError> {
        match (self.password.is_empty(), self.private_key_path.is_empty()) {
            (true, true) => Err(ConfigError::MissingCredentials),
            (false, false) => Err(ConfigError::AmbiguousCredentials),
            (false, true) => Ok(AuthMethod::Password(self.password.clone())),
            (true, false) => Ok(AuthMethod::PrivateKey(PathBuf::from(&self.private_key_path))),
        }
    }

    /// Parse `customDNS` as `ip` or `ip:port`
    pub fn custom_dns_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        let raw = self.custom_dns.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(Some(addr));
        }

        raw.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| Some(SocketAddr::new(ip, defaults::DNS_PORT)))
            .map_err(|_| ConfigError::InvalidField {
                field: "customDNS",
                reason: format!("{raw:?} is not an IP address or ip:port"),
            })
    }

    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = ProxyConfig::new(self.local_port);
        if let Some(dns) = self.custom_dns_addr()? {
            config = config.with_custom_dns(dns);
        }
        Ok(config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.reconnect_delay_secs),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `host:port` of the SSH server
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file must end in .yaml or .yml: {0}")]
    BadExtension(String),

    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Missing credentials: set either password or privateKeyPath")]
    MissingCredentials,

    #[error("Both password and privateKeyPath are set; choose one")]
    AmbiguousCredentials,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
