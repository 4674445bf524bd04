/// Local name resolution for proxied destinations
///
/// Destinations are always resolved on this side of the tunnel, so the
/// operator's DNS choice applies instead of the remote network's. With no
/// custom server configured the platform resolver is used; otherwise the
/// query is built and sent over UDP to that server directly.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use sshsocks_common::{ProxyConfig, Result, TunnelError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

/// Large enough for EDNS0-sized answers
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Sends per query before giving up
const UDP_ATTEMPTS: u32 = 3;

/// Name-resolution policy for one proxy configuration
#[derive(Debug, Clone)]
pub struct Resolver {
    mode: Mode,
}

#[derive(Debug, Clone)]
enum Mode {
    System,
    Custom { server: SocketAddr, timeout: Duration },
}

impl Resolver {
    /// Resolve through the platform resolver
    pub fn system() -> Self {
        Self { mode: Mode::System }
    }

    /// Resolve by querying `server` over UDP
    pub fn custom(server: SocketAddr, timeout: Duration) -> Self {
        Self {
            mode: Mode::Custom { server, timeout },
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        match config.custom_dns {
            Some(server) => Self::custom(server, config.dns_timeout),
            None => Self::system(),
        }
    }

    /// Configured DNS server, if any
    pub fn server(&self) -> Option<SocketAddr> {
        match self.mode {
            Mode::System => None,
            Mode::Custom { server, .. } => Some(server),
        }
    }

    /// Resolve `name` to the first address returned
    pub async fn resolve(&self, name: &str) -> Result<IpAddr> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        let ip = match &self.mode {
            Mode::System => lookup_system(name).await?,
            Mode::Custom { server, timeout } => lookup_custom(name, *server, *timeout)
                .await
                .map_err(|e| match e {
                    TunnelError::ResolutionFailed { .. } => e,
                    other => TunnelError::resolution(name, other),
                })?,
        };

        info!("Resolved {} to {}", name, ip);
        Ok(ip)
    }
}

async fn lookup_system(name: &str) -> Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|e| TunnelError::resolution(name, e))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| TunnelError::resolution(name, "no addresses returned"))
}

/// A records first; AAAA only when the name has no IPv4 address
async fn lookup_custom(name: &str, server: SocketAddr, limit: Duration) -> Result<IpAddr> {
    let qname = {
        let mut qname =
            Name::from_ascii(name).map_err(|e| TunnelError::resolution(name, e))?;
        qname.set_fqdn(true);
        qname
    };

    for record_type in [RecordType::A, RecordType::AAAA] {
        let response = exchange(&qname, record_type, server, limit).await?;

        match response.response_code() {
            ResponseCode::NoError => {}
            code => return Err(TunnelError::resolution(name, code)),
        }

        let first = response.answers().iter().find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        });

        if let Some(ip) = first {
            return Ok(ip);
        }
        debug!("DNS: no {} records for {} from {}", record_type, name, server);
    }

    Err(TunnelError::resolution(name, "empty answer"))
}

/// Send a query and wait for its matching reply.
///
/// The query is resent up to `UDP_ATTEMPTS` times, splitting `limit` evenly
/// between sends. Replies that do not parse or do not match the query are
/// skipped while the current send's window is still open.
async fn exchange(
    qname: &Name,
    record_type: RecordType,
    server: SocketAddr,
    limit: Duration,
) -> Result<Message> {
    let name = qname.to_string().trim_end_matches('.').to_string();

    let mut query = Message::new();
    query
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    query.add_query(Query::query(qname.clone(), record_type));

    let query_bytes = query
        .to_vec()
        .map_err(|e| TunnelError::resolution(&name, format!("encode query: {}", e)))?;

    let bind_addr = if server.is_ipv4() {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
    } else {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    let window = limit / UDP_ATTEMPTS;
    let mut recv_buf = vec![0u8; UDP_RECV_BUFFER_SIZE];

    for attempt in 1..=UDP_ATTEMPTS {
        if attempt > 1 {
            debug!(
                "DNS: resending {} query for {} to {} (attempt {}/{})",
                record_type, name, server, attempt, UDP_ATTEMPTS
            );
        }
        socket.send(&query_bytes).await?;

        let deadline = Instant::now() + window;
        while let Ok(received) = timeout_at(deadline, socket.recv(&mut recv_buf)).await {
            let len = received?;
            match Message::from_vec(&recv_buf[..len]) {
                Ok(response) if answers(&response, &query, qname, record_type) => {
                    return Ok(response)
                }
                Ok(_) => debug!("DNS: ignoring reply from {} that does not match query", server),
                Err(e) => debug!("DNS: ignoring malformed reply from {}: {}", server, e),
            }
        }
    }

    Err(TunnelError::resolution(
        &name,
        format!("timed out waiting for {}", server),
    ))
}

/// Same id, and the question section echoes what was asked
fn answers(response: &Message, query: &Message, qname: &Name, record_type: RecordType) -> bool {
    response.id() == query.id()
        && response
            .queries()
            .first()
            .map_or(false, |q| q.name() == qname && q.query_type() == record_type)
}
