/// SOCKS5 protocol handling for one client connection
///
/// Negotiates "no authentication", parses a CONNECT request, resolves the
/// destination locally when it is a host name, dials it through the active
/// transport, and relays bytes until either side closes.

use sshsocks_common::{Result, TargetAddr, TunnelError};
use sshsocks_core::{Resolver, Transport};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// SOCKS5 protocol constants
pub(crate) const SOCKS_VERSION: u8 = 0x05;
pub(crate) const NO_AUTH_REQUIRED: u8 = 0x00;
pub(crate) const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
pub(crate) const CONNECT_COMMAND: u8 = 0x01;
pub(crate) const IPV4_ADDRESS: u8 = 0x01;
pub(crate) const DOMAIN_NAME: u8 = 0x03;
pub(crate) const IPV6_ADDRESS: u8 = 0x04;

/// Reply codes
pub(crate) const SUCCESS: u8 = 0x00;
pub(crate) const GENERAL_FAILURE: u8 = 0x01;
pub(crate) const NETWORK_UNREACHABLE: u8 = 0x03;
pub(crate) const HOST_UNREACHABLE: u8 = 0x04;
pub(crate) const CONNECTION_REFUSED: u8 = 0x05;
pub(crate) const COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub(crate) const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// What a client connection needs from its proxy generation
#[derive(Clone)]
pub(crate) struct ClientContext {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<Resolver>,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

/// Serve one accepted client from handshake to relay completion.
///
/// A failure reply is best effort: the client may already be gone, and the
/// resolve or dial error is what gets returned either way.
pub(crate) async fn handle_client<S>(mut stream: S, ctx: ClientContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = tokio::time::timeout(ctx.handshake_timeout, negotiate(&mut stream))
        .await
        .map_err(|_| TunnelError::Timeout)??;

    debug!("SOCKS5: Request to connect to {}", target);

    let addr = match resolve_target(&target, &ctx.resolver).await {
        Ok(addr) => addr,
        Err(e) => {
            let _ = send_reply(&mut stream, HOST_UNREACHABLE).await;
            return Err(e);
        }
    };

    let dialed = tokio::time::timeout(ctx.dial_timeout, ctx.transport.dial(addr))
        .await
        .unwrap_or_else(|_| {
            Err(TunnelError::Dial {
                addr,
                reason: format!("no answer within {:?}", ctx.dial_timeout),
            })
        });
    let mut remote = match dialed {
        Ok(remote) => remote,
        Err(e) => {
            let _ = send_reply(&mut stream, reply_code(&e)).await;
            return Err(e);
        }
    };

    send_reply(&mut stream, SUCCESS).await?;

    match tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
        Ok((sent, received)) => {
            info!(
                "SOCKS5: Connection closed for {} ({} bytes out, {} bytes in)",
                target, sent, received
            );
        }
        Err(e) => {
            debug!("SOCKS5: Relay for {} ended with error: {}", target, e);
        }
    }

    let _ = remote.shutdown().await;
    Ok(())
}

/// Method selection plus request parsing; returns the CONNECT target
pub(crate) async fn negotiate<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Handshake
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(TunnelError::protocol(format!(
            "Unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let n_methods = buf[1] as usize;
    let mut methods = vec![0u8; n_methods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH_REQUIRED) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(TunnelError::protocol("No acceptable auth methods"));
    }

    stream.write_all(&[SOCKS_VERSION, NO_AUTH_REQUIRED]).await?;

    // 2. Request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;

    if request[0] != SOCKS_VERSION {
        return Err(TunnelError::protocol("Invalid SOCKS version in request"));
    }

    let command = request[1];
    let address_type = request[3];

    if command != CONNECT_COMMAND {
        send_reply(stream, COMMAND_NOT_SUPPORTED).await?;
        return Err(TunnelError::protocol(format!(
            "Unsupported command: {}",
            command
        )));
    }

    let target = match address_type {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
        }
        DOMAIN_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(stream).await?;

            let domain = String::from_utf8(domain)
                .map_err(|_| TunnelError::protocol("Domain name is not UTF-8"))?;
            // Some clients send literal addresses as names.
            TargetAddr::from_host(&domain, port)
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(addr).into(), port))
        }
        _ => {
            send_reply(stream, ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(TunnelError::protocol(format!(
                "Unsupported address type: {}",
                address_type
            )));
        }
    };

    Ok(target)
}

async fn read_port<S>(stream: &mut S) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Resolve host names locally; literal addresses pass through
async fn resolve_target(target: &TargetAddr, resolver: &Resolver) -> Result<SocketAddr> {
    match target {
        TargetAddr::Ip(addr) => Ok(*addr),
        TargetAddr::Domain(host, port) => {
            let ip = resolver.resolve(host).await.map_err(|e| {
                warn!("SOCKS5: Failed to resolve {}: {}", host, e);
                e
            })?;
            Ok(SocketAddr::new(ip, *port))
        }
    }
}

/// Map a dial failure onto the SOCKS5 reply field
fn reply_code(err: &TunnelError) -> u8 {
    match err {
        TunnelError::DialRefused { .. } => CONNECTION_REFUSED,
        TunnelError::Dial { .. } => HOST_UNREACHABLE,
        TunnelError::TransportClosed(_) => NETWORK_UNREACHABLE,
        _ => GENERAL_FAILURE,
    }
}

/// Send a SOCKS5 reply to the client
async fn send_reply<S>(stream: &mut S, reply_code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Reply format: VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        SOCKS_VERSION,
        reply_code,
        0x00, // Reserved
        IPV4_ADDRESS,
        0, 0, 0, 0, // Bind address (0.0.0.0)
        0, 0, // Bind port (0)
    ];

    stream.write_all(&reply).await?;
    Ok(())
}
