//! Test doubles shared by the daemon's unit tests

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use sshsocks_common::{Result, TargetAddr, TunnelError};
use sshsocks_core::{quit_channel, Connection, QuitSignal, QuitTrigger, Transport, TransportFactory};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Transport whose every dial reaches an in-memory echo peer
pub struct EchoTransport {
    dialed: Mutex<Vec<SocketAddr>>,
    refuse: AtomicBool,
    stall: AtomicBool,
    closed: QuitSignal,
    closer: Mutex<Option<QuitTrigger>>,
    close_calls: AtomicUsize,
}

impl EchoTransport {
    pub fn new() -> Self {
        let (closer, closed) = quit_channel();
        Self {
            dialed: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            closed,
            closer: Mutex::new(Some(closer)),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn dialed(&self) -> Vec<SocketAddr> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn refuse_dials(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn allow_dials(&self) {
        self.refuse.store(false, Ordering::SeqCst);
    }

    /// Make every later dial hang forever
    pub fn stall_dials(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    /// End the session as if the remote went away
    pub fn kill(&self) {
        if let Some(closer) = self.closer.lock().unwrap().take() {
            closer.fire();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for EchoTransport {
    async fn dial(&self, addr: SocketAddr) -> Result<Connection> {
        if self.closed.is_fired() {
            return Err(TunnelError::closed("echo transport closed"));
        }
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TunnelError::DialRefused {
                addr,
                reason: "refused by test".into(),
            });
        }
        self.dialed.lock().unwrap().push(addr);

        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }

    async fn wait_for_close(&self) -> TunnelError {
        self.closed.fired().await;
        TunnelError::closed("echo transport killed")
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.kill();
    }

    fn remote(&self) -> String {
        "echo-test".to_string()
    }
}

/// Factory handing out `EchoTransport`s and recording every attempt
#[derive(Default)]
pub struct FakeFactory {
    transports: Mutex<Vec<Arc<EchoTransport>>>,
    attempts: Mutex<Vec<Instant>>,
    failures: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connects fail
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn transports(&self) -> Vec<Arc<EchoTransport>> {
        self.transports.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        self.attempts.lock().unwrap().push(Instant::now());

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TunnelError::establish("fake factory told to fail"));
        }

        let transport = Arc::new(EchoTransport::new());
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Connect to `proxy` and negotiate CONNECT to `target`
pub async fn socks_connect(proxy: SocketAddr, target: &TargetAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(proxy).await?;
    socks_handshake(stream, target).await
}

/// Client half of the SOCKS5 exchange on an open stream
pub async fn socks_handshake(mut stream: TcpStream, target: &TargetAddr) -> io::Result<TcpStream> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection != [0x05, 0x00] {
        return Err(io::Error::new(io::ErrorKind::Other, "method rejected"));
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            request.push(0x01);
            request.extend(addr.ip().octets());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            request.push(0x04);
            request.extend(addr.ip().octets());
        }
        TargetAddr::Domain(host, _) => {
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend(host.as_bytes());
        }
    }
    request.extend(target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("SOCKS5 reply {}", reply[1]),
        ));
    }
    Ok(stream)
}

/// UDP DNS server answering A queries from a fixed table
pub async fn stub_dns(records: &[(&str, Ipv4Addr)]) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let table: Vec<(String, Ipv4Addr)> = records
        .iter()
        .map(|(name, ip)| (name.to_string(), *ip))
        .collect();

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let question = query.queries()[0].clone();
            let asked = question.name().to_string();
            let asked = asked.trim_end_matches('.');

            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(true)
                .set_recursion_available(true);
            response.add_query(question.clone());

            match table.iter().find(|(name, _)| name == asked) {
                None => {
                    response.set_response_code(ResponseCode::NXDomain);
                }
                Some((_, ip)) if question.query_type() == RecordType::A => {
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        60,
                        RData::A(A(*ip)),
                    ));
                }
                Some(_) => {}
            }

            let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
        }
    });

    (addr, hits)
}
