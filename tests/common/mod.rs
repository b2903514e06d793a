//! Shared fixtures: scripted upstream resolvers and an in-memory probe
//! socket provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use fastlane::config::{ProbeConfig, ProxyConfig};
use fastlane::dns::{CLASS_IN, TYPE_A};
use fastlane::probe::ProbeError;
use fastlane::probe::packet::{TcpReply, build_syn_packet};
use fastlane::probe::socket::{ProbeSocket, SocketProvider};

pub const PROBE_SOURCE: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub const PROBE_SOURCE_PORT: u16 = 56591;

/// How a scripted upstream answers.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// A/AAAA answer with these addresses after `delay`.
    Answer {
        delay: Duration,
        addresses: Vec<Ipv4Addr>,
    },
    /// Authoritative NXDOMAIN after `delay`.
    NxDomain { delay: Duration },
    /// A reply with the right ID whose answer section is cut short.
    Garbage { delay: Duration },
    /// Never answers.
    Silent,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub queries: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

/// Spawn a UDP resolver on loopback that answers every query per `behavior`.
pub async fn mock_upstream(behavior: Upstream) -> MockUpstream {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));

    let counter = queries.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let query = buf[..len].to_vec();
            let socket = socket.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let (delay, response) = match behavior {
                    Upstream::Answer { delay, addresses } => {
                        (delay, answer_response(&query, &addresses))
                    }
                    Upstream::NxDomain { delay } => (delay, nxdomain_response(&query)),
                    Upstream::Garbage { delay } => (delay, truncated_response(&query)),
                    Upstream::Silent => return,
                };
                tokio::time::sleep(delay).await;
                let _ = socket.send_to(&response, src).await;
            });
        }
    });

    MockUpstream { addr, queries }
}

pub fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

fn answer_response(query: &[u8], addresses: &[Ipv4Addr]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x81;
    response[3] = 0x80;
    response[6..8].copy_from_slice(&(addresses.len() as u16).to_be_bytes());
    for addr in addresses {
        response.extend_from_slice(&[0xc0, 0x0c]);
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        response.extend_from_slice(&300u32.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x04]);
        response.extend_from_slice(&addr.octets());
    }
    response
}

fn nxdomain_response(query: &[u8]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x85; // QR, AA, RD
    response[3] = 0x83; // RA, NXDOMAIN
    response
}

fn truncated_response(query: &[u8]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x81;
    response[3] = 0x80;
    response[7] = 3; // claims three answers, carries none
    response.extend_from_slice(&[0xc0, 0x0c, 0x00]);
    response
}

/// A loopback address nothing listens on; queries to it are refused.
pub async fn unreachable_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap()
}

/// Proxy config on an ephemeral loopback port without the stats task.
pub fn config(upstreams: &[&MockUpstream], probe: bool) -> ProxyConfig {
    let mut config = ProxyConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        upstreams.iter().map(|u| u.addr).collect(),
    );
    config.race_timeout = Duration::from_millis(500);
    config.stats_interval = None;
    config.probe = probe.then(|| ProbeConfig {
        source: Some(PROBE_SOURCE),
        source_port: PROBE_SOURCE_PORT,
        ports: vec![80, 443],
        timeout: Duration::from_millis(300),
    });
    config
}

/// Send `query` to the proxy and wait for the reply.
pub async fn exchange(proxy: SocketAddr, query: &[u8], wait: Duration) -> Option<Vec<u8>> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(query, proxy).await.unwrap();
    let mut buf = [0u8; 4096];
    match tokio::time::timeout(wait, client.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

/// Probe provider whose candidates answer SYNs after a fixed delay.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    rtts: Arc<Mutex<HashMap<Ipv4Addr, Duration>>>,
    pub deny: bool,
}

impl ScriptedProvider {
    pub fn new(rtts: &[(Ipv4Addr, Duration)]) -> Self {
        Self {
            rtts: Arc::new(Mutex::new(rtts.iter().copied().collect())),
            deny: false,
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }
}

impl SocketProvider for ScriptedProvider {
    fn open(&self) -> Result<Box<dyn ProbeSocket>, ProbeError> {
        if self.deny {
            return Err(ProbeError::PermissionDenied);
        }
        Ok(Box::new(ScriptedSocket {
            rtts: self.rtts.clone(),
            sent: Mutex::new(None),
        }))
    }
}

struct ScriptedSocket {
    rtts: Arc<Mutex<HashMap<Ipv4Addr, Duration>>>,
    /// First SYN seen: (candidate, candidate port, our source port).
    sent: Mutex<Option<(Ipv4Addr, u16, u16)>>,
}

#[async_trait]
impl ProbeSocket for ScriptedSocket {
    async fn send_to(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        let syn = TcpReply::parse(packet)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a TCP packet"))?;
        self.sent
            .lock()
            .unwrap()
            .get_or_insert((destination, syn.destination_port, syn.source_port));
        Ok(packet.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let sent = self.sent.lock().unwrap().take();
        let Some((candidate, port, source_port)) = sent else {
            return std::future::pending().await;
        };
        let rtt = self.rtts.lock().unwrap().get(&candidate).copied();
        let Some(rtt) = rtt else {
            return std::future::pending().await;
        };
        tokio::time::sleep(rtt).await;
        let reply = build_syn_packet(candidate, PROBE_SOURCE, port, source_port);
        buf[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}

pub fn ip(addr: IpAddr) -> Ipv4Addr {
    match addr {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => panic!("expected IPv4"),
    }
}
