//! UDP transport for DNS queries.
//!
//! One listener task reads client datagrams. Warm hits are answered inline;
//! each miss gets its own task that races the upstreams, answers the client
//! and then hands the candidates to the prober.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::race::{RaceOutcome, race};
use crate::resolver::{QueryAction, QueryContext, Resolver};

use super::{MAX_DNS_PACKET_SIZE, QueryLogger};

/// UDP transport for the DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the client-facing socket.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::bind("UDP listener", addr, e))?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the listener loop. It stops when `shutdown` is cancelled.
    pub fn start(self, resolver: Arc<Resolver>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver, shutdown))
    }
}

/// Main event loop: read a query, decide, answer or spawn a race.
async fn run(socket: Arc<UdpSocket>, resolver: Arc<Resolver>, shutdown: CancellationToken) {
    let logger = QueryLogger;
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "UDP recv error");
                    continue;
                }
            },
        };

        let start_time = Instant::now();

        match resolver.process_query(&buf[..len], src) {
            Ok(QueryAction::Cached { response, domain }) => {
                if let Err(e) = socket.send_to(&response, src).await {
                    warn!(client = %src, error = %e, "UDP response error");
                    continue;
                }
                let elapsed = start_time.elapsed();
                resolver.stats().record_cached(elapsed.as_secs_f64() * 1000.0);
                logger.cached(&domain, src, elapsed);
            }
            Ok(QueryAction::Race(context)) => {
                tokio::spawn(handle_miss(socket.clone(), resolver.clone(), context));
            }
            Ok(QueryAction::Ignored { domain, qtype }) => {
                resolver.stats().record_dropped();
                logger.ignored(&domain, qtype, src);
            }
            Err(e) => {
                resolver.stats().record_dropped();
                debug!(client = %src, error = %e, "dropping malformed query");
            }
        }
    }

    debug!("UDP listener stopped");
}

/// Cold path for one query: race, answer, then probe in the background.
async fn handle_miss(socket: Arc<UdpSocket>, resolver: Arc<Resolver>, context: QueryContext) {
    let logger = QueryLogger;
    let domain = context.domain();

    match race(&resolver, &context, &socket).await {
        Ok(RaceOutcome::Answered {
            address,
            upstream,
            upstream_elapsed,
            response_elapsed,
            candidates,
        }) => {
            resolver
                .stats()
                .record_answered(response_elapsed.as_secs_f64() * 1000.0);
            logger.answered(&domain, address, response_elapsed, upstream_elapsed, upstream);
            resolver.spawn_probe(&context, candidates);
        }
        Ok(RaceOutcome::Relayed {
            upstream,
            response_elapsed,
            candidates,
        }) => {
            resolver
                .stats()
                .record_relayed(response_elapsed.as_secs_f64() * 1000.0);
            logger.relayed(&domain, response_elapsed, upstream);
            resolver.spawn_probe(&context, candidates);
        }
        Err(e) => {
            resolver.stats().record_unanswered();
            logger.unanswered(&domain, &e);
        }
    }
}
