//! Upstream racing for cache misses.
//!
//! The client's query is sent unmodified to every upstream over its own
//! connected socket. The first reply carrying a usable address wins: it is
//! cached, and the client is answered after the configured response delay,
//! giving slower upstreams a chance to contribute more candidates for
//! probing. A reply without an address that arrives before any address is
//! relayed to the client at once; later addresses are still cached. Replies
//! keep being collected until every upstream has answered or the race
//! deadline passes. Dropping the race drops every upstream socket, so late
//! replies are never seen.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::dns::{AnswerTemplate, HEADER_LEN, Message, all_addresses, first_address};
use crate::error::{Error, Result};
use crate::resolver::{QueryContext, Resolver};
use crate::stats::Stats;
use crate::transport::MAX_DNS_PACKET_SIZE;

/// How a race ended for the client.
#[derive(Debug)]
pub enum RaceOutcome {
    /// A synthesized answer was sent.
    Answered {
        address: IpAddr,
        upstream: SocketAddr,
        /// Time until the winning upstream replied.
        upstream_elapsed: Duration,
        /// Time until the client was answered.
        response_elapsed: Duration,
        /// Every unique address seen across all replies.
        candidates: Vec<IpAddr>,
    },
    /// A reply without an address arrived before any address did and was
    /// relayed verbatim.
    Relayed {
        upstream: SocketAddr,
        response_elapsed: Duration,
        /// Addresses from later replies. Non-empty means one was cached.
        candidates: Vec<IpAddr>,
    },
}

/// A reply from one upstream.
#[derive(Debug)]
pub struct UpstreamReply {
    pub upstream: SocketAddr,
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
}

struct Winner {
    template: AnswerTemplate,
    upstream: SocketAddr,
    upstream_elapsed: Duration,
    respond_at: Instant,
}

/// Race `context` across the configured upstreams and answer the client on
/// `listener`.
///
/// Returns [`Error::RaceTimeout`] when no reply at all could be sent.
pub async fn race(
    resolver: &Resolver,
    context: &QueryContext,
    listener: &UdpSocket,
) -> Result<RaceOutcome> {
    let settings = resolver.settings();
    let stats = resolver.stats();

    let mut replies: FuturesUnordered<_> = settings
        .upstreams
        .iter()
        .map(|&upstream| query_upstream(upstream, context, stats))
        .collect();

    let deadline = sleep_until(context.deadline);
    tokio::pin!(deadline);

    let mut winner: Option<Winner> = None;
    let mut responded: Option<Duration> = None;
    let mut relayed: Option<SocketAddr> = None;
    let mut candidates: Vec<IpAddr> = Vec::new();

    loop {
        if replies.is_empty() && (responded.is_some() || winner.is_none()) {
            break;
        }

        let respond_at = winner
            .as_ref()
            .filter(|_| responded.is_none())
            .map(|w| w.respond_at);

        tokio::select! {
            _ = &mut deadline => {
                debug!(domain = %context.domain(), "race deadline reached");
                break;
            }
            _ = sleep_until(respond_at.unwrap_or(context.deadline)), if respond_at.is_some() => {
                if let Some(w) = &winner {
                    responded = Some(send_answer(listener, context, &w.template).await);
                }
            }
            next = replies.next(), if !replies.is_empty() => {
                let reply = match next {
                    Some(Ok(reply)) => reply,
                    Some(Err(e)) => {
                        warn!(domain = %context.domain(), error = %e, "excluding upstream from race");
                        continue;
                    }
                    None => continue,
                };

                let message = match Message::decode(&reply.bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(upstream = %reply.upstream, error = %e, "dropping malformed upstream reply");
                        continue;
                    }
                };

                if !message.is_response() {
                    debug!(upstream = %reply.upstream, "dropping non-response from upstream");
                    continue;
                }

                let Some(address) = first_address(&message) else {
                    if winner.is_none() && responded.is_none() {
                        responded = Some(relay(listener, context, &reply).await);
                        relayed = Some(reply.upstream);
                    }
                    continue;
                };

                for candidate in all_addresses(&message) {
                    if !candidates.contains(&candidate) {
                        candidates.push(candidate);
                    }
                }

                if winner.is_none() {
                    let template = resolver.store_answer(context, address);
                    winner = Some(Winner {
                        template,
                        upstream: reply.upstream,
                        upstream_elapsed: reply.elapsed,
                        respond_at: Instant::now() + settings.response_delay,
                    });
                }
            }
        }
    }

    if let (Some(upstream), Some(response_elapsed)) = (relayed, responded) {
        return Ok(RaceOutcome::Relayed {
            upstream,
            response_elapsed,
            candidates,
        });
    }

    if let Some(winner) = winner {
        let response_elapsed = match responded {
            Some(elapsed) => elapsed,
            // The deadline beat the response delay; answer now.
            None => send_answer(listener, context, &winner.template).await,
        };
        return Ok(RaceOutcome::Answered {
            address: winner.template.address(),
            upstream: winner.upstream,
            upstream_elapsed: winner.upstream_elapsed,
            response_elapsed,
            candidates,
        });
    }

    Err(Error::RaceTimeout)
}

async fn relay(listener: &UdpSocket, context: &QueryContext, reply: &UpstreamReply) -> Duration {
    if let Err(e) = listener.send_to(&reply.bytes, context.client).await {
        warn!(client = %context.client, error = %e, "failed to relay upstream reply");
    }
    context.received_at.elapsed()
}

async fn send_answer(
    listener: &UdpSocket,
    context: &QueryContext,
    template: &AnswerTemplate,
) -> Duration {
    let response = template.with_transaction_id(context.id);
    if let Err(e) = listener.send_to(&response, context.client).await {
        warn!(client = %context.client, error = %e, "failed to send answer");
    }
    context.received_at.elapsed()
}

/// Send the query to one upstream and wait for the matching reply.
///
/// The socket is connected, so only datagrams from `upstream` are seen;
/// anything shorter than a header or with a different transaction ID is
/// skipped.
pub async fn query_upstream(
    upstream: SocketAddr,
    context: &QueryContext,
    stats: &Stats,
) -> Result<UpstreamReply> {
    let wildcard = if upstream.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    let bind_addr = SocketAddr::new(wildcard, 0);
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::upstream(upstream, e))?;
    socket
        .connect(upstream)
        .await
        .map_err(|e| Error::upstream(upstream, e))?;

    let sent_at = Instant::now();
    socket
        .send(&context.query)
        .await
        .map_err(|e| Error::upstream(upstream, e))?;
    stats.record_dns_traffic(context.query.len());

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    loop {
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|e| Error::upstream(upstream, e))?;
        stats.record_dns_traffic(len);

        if len < HEADER_LEN || u16::from_be_bytes([buf[0], buf[1]]) != context.id {
            continue;
        }

        buf.truncate(len);
        return Ok(UpstreamReply {
            upstream,
            bytes: buf,
            elapsed: sent_at.elapsed(),
        });
    }
}
