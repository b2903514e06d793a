//! Error types.
//!
//! Only [`Error::Bind`] and [`Error::Config`] ever leave the proxy: decode,
//! upstream and probe failures are handled where they happen and logged.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::dns::DecodeError;
use crate::probe::ProbeError;

/// A specialized `Result` type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed DNS bytes from a client or upstream.
    #[error("malformed DNS message: {0}")]
    Decode(#[from] DecodeError),

    /// Socket or send failure talking to one upstream resolver.
    #[error("upstream {upstream} unreachable: {source}")]
    UpstreamUnreachable {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// No upstream produced a reply before the race deadline.
    #[error("no upstream reply within the race timeout")]
    RaceTimeout,

    /// Raw-socket probing failure for one candidate.
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// Could not acquire a socket the proxy cannot run without.
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn upstream(upstream: SocketAddr, source: io::Error) -> Self {
        Self::UpstreamUnreachable { upstream, source }
    }

    pub fn bind(what: &'static str, addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { what, addr, source }
    }

    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
