//! Fastlane - a caching DNS proxy that prefers the closest address.
//!
//! Cache misses are raced across several upstream resolvers and the client is
//! answered from the first usable reply. Every address seen in the race is
//! then SYN-probed in the background, and the cached answer is repointed at
//! whichever candidate replies fastest. Warm queries are answered from the
//! cache without touching the network.
//!
//! The library is split so the pieces can be benchmarked and tested on their
//! own: [`dns`] is the wire codec, [`cache`] the answer cache, [`probe`] the
//! RTT prober and [`proxy`] the server that ties them together.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod probe;
pub mod proxy;
pub mod race;
pub mod resolver;
pub mod stats;
pub mod transport;
