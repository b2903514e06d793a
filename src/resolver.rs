//! DNS query resolution logic.
//!
//! Handles the decision part of the query pipeline:
//! 1. Decode the query and skip anything that is not an A/AAAA question
//! 2. Cache lookup (warm path)
//! 3. Otherwise hand back a [`QueryContext`] for an upstream race
//!
//! Transports handle the actual I/O, the resolver handles decisions and owns
//! the cache and the prober.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::AnswerCache;
use crate::dns::{AnswerTemplate, CacheKey, Message, Question};
use crate::error::Result;
use crate::probe::Prober;
use crate::stats::Stats;

/// Action to take for a DNS query.
pub enum QueryAction {
    /// Answer is cached, send this response immediately.
    Cached { response: Vec<u8>, domain: String },
    /// Cache miss, race the upstreams.
    Race(QueryContext),
    /// Not an address query; dropped.
    Ignored { domain: String, qtype: u16 },
}

/// Immutable per-query state owned by the race that serves it.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub id: u16,
    pub client: SocketAddr,
    pub key: CacheKey,
    pub question: Question,
    /// The client's query, forwarded to upstreams unmodified.
    pub query: Arc<[u8]>,
    pub received_at: Instant,
    pub deadline: Instant,
}

impl QueryContext {
    pub fn domain(&self) -> String {
        self.question.domain()
    }
}

/// Static parameters of the resolution pipeline.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub upstreams: Vec<SocketAddr>,
    pub race_timeout: Duration,
    pub response_delay: Duration,
    pub default_ttl: u32,
    pub answer_ttl: u32,
}

/// Resolver handles DNS query processing decisions.
///
/// Contains all shared state: the answer cache, statistics and the optional
/// prober. Transports call this to decide what to do with queries.
pub struct Resolver {
    cache: Arc<AnswerCache>,
    stats: Arc<Stats>,
    settings: ResolverSettings,
    prober: Option<Arc<Prober>>,
}

impl Resolver {
    pub fn new(cache: Arc<AnswerCache>, stats: Arc<Stats>, settings: ResolverSettings) -> Self {
        Self {
            cache,
            stats,
            settings,
            prober: None,
        }
    }

    pub fn with_prober(mut self, prober: Arc<Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Process a DNS query and decide what action to take.
    pub fn process_query(&self, query: &[u8], client: SocketAddr) -> Result<QueryAction> {
        let message = Message::decode(query)?;

        if !message.question.is_address_query() {
            return Ok(QueryAction::Ignored {
                domain: message.question.domain(),
                qtype: message.question.qtype,
            });
        }

        let key = message.cache_key();
        if let Some(hit) = self.cache.lookup(&key) {
            return Ok(QueryAction::Cached {
                response: hit.template.with_transaction_id(message.id),
                domain: message.question.domain(),
            });
        }

        let received_at = Instant::now();
        Ok(QueryAction::Race(QueryContext {
            id: message.id,
            client,
            key,
            question: message.question,
            query: Arc::from(query),
            received_at,
            deadline: received_at + self.settings.race_timeout,
        }))
    }

    /// Cache the winning address for a raced query and schedule its expiry.
    ///
    /// Returns the template the client response is rendered from.
    pub fn store_answer(&self, context: &QueryContext, address: IpAddr) -> AnswerTemplate {
        let template = AnswerTemplate::new(&context.question, self.settings.answer_ttl, address);
        self.cache
            .insert(context.key.clone(), template.clone(), self.settings.default_ttl);
        self.cache
            .schedule_expiry(&context.key, self.settings.default_ttl);
        template
    }

    /// Start background probing of `candidates` for a freshly cached answer.
    pub fn spawn_probe(&self, context: &QueryContext, candidates: Vec<IpAddr>) {
        if let Some(prober) = &self.prober {
            if !candidates.is_empty() {
                prober.spawn(context.key.clone(), context.domain(), candidates);
            }
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<AnswerCache> {
        &self.cache
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
