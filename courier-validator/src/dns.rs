//! MX resolution.
//!
//! The validator only needs to know whether a domain publishes a usable MX
//! record, so lookups are behind the [`MxResolver`] trait. Production uses
//! [`HickoryMxResolver`]; tests and offline deployments use
//! [`StaticMxResolver`].

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DnsError;

/// Configuration for MX resolution and verdict caching.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL override in seconds. If unset the record TTL is used,
    /// bounded by `min_cache_ttl_secs` and `max_cache_ttl_secs`.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,

    /// How long a "no mail servers" verdict is remembered (default: 300)
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,

    /// Retry a lookup once when it fails with a transient error.
    ///
    /// NXDOMAIN and empty answers are never retried.
    ///
    /// Default: `false`
    #[serde(default)]
    pub retry_transient: bool,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

const fn default_negative_ttl_secs() -> u64 {
    300
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            retry_transient: false,
        }
    }
}

impl DnsConfig {
    /// Cache lifetime for a positive answer carrying `record_ttl`.
    #[must_use]
    pub fn positive_ttl(&self, record_ttl: Duration) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or_else(|| {
            record_ttl
                .as_secs()
                .clamp(self.min_cache_ttl_secs, self.max_cache_ttl_secs)
        }))
    }

    #[must_use]
    pub const fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

/// A single MX answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Exchange host as returned by DNS (may carry a trailing dot).
    pub exchange: String,
    /// MX preference (lower value = higher priority).
    pub preference: u16,
}

impl MxRecord {
    #[must_use]
    pub fn new(exchange: impl Into<String>, preference: u16) -> Self {
        Self {
            exchange: exchange.into(),
            preference,
        }
    }

    /// `false` for an empty exchange or the RFC 7505 null MX (`"."`).
    #[must_use]
    pub fn accepts_mail(&self) -> bool {
        let exchange = self.exchange.trim();
        !exchange.is_empty() && exchange != "."
    }
}

/// The MX records for a domain along with the smallest record TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxLookup {
    pub records: Vec<MxRecord>,
    pub ttl: Duration,
}

impl MxLookup {
    /// At least one record names a real exchange.
    #[must_use]
    pub fn accepts_mail(&self) -> bool {
        self.records.iter().any(MxRecord::accepts_mail)
    }
}

#[async_trait]
pub trait MxResolver: Send + Sync + Debug {
    /// Look up the MX records for `domain`.
    ///
    /// # Errors
    /// `DomainNotFound`/`NoMailServers` for authoritative negative answers,
    /// `Timeout`/`LookupFailed` for transient resolver trouble.
    async fn lookup_mx(&self, domain: &str) -> Result<MxLookup, DnsError>;
}

/// MX resolver backed by the system resolver configuration.
#[derive(Debug)]
pub struct HickoryMxResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryMxResolver {
    /// Creates a resolver from `/etc/resolv.conf` (or platform equivalent).
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        // Retries are decided by the validator, not the resolver.
        opts.attempts = 1;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver, timeout })
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn lookup_mx(&self, domain: &str) -> Result<MxLookup, DnsError> {
        // Fully qualify so the search list is never consulted.
        let fqdn = format!("{}.", domain.trim_end_matches('.'));

        let lookup = match tokio::time::timeout(self.timeout, self.resolver.mx_lookup(fqdn)).await
        {
            Err(_) => return Err(DnsError::Timeout(domain.to_string())),
            Ok(Err(err)) if err.is_nx_domain() => {
                return Err(DnsError::DomainNotFound(domain.to_string()));
            }
            Ok(Err(err)) if err.is_no_records_found() => {
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            Ok(Err(err)) => {
                warn!("MX lookup failed for {domain}: {err}");
                return Err(DnsError::LookupFailed {
                    domain: domain.to_string(),
                    reason: err.to_string(),
                });
            }
            Ok(Ok(lookup)) => lookup,
        };

        let ttl = lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(300);

        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord::new(mx.exchange().to_utf8(), mx.preference()))
            .collect();
        records.sort_by_key(|record| record.preference);

        debug!("Resolved {} MX record(s) for {domain}", records.len());

        Ok(MxLookup {
            records,
            ttl: Duration::from_secs(u64::from(ttl)),
        })
    }
}

/// Canned answer for [`StaticMxResolver`].
#[derive(Debug, Clone)]
pub enum StaticAnswer {
    Records(Vec<MxRecord>),
    NotFound,
    NoRecords,
    Timeout,
}

/// In-memory resolver with a fixed answer table.
///
/// Unknown domains resolve as NXDOMAIN. Every call is counted so callers can
/// assert on cache behaviour.
#[derive(Debug, Clone, Default)]
pub struct StaticMxResolver {
    answers: Arc<RwLock<HashMap<String, StaticAnswer>>>,
    lookups: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl StaticMxResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `domain` with a single MX pointing at `mx.<domain>`.
    #[must_use]
    pub fn with_domain(self, domain: &str) -> Self {
        self.with_answer(
            domain,
            StaticAnswer::Records(vec![MxRecord::new(format!("mx.{domain}."), 10)]),
        )
    }

    #[must_use]
    pub fn with_answer(self, domain: &str, answer: StaticAnswer) -> Self {
        self.answers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(domain.to_ascii_lowercase(), answer);
        self
    }

    /// Delay every answer, to widen race windows in concurrency tests.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of lookups served so far.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MxResolver for StaticMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<MxLookup, DnsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let answer = self
            .answers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&domain.to_ascii_lowercase())
            .cloned();

        match answer {
            Some(StaticAnswer::Records(records)) => Ok(MxLookup {
                records,
                ttl: Duration::from_secs(300),
            }),
            Some(StaticAnswer::NoRecords) => Err(DnsError::NoMailServers(domain.to_string())),
            Some(StaticAnswer::Timeout) => Err(DnsError::Timeout(domain.to_string())),
            Some(StaticAnswer::NotFound) | None => {
                Err(DnsError::DomainNotFound(domain.to_string()))
            }
        }
    }
}
