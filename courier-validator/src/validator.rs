use std::{sync::Arc, time::Duration};

use courier_common::internal;
use dashmap::DashMap;
use tokio::{sync::OnceCell, time::Instant};

use crate::{
    dns::{DnsConfig, MxResolver},
    format::{self, domain_of},
};

/// Outcome of the combined format and domain check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressCheck {
    Valid,
    InvalidFormat,
    DomainNotFound,
}

impl AddressCheck {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

#[derive(Debug, Clone, Copy)]
struct Verdict {
    accepts: bool,
    expires_at: Instant,
}

impl Verdict {
    fn new(accepts: bool, ttl: Duration) -> Self {
        Self {
            accepts,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache size past which every lookup first sweeps out expired verdicts.
const SWEEP_THRESHOLD: usize = 4096;

/// A cache slot. Concurrent callers for the same domain await the same
/// initialisation, so one batch never resolves a domain twice.
type Slot = Arc<OnceCell<Verdict>>;

/// Address validation with a shared, TTL-bounded MX verdict cache.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct AddressValidator {
    resolver: Arc<dyn MxResolver>,
    cache: DashMap<String, Slot>,
    config: DnsConfig,
}

impl AddressValidator {
    pub fn new(resolver: Arc<dyn MxResolver>, config: DnsConfig) -> Self {
        Self {
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    /// See [`format::validate_format`].
    #[must_use]
    pub fn validate_format(&self, address: &str) -> bool {
        format::validate_format(address)
    }

    /// `true` only if the address' domain publishes at least one MX record
    /// naming a real exchange.
    ///
    /// Never errors: NXDOMAIN, empty answers, null MX, timeouts and resolver
    /// failures all yield `false`.
    pub async fn validate_domain(&self, address: &str) -> bool {
        let Some(domain) = domain_of(address) else {
            return false;
        };
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if self.cache.len() >= SWEEP_THRESHOLD {
            self.purge_expired();
        }

        loop {
            let slot = Arc::clone(&self.cache.entry(domain.clone()).or_default());

            if slot.get().is_some_and(Verdict::is_expired) {
                self.evict(&domain, &slot);
                continue;
            }

            let verdict = *slot.get_or_init(|| self.resolve(&domain)).await;
            if verdict.is_expired() {
                self.evict(&domain, &slot);
            }

            return verdict.accepts;
        }
    }

    /// Format first, then domain. An address that fails the format check
    /// never reaches the resolver.
    pub async fn check(&self, address: &str) -> AddressCheck {
        if !self.validate_format(address) {
            AddressCheck::InvalidFormat
        } else if self.validate_domain(address).await {
            AddressCheck::Valid
        } else {
            AddressCheck::DomainNotFound
        }
    }

    /// Drop every cached verdict.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop expired verdicts, returning how many went. Lookups still in
    /// flight are kept.
    pub fn purge_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, slot| !slot.get().is_some_and(Verdict::is_expired));
        let purged = before.saturating_sub(self.cache.len());

        if purged > 0 {
            internal!(level = DEBUG, "Purged {purged} expired MX verdicts");
        }
        purged
    }

    /// Domains with a cached or in-flight verdict.
    #[must_use]
    pub fn cached_domains(&self) -> usize {
        self.cache.len()
    }

    fn evict(&self, domain: &str, slot: &Slot) {
        self.cache
            .remove_if(domain, |_, current| Arc::ptr_eq(current, slot));
    }

    async fn resolve(&self, domain: &str) -> Verdict {
        let mut result = self.resolver.lookup_mx(domain).await;

        if self.config.retry_transient
            && let Err(err) = &result
            && err.is_temporary()
        {
            internal!(level = DEBUG, "Retrying MX lookup for {domain}: {err}");
            result = self.resolver.lookup_mx(domain).await;
        }

        match result {
            Ok(lookup) if lookup.accepts_mail() => {
                Verdict::new(true, self.config.positive_ttl(lookup.ttl))
            }
            Ok(_) => {
                internal!(level = DEBUG, "{domain} publishes a null MX");
                Verdict::new(false, self.config.negative_ttl())
            }
            Err(err) if err.is_temporary() => {
                internal!(level = WARN, "Treating {domain} as invalid: {err}");
                // Transient failures are never remembered.
                Verdict::new(false, Duration::ZERO)
            }
            Err(err) => {
                internal!(level = DEBUG, "Rejecting {domain}: {err}");
                Verdict::new(false, self.config.negative_ttl())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dns::{MxRecord, StaticAnswer, StaticMxResolver};

    fn validator(resolver: &StaticMxResolver, config: DnsConfig) -> AddressValidator {
        AddressValidator::new(Arc::new(resolver.clone()), config)
    }

    #[tokio::test]
    async fn accepts_domain_with_mx() {
        let resolver = StaticMxResolver::new().with_domain("good.com");
        let validator = validator(&resolver, DnsConfig::default());

        assert!(validator.validate_domain("a@good.com").await);
        assert!(validator.validate_domain("b@GOOD.com").await);
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn rejects_unresolvable_and_null_mx() {
        let resolver = StaticMxResolver::new()
            .with_answer(
                "null.com",
                StaticAnswer::Records(vec![MxRecord::new(".", 0)]),
            )
            .with_answer("empty.com", StaticAnswer::NoRecords)
            .with_answer("blank.com", StaticAnswer::Records(vec![]));
        let validator = validator(&resolver, DnsConfig::default());

        assert!(!validator.validate_domain("x@nonexistent-domain-xyz.com").await);
        assert!(!validator.validate_domain("x@null.com").await);
        assert!(!validator.validate_domain("x@empty.com").await);
        assert!(!validator.validate_domain("x@blank.com").await);
        assert!(!validator.validate_domain("bad-format").await);
    }

    #[tokio::test]
    async fn negative_verdicts_are_cached() {
        let resolver = StaticMxResolver::new();
        let validator = validator(&resolver, DnsConfig::default());

        assert!(!validator.validate_domain("x@missing.com").await);
        assert!(!validator.validate_domain("y@missing.com").await);
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_not_cached() {
        let resolver = StaticMxResolver::new().with_answer("flaky.com", StaticAnswer::Timeout);
        let validator = validator(&resolver, DnsConfig::default());

        assert!(!validator.validate_domain("x@flaky.com").await);
        assert!(!validator.validate_domain("x@flaky.com").await);
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test]
    async fn transient_retry_is_opt_in() {
        let resolver = StaticMxResolver::new()
            .with_answer("flaky.com", StaticAnswer::Timeout)
            .with_answer("gone.com", StaticAnswer::NotFound);
        let validator = validator(
            &resolver,
            DnsConfig {
                retry_transient: true,
                ..DnsConfig::default()
            },
        );

        assert!(!validator.validate_domain("x@flaky.com").await);
        assert_eq!(resolver.lookups(), 2);

        // Permanent answers are never retried.
        assert!(!validator.validate_domain("x@gone.com").await);
        assert_eq!(resolver.lookups(), 3);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_query() {
        let resolver = StaticMxResolver::new()
            .with_domain("good.com")
            .with_delay(Duration::from_millis(50));
        let validator = Arc::new(validator(&resolver, DnsConfig::default()));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let validator = Arc::clone(&validator);
            tasks.spawn(async move { validator.validate_domain(&format!("u{i}@good.com")).await });
        }

        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap());
        }
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn expired_verdicts_are_refreshed() {
        let resolver = StaticMxResolver::new().with_domain("good.com");
        let validator = validator(
            &resolver,
            DnsConfig {
                cache_ttl_secs: Some(0),
                ..DnsConfig::default()
            },
        );

        assert!(validator.validate_domain("a@good.com").await);
        assert!(validator.validate_domain("a@good.com").await);
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_verdicts_are_purged() {
        let resolver = StaticMxResolver::new().with_domain("good.com");
        let validator = validator(&resolver, DnsConfig::default());

        assert!(validator.validate_domain("a@good.com").await);
        assert!(!validator.validate_domain("a@missing.com").await);
        assert_eq!(validator.cached_domains(), 2);
        assert_eq!(validator.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(7 * 24 * 60 * 60)).await;

        assert_eq!(validator.purge_expired(), 2);
        assert_eq!(validator.cached_domains(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_large_cache_sweeps_itself() {
        let resolver = StaticMxResolver::new();
        let validator = validator(&resolver, DnsConfig::default());

        for n in 0..SWEEP_THRESHOLD {
            assert!(!validator.validate_domain(&format!("x@one-off-{n}.com")).await);
        }
        assert_eq!(validator.cached_domains(), SWEEP_THRESHOLD);

        tokio::time::advance(Duration::from_secs(7 * 24 * 60 * 60)).await;

        assert!(!validator.validate_domain("x@latest.com").await);
        assert_eq!(validator.cached_domains(), 1);
    }

    #[tokio::test]
    async fn format_failures_never_reach_the_resolver() {
        let resolver = StaticMxResolver::new().with_domain("good.com");
        let validator = validator(&resolver, DnsConfig::default());

        assert_eq!(validator.check("bad-format").await, AddressCheck::InvalidFormat);
        assert_eq!(validator.check("a@good").await, AddressCheck::InvalidFormat);
        assert_eq!(resolver.lookups(), 0);

        assert_eq!(validator.check("a@good.com").await, AddressCheck::Valid);
        assert_eq!(
            validator.check("x@nonexistent-domain-xyz.com").await,
            AddressCheck::DomainNotFound
        );
        assert_eq!(resolver.lookups(), 2);
    }
}
