use thiserror::Error;

/// Errors that can occur during MX resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// The domain exists but publishes no MX records.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed for {domain}: {reason}")]
    LookupFailed { domain: String, reason: String },

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),

    /// The system resolver could not be constructed.
    #[error("Unable to initialise resolver: {0}")]
    Init(#[from] hickory_resolver::ResolveError),
}

impl DnsError {
    /// Returns `true` if this error is temporary and a retry could succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed { .. })
    }
}
