//! HTTP listener configuration

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;

/// Configuration for the send API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiConfig {
    /// When disabled, the API server will not start.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Address to bind the API server (default: `127.0.0.1:8025`)
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Requests taking longer than this are answered with a timeout
    /// (default: 300). Campaigns run to completion inside one request, so
    /// keep this generous.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_enabled() -> bool {
    true
}

const fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8025)
}

const fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_address: default_listen_address(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config: ApiConfig = ron::from_str("()").unwrap();
        assert_eq!(config, ApiConfig::default());
        assert_eq!(config.listen_address.to_string(), "127.0.0.1:8025");
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn overrides() {
        let config: ApiConfig =
            ron::from_str(r#"(enabled: false, listen_address: "[::1]:9000")"#).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.listen_address.port(), 9000);
    }
}
