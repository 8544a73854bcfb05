//! Relaying to the operator's real mailbox provider.

use std::time::Duration;

use async_trait::async_trait;
use courier_common::internal;
use serde::{Deserialize, Serialize};

use crate::{
    client::{ClientError, SmtpClient},
    error::RelayError,
    mime,
    relay::{OutboundMessage, RelayReceipt, RelayTransport},
};

/// How the connection to the provider is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Security {
    /// Plain connect, then upgrade with STARTTLS (port 587). The upgrade is
    /// mandatory: a provider that does not offer it is refused.
    #[default]
    StartTls,
    /// TLS from the first byte (port 465).
    Tls,
    /// No TLS at all. Only sensible for local test servers.
    Plain,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Skip certificate verification. Never enable against a real provider.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "defaults::ehlo_name")]
    pub ehlo_name: String,
    /// Per-command reply timeout, also used for connecting.
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
}

mod defaults {
    pub fn host() -> String {
        String::from("localhost")
    }

    pub const fn port() -> u16 {
        587
    }

    pub fn ehlo_name() -> String {
        String::from("localhost")
    }

    pub const fn timeout_secs() -> u64 {
        30
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            security: Security::default(),
            username: None,
            password: None,
            accept_invalid_certs: false,
            ehlo_name: defaults::ehlo_name(),
            timeout_secs: defaults::timeout_secs(),
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("ehlo_name", &self.ehlo_name)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl UpstreamConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [`RelayTransport`] that opens one SMTP session per message.
#[derive(Debug, Clone)]
pub struct SmtpRelay {
    config: UpstreamConfig,
}

impl SmtpRelay {
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        if config.accept_invalid_certs {
            tracing::warn!(
                server = %config.address(),
                "SECURITY WARNING: TLS certificate validation is disabled for the upstream relay"
            );
        }

        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Connects, secures and greets, leaving the session ready for MAIL.
    async fn open(&self) -> Result<SmtpClient, RelayError> {
        let config = &self.config;
        let address = config.address();

        let mut client = match config.security {
            Security::Tls => {
                SmtpClient::connect_tls(
                    &address,
                    config.host.clone(),
                    config.timeout(),
                    config.accept_invalid_certs,
                )
                .await?
            }
            Security::StartTls | Security::Plain => {
                SmtpClient::connect(&address, config.host.clone(), config.timeout())
                    .await?
                    .accept_invalid_certs(config.accept_invalid_certs)
            }
        };

        client.read_greeting().await?;
        let ehlo = client.ehlo(&config.ehlo_name).await?;

        if config.security == Security::StartTls {
            if ehlo.advertises("STARTTLS").is_none() {
                return Err(RelayError::Protocol(format!(
                    "{address} does not offer STARTTLS"
                )));
            }
            client.starttls().await?;
            client.ehlo(&config.ehlo_name).await?;
        }

        if let Some(username) = &config.username {
            let password = config.password.as_deref().unwrap_or_default();
            match client.auth_plain(username, password).await {
                Err(ClientError::AuthUnsupported) => {
                    client.auth_login(username, password).await?;
                }
                other => {
                    other?;
                }
            }
        }

        Ok(client)
    }
}

#[async_trait]
impl RelayTransport for SmtpRelay {
    #[tracing::instrument(skip_all, fields(server = %self.config.address(), recipients = message.to.len()))]
    async fn relay(&self, message: &OutboundMessage) -> Result<RelayReceipt, RelayError> {
        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| mime::message_id_for(&message.from));
        let body = mime::compose(message, &message_id)
            .map_err(|err| RelayError::Protocol(err.to_string()))?;

        let mut client = self.open().await?;

        let size = client
            .capabilities()
            .and_then(|caps| caps.advertises("SIZE"))
            .map(|_| body.len());
        client.mail_from(&message.from, size).await?;
        for recipient in &message.to {
            client.rcpt_to(recipient).await?;
        }
        client.data(&body).await?;

        if let Err(err) = client.quit().await {
            tracing::debug!(%err, "QUIT failed after the message was accepted");
        }

        internal!(level = INFO, "Relayed {message_id} upstream");
        Ok(RelayReceipt { message_id })
    }
}
