//! Routing engine-generated mail through our own relay listener.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;

use crate::{
    auth::Credentials,
    client::SmtpClient,
    error::RelayError,
    mime,
    relay::{OutboundMessage, RelayReceipt, RelayTransport},
};

/// A [`RelayTransport`] that submits to the local [`RelayServer`], so every
/// message passes the same recipient checks as any other submission.
///
/// [`RelayServer`]: crate::server::RelayServer
#[derive(Debug, Clone)]
pub struct SubmissionClient {
    address: SocketAddr,
    credentials: Credentials,
    timeout: Duration,
}

impl SubmissionClient {
    #[must_use]
    pub const fn new(address: SocketAddr, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            address,
            credentials,
            timeout,
        }
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }
}

#[async_trait]
impl RelayTransport for SubmissionClient {
    #[tracing::instrument(skip_all, fields(relay = %self.address, recipients = message.to.len()))]
    async fn relay(&self, message: &OutboundMessage) -> Result<RelayReceipt, RelayError> {
        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| mime::message_id_for(&message.from));
        let body = mime::compose(message, &message_id)
            .map_err(|err| RelayError::Protocol(err.to_string()))?;

        let address = self.address.to_string();
        let mut client = SmtpClient::connect(&address, self.address.ip().to_string(), self.timeout).await?;

        client.read_greeting().await?;
        client.ehlo("courier.submission").await?;
        client
            .auth_plain(&self.credentials.username, &self.credentials.password)
            .await?;

        client.mail_from(&message.from, Some(body.len())).await?;
        for recipient in &message.to {
            client.rcpt_to(recipient).await?;
        }
        client.data(&body).await?;

        if let Err(err) = client.quit().await {
            tracing::debug!(%err, "QUIT failed after the message was accepted");
        }

        Ok(RelayReceipt { message_id })
    }
}
