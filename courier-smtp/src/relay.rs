//! The seam between "a message is ready" and "it left the building".

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// A message ready to hand to a mail system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    /// Reuse this Message-ID instead of generating one.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Proof the upstream system accepted a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReceipt {
    pub message_id: String,
}

/// Something that can take a message off our hands.
#[async_trait]
pub trait RelayTransport: Send + Sync + std::fmt::Debug {
    /// Hands `message` over, returning the Message-ID it was sent with.
    ///
    /// # Errors
    ///
    /// Returns a [`RelayError`] describing why the message was not accepted.
    async fn relay(&self, message: &OutboundMessage) -> Result<RelayReceipt, RelayError>;
}

/// A transport that accepts everything and remembers it.
///
/// Optionally fails every message, or every message for given recipients.
#[derive(Debug, Clone, Default)]
pub struct RecordingRelay {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    fail_all: Option<String>,
    fail_for: Arc<Vec<String>>,
}

impl RecordingRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every message with a permanent rejection carrying `reason`.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_all: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Refuse messages addressed to any of `recipients`.
    #[must_use]
    pub fn failing_for<I, S>(recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fail_for: Arc::new(
                recipients
                    .into_iter()
                    .map(|r| r.as_ref().to_ascii_lowercase())
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Every message accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accepted messages addressed to `recipient`.
    #[must_use]
    pub fn sent_to(&self, recipient: &str) -> usize {
        self.sent()
            .iter()
            .filter(|message| {
                message
                    .to
                    .iter()
                    .any(|to| to.eq_ignore_ascii_case(recipient))
            })
            .count()
    }
}

#[async_trait]
impl RelayTransport for RecordingRelay {
    async fn relay(&self, message: &OutboundMessage) -> Result<RelayReceipt, RelayError> {
        if let Some(reason) = &self.fail_all {
            return Err(RelayError::Rejected {
                code: 554,
                message: reason.clone(),
            });
        }

        if message
            .to
            .iter()
            .any(|to| self.fail_for.contains(&to.to_ascii_lowercase()))
        {
            return Err(RelayError::Rejected {
                code: 550,
                message: String::from("5.1.1 Mailbox unavailable"),
            });
        }

        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| crate::mime::message_id_for(&message.from));

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        Ok(RelayReceipt { message_id })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            from: String::from("news@acme.com"),
            to: vec![to.to_string()],
            subject: String::from("Hi"),
            text: Some(String::from("Hello")),
            html: None,
            message_id: None,
        }
    }

    #[tokio::test]
    async fn records_and_keeps_message_id() {
        let relay = RecordingRelay::new();

        let receipt = relay.relay(&message("a@good.com")).await.unwrap();
        assert!(receipt.message_id.ends_with("@acme.com>"));

        let mut with_id = message("b@good.com");
        with_id.message_id = Some(String::from("<fixed@acme.com>"));
        let receipt = relay.relay(&with_id).await.unwrap();
        assert_eq!(receipt.message_id, "<fixed@acme.com>");

        assert_eq!(relay.sent().len(), 2);
        assert_eq!(relay.sent_to("A@good.com"), 1);
    }

    #[tokio::test]
    async fn selective_failure() {
        let relay = RecordingRelay::failing_for(["Bounce@good.com"]);

        assert!(relay.relay(&message("a@good.com")).await.is_ok());
        let err = relay.relay(&message("bounce@good.com")).await.unwrap_err();
        assert!(!err.is_temporary());
        assert_eq!(relay.sent().len(), 1);
    }

    #[tokio::test]
    async fn failing_relay_sends_nothing() {
        let relay = RecordingRelay::failing("upstream down");
        assert!(relay.relay(&message("a@good.com")).await.is_err());
        assert!(relay.sent().is_empty());
    }
}
