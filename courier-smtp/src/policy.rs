//! Per-recipient acceptance and sender selection for the relay listener.

use std::{collections::HashMap, sync::Arc};

use courier_validator::{AddressCheck, AddressValidator, SelfSendShield, normalize};

/// Outcome of checking one `RCPT TO` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientVerdict {
    Accept,
    /// The address is one of our own mailboxes.
    Shielded,
    InvalidFormat,
    DomainNotFound,
}

/// Decides whether a recipient may be relayed to.
///
/// The self-send shield runs first and needs no network, so a protected
/// mailbox is refused even when the validator is misconfigured.
#[derive(Debug, Clone)]
pub struct RecipientPolicy {
    validator: Arc<AddressValidator>,
    shield: Arc<SelfSendShield>,
}

impl RecipientPolicy {
    pub const fn new(validator: Arc<AddressValidator>, shield: Arc<SelfSendShield>) -> Self {
        Self { validator, shield }
    }

    #[must_use]
    pub fn shield(&self) -> &SelfSendShield {
        &self.shield
    }

    pub async fn assess(&self, address: &str) -> RecipientVerdict {
        if self.shield.protects(address) {
            return RecipientVerdict::Shielded;
        }

        match self.validator.check(address).await {
            AddressCheck::Valid => RecipientVerdict::Accept,
            AddressCheck::InvalidFormat => RecipientVerdict::InvalidFormat,
            AddressCheck::DomainNotFound => RecipientVerdict::DomainNotFound,
        }
    }
}

/// Picks the `From` address for relayed mail.
///
/// The envelope sender only selects among configured addresses; a sender we
/// do not know falls back to the default, so the client never chooses what
/// the upstream provider sees.
#[derive(Debug, Clone)]
pub struct SenderPolicy {
    default_from: String,
    known: HashMap<String, String>,
}

impl SenderPolicy {
    pub fn new<I, S>(default_from: impl Into<String>, known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default_from: default_from.into(),
            known: known
                .into_iter()
                .map(Into::into)
                .map(|from: String| (normalize(&from), from))
                .collect(),
        }
    }

    #[must_use]
    pub fn authoritative_from(&self, envelope_sender: Option<&str>) -> &str {
        envelope_sender
            .and_then(|sender| self.known.get(&normalize(sender)))
            .map_or(self.default_from.as_str(), String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_validator::{DnsConfig, StaticMxResolver};

    use super::*;

    fn policy() -> RecipientPolicy {
        let resolver = StaticMxResolver::default().with_domain("good.com");
        RecipientPolicy::new(
            Arc::new(AddressValidator::new(
                Arc::new(resolver),
                DnsConfig::default(),
            )),
            Arc::new(SelfSendShield::new(["owner@good.com"])),
        )
    }

    #[tokio::test]
    async fn verdicts() {
        let policy = policy();

        assert_eq!(policy.assess("a@good.com").await, RecipientVerdict::Accept);
        assert_eq!(
            policy.assess("OWNER@good.com").await,
            RecipientVerdict::Shielded
        );
        assert_eq!(
            policy.assess("bad-format").await,
            RecipientVerdict::InvalidFormat
        );
        assert_eq!(
            policy.assess("x@nonexistent-domain-xyz.com").await,
            RecipientVerdict::DomainNotFound
        );
    }

    #[test]
    fn sender_is_never_client_chosen() {
        let senders = SenderPolicy::new("noreply@courier.local", ["News@Acme.com"]);

        assert_eq!(
            senders.authoritative_from(Some("news@acme.com")),
            "News@Acme.com"
        );
        assert_eq!(
            senders.authoritative_from(Some("ceo@evil.com")),
            "noreply@courier.local"
        );
        assert_eq!(senders.authoritative_from(None), "noreply@courier.local");
    }
}
