use std::collections::HashSet;

use crate::format::normalize;

/// The set of mailboxes that must never receive a relayed message.
///
/// Comparison is on the normalised form, so casing and surrounding
/// whitespace never let an address slip through.
#[derive(Debug, Clone, Default)]
pub struct SelfSendShield {
    protected: HashSet<String>,
}

impl SelfSendShield {
    pub fn new<I, S>(mailboxes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            protected: mailboxes
                .into_iter()
                .map(|mailbox| normalize(mailbox.as_ref()))
                .filter(|mailbox| !mailbox.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn protects(&self, address: &str) -> bool {
        self.protected.contains(&normalize(address))
    }

    /// `true` if any of `addresses` is protected.
    pub fn protects_any<'a>(&self, addresses: impl IntoIterator<Item = &'a str>) -> bool {
        addresses.into_iter().any(|address| self.protects(address))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.protected.is_empty()
    }
}
