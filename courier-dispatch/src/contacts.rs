//! The contact collection campaigns are resolved against.
//!
//! Contacts are owned by the account layer; dispatch only reads the ones a
//! tenant may still mail.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use courier_validator::normalize;
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Contact {
    pub email: String,
    #[serde(default = "opted_in_default")]
    pub opted_in: bool,
    #[serde(default)]
    pub bounced: bool,
}

const fn opted_in_default() -> bool {
    true
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            opted_in: true,
            bounced: false,
        }
    }

    #[must_use]
    pub const fn opted_out(mut self) -> Self {
        self.opted_in = false;
        self
    }

    #[must_use]
    pub const fn bounced(mut self) -> Self {
        self.bounced = true;
        self
    }

    pub const fn is_reachable(&self) -> bool {
        self.opted_in && !self.bounced
    }
}

#[async_trait]
pub trait ContactDirectory: Send + Sync + std::fmt::Debug {
    /// A tenant's contacts; unknown tenants have none.
    async fn contacts(&self, tenant_id: &str) -> Result<Vec<Contact>>;
}

/// Contacts held in memory, usually loaded from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticContactDirectory {
    tenants: HashMap<String, Vec<Contact>>,
}

impl StaticContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_contact(mut self, tenant_id: &str, contact: Contact) -> Self {
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .push(contact);
        self
    }
}

#[async_trait]
impl ContactDirectory for StaticContactDirectory {
    async fn contacts(&self, tenant_id: &str) -> Result<Vec<Contact>> {
        Ok(self.tenants.get(tenant_id).cloned().unwrap_or_default())
    }
}

/// Resolves a campaign's recipients.
///
/// Only opted-in, non-bounced contacts are eligible. With an explicit list
/// the result is that list (in its order) restricted to eligible contacts;
/// without one, or with an empty one, it is every eligible contact. Each
/// address appears once, normalised.
pub fn resolve_targets(contacts: &[Contact], explicit: Option<&[String]>) -> Vec<String> {
    let eligible = contacts
        .iter()
        .filter(|contact| contact.is_reachable())
        .map(|contact| normalize(&contact.email));

    let mut seen = HashSet::new();

    match explicit.filter(|list| !list.is_empty()) {
        Some(list) => {
            let eligible: HashSet<String> = eligible.collect();
            list.iter()
                .map(|address| normalize(address))
                .filter(|address| eligible.contains(address) && seen.insert(address.clone()))
                .collect()
        }
        None => eligible
            .filter(|address| seen.insert(address.clone()))
            .collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn contacts() -> Vec<Contact> {
        vec![
            Contact::new("a@good.com"),
            Contact::new("B@Good.com"),
            Contact::new("quiet@good.com").opted_out(),
            Contact::new("gone@good.com").bounced(),
            Contact::new("b@good.com"),
        ]
    }

    #[test]
    fn all_reachable_contacts_without_a_list() {
        assert_eq!(
            resolve_targets(&contacts(), None),
            vec!["a@good.com", "b@good.com"]
        );
    }

    #[test]
    fn explicit_list_is_intersected() {
        let explicit = vec![
            String::from("b@good.com"),
            String::from("stranger@good.com"),
            String::from("quiet@good.com"),
            String::from("A@GOOD.COM"),
        ];

        assert_eq!(
            resolve_targets(&contacts(), Some(&explicit)),
            vec!["b@good.com", "a@good.com"]
        );
    }

    #[test]
    fn duplicates_differing_in_case_collapse() {
        let explicit = vec![
            String::from("a@good.com"),
            String::from("A@Good.com"),
            String::from(" a@good.com "),
        ];

        assert_eq!(
            resolve_targets(&contacts(), Some(&explicit)),
            vec!["a@good.com"]
        );
    }

    #[test]
    fn empty_list_means_everyone() {
        assert_eq!(
            resolve_targets(&contacts(), Some(&[])),
            resolve_targets(&contacts(), None)
        );
    }

    #[test]
    fn no_contacts_no_targets() {
        assert!(resolve_targets(&[], None).is_empty());
        assert!(resolve_targets(&[], Some(&[String::from("a@good.com")])).is_empty());
    }

    #[tokio::test]
    async fn static_directory() {
        let directory = StaticContactDirectory::new()
            .with_contact("acme", Contact::new("a@good.com"))
            .with_contact("acme", Contact::new("b@good.com").bounced());

        assert_eq!(directory.contacts("acme").await.unwrap().len(), 2);
        assert!(directory.contacts("globex").await.unwrap().is_empty());
    }

    #[test]
    fn directory_from_ron() {
        let directory: StaticContactDirectory = ron::from_str(
            r#"{ "acme": [(email: "a@good.com"), (email: "b@good.com", opted_in: false)] }"#,
        )
        .unwrap();

        let acme = &directory.tenants["acme"];
        assert!(acme[0].is_reachable());
        assert!(!acme[1].is_reachable());
    }
}
