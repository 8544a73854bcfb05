//! Syntactic address checks.
//!
//! The rules are deliberately narrower than RFC 5322: quoted local parts,
//! comments, IP literals and internationalised domains are all rejected.
//! What passes here is an address every mainstream provider will accept in
//! a `RCPT TO`.

/// Maximum length of a forward path (RFC 5321 section 4.5.3.1.3 minus brackets).
const MAX_ADDRESS_LEN: usize = 254;
const MAX_LOCAL_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Printable specials allowed in a dot-atom local part.
const LOCAL_SPECIALS: &str = "!#$%&'*+/=?^_`{|}~-";

/// Canonical form used for identity comparisons: trimmed and lower-cased.
#[must_use]
pub fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

/// The domain part of `address`, if it has exactly one `@` and both halves
/// are non-empty.
#[must_use]
pub fn domain_of(address: &str) -> Option<&str> {
    let (local, domain) = address.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(domain)
}

/// Conservative syntactic validation: local part, a single `@`, a
/// dot-separated domain and a top-level domain of at least two letters.
#[must_use]
pub fn validate_format(address: &str) -> bool {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN {
        return false;
    }

    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };

    valid_local(local) && valid_domain(domain)
}

fn valid_local(local: &str) -> bool {
    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return false;
    }

    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }

    local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || LOCAL_SPECIALS.contains(c))
}

fn valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    if !labels.iter().all(|label| valid_label(label)) {
        return false;
    }

    labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
