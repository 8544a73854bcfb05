//! Error types for the courier-dispatch crate.

use courier_store::StoreError;
use thiserror::Error;

/// Why a recipient was turned away before any attempt was logged.
///
/// The `Display` strings are the per-recipient reasons callers see in a
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing fields")]
    MissingFields,

    #[error("invalid format")]
    InvalidFormat,

    #[error("domain not found")]
    DomainNotFound,

    /// The recipient is the operator's own mailbox.
    #[error("operator mailbox")]
    OperatorMailbox,
}

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A single send was refused before anything was logged or sent.
    #[error("Recipient rejected: {0}")]
    Rejected(Rejection),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    /// The contact directory could not be read.
    #[error("Contact lookup failed: {0}")]
    Contacts(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The task running the attempt panicked or was cancelled by the
    /// runtime.
    #[error("Delivery attempt did not complete: {0}")]
    Interrupted(String),
}

impl DispatchError {
    /// Errors the caller caused and can fix by changing the request.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::UnknownTenant(_))
    }
}

impl From<Rejection> for DispatchError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reasons() {
        assert_eq!(Rejection::MissingFields.to_string(), "missing fields");
        assert_eq!(Rejection::InvalidFormat.to_string(), "invalid format");
        assert_eq!(Rejection::DomainNotFound.to_string(), "domain not found");
        assert_eq!(Rejection::OperatorMailbox.to_string(), "operator mailbox");
    }

    #[test]
    fn classification() {
        assert!(DispatchError::from(Rejection::InvalidFormat).is_client_error());
        assert!(DispatchError::UnknownTenant(String::from("nobody")).is_client_error());
        assert!(!DispatchError::Contacts(String::from("offline")).is_client_error());
        assert!(!DispatchError::Interrupted(String::from("panicked")).is_client_error());
        assert!(
            !DispatchError::from(StoreError::Internal(String::from("poisoned"))).is_client_error()
        );
    }
}
