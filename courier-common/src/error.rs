//! Error types shared by the long-lived network services.

use std::io;

use thiserror::Error;

/// Errors that can occur during session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol error occurred during session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,

    /// Session timed out.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors that can occur in a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The socket is already bound by another process.
    #[error("Address {address} is already in use")]
    AddressInUse {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The listener would be reachable from other hosts.
    #[error("Refusing to listen on {address}: only loopback addresses are allowed")]
    NotLoopback { address: String },

    /// No usable credentials were configured.
    #[error("Listener credentials are missing or blank")]
    MissingCredentials,

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}

impl ListenerError {
    /// Classify a bind failure, separating "someone else owns the port" from
    /// every other reason.
    #[must_use]
    pub fn bind(address: impl Into<String>, source: io::Error) -> Self {
        let address = address.into();
        if source.kind() == io::ErrorKind::AddrInUse {
            Self::AddressInUse { address, source }
        } else {
            Self::BindFailed { address, source }
        }
    }

    /// Returns `true` if the listener could not start because the port is taken.
    #[must_use]
    pub const fn is_address_in_use(&self) -> bool {
        matches!(self, Self::AddressInUse { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn session_error_classification() {
        let err = SessionError::Shutdown;
        assert!(err.is_shutdown());
        assert!(!err.is_client_error());

        let err = SessionError::Protocol("Invalid command".to_string());
        assert!(!err.is_shutdown());
        assert!(err.is_client_error());

        let err = SessionError::Timeout(30);
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Session timed out after 30 seconds");
    }

    #[test]
    fn bind_error_classification() {
        let err = ListenerError::bind(
            "127.0.0.1:2525",
            io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(err.is_address_in_use());
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Address 127.0.0.1:2525 is already in use");

        let err = ListenerError::bind(
            "127.0.0.1:25",
            io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        );
        assert!(!err.is_address_in_use());
        assert_eq!(
            err.to_string(),
            "Failed to bind to 127.0.0.1:25: access denied"
        );
    }
}
