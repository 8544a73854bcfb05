//! Error types for the courier-smtp crate.

use thiserror::Error;

use crate::client::ClientError;

/// A message body that could not be turned into something relayable.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),

    #[error("Message has no recipients")]
    NoRecipients,
}

/// Failure to hand a message to the upstream mail system.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream server answered with an error reply.
    #[error("Upstream rejected message: {code} {message}")]
    Rejected { code: u16, message: String },

    /// The upstream server could not be reached or the connection failed.
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// The conversation went wrong in a way retrying will not fix.
    #[error("Relay protocol error: {0}")]
    Protocol(String),

    /// The upstream server stopped answering.
    #[error("Upstream timed out after {0}s")]
    Timeout(u64),
}

impl RelayError {
    /// Returns `true` if a later attempt could succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Rejected { code, .. } => *code >= 400 && *code < 500,
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Protocol(_) => false,
        }
    }
}

impl From<ClientError> for RelayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => {
                Self::Rejected { code, message }
            }
            ClientError::Io(err) => Self::Unavailable(err.to_string()),
            ClientError::ConnectionClosed => Self::Unavailable(String::from("connection closed")),
            ClientError::TlsError(err) => Self::Unavailable(format!("TLS: {err}")),
            ClientError::Timeout(secs) => Self::Timeout(secs),
            err @ (ClientError::ParseError(_)
            | ClientError::AuthUnsupported
            | ClientError::Utf8Error(_)) => Self::Protocol(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(
            RelayError::Rejected {
                code: 451,
                message: String::from("try later"),
            }
            .is_temporary()
        );
        assert!(
            !RelayError::Rejected {
                code: 550,
                message: String::from("no such user"),
            }
            .is_temporary()
        );
        assert!(RelayError::Timeout(30).is_temporary());
        assert!(!RelayError::Protocol(String::from("bad reply")).is_temporary());
    }

    #[test]
    fn client_errors_keep_reply_text() {
        let err = RelayError::from(ClientError::SmtpError {
            code: 535,
            message: String::from("5.7.8 Authentication credentials invalid"),
        });

        assert_eq!(
            err.to_string(),
            "Upstream rejected message: 535 5.7.8 Authentication credentials invalid"
        );
        assert!(!err.is_temporary());
    }
}
