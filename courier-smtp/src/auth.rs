//! SASL PLAIN and LOGIN decoding for the submission listener.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// The single credential pair the relay listener accepts.
///
/// There is no usable default: the listener refuses to bind with blank
/// credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }

    /// Both halves are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.trim().is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decodes one base64 SASL line into UTF-8.
pub fn decode_line(line: &str) -> Option<String> {
    let bytes = STANDARD.decode(line.trim().as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Decodes an RFC 4616 PLAIN response (`authzid NUL authcid NUL passwd`)
/// into `(username, password)`. The authorization identity is ignored.
pub fn decode_plain(response: &str) -> Option<(String, String)> {
    let decoded = decode_line(response)?;
    let mut fields = decoded.split('\0');

    let (_authzid, username, password) = (fields.next()?, fields.next()?, fields.next()?);
    if fields.next().is_some() || username.is_empty() {
        return None;
    }

    Some((username.to_string(), password.to_string()))
}

/// Builds the PLAIN initial response for `credentials`.
#[must_use]
pub fn encode_plain(credentials: &Credentials) -> String {
    STANDARD.encode(format!(
        "\0{}\0{}",
        credentials.username, credentials.password
    ))
}
