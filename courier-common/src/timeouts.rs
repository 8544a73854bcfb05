//! Server-side SMTP timeouts.
//!
//! Defaults follow the RFC 5321 section 4.5.3.2 recommendations for a
//! receiving server. The relay listener only talks to the local submission
//! client, so operators usually shorten them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Timeout for SMTP commands (EHLO, AUTH, MAIL FROM, RCPT TO, ...).
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::command_secs")]
    pub command_secs: u64,

    /// Timeout while waiting for each block of message data.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::data_block_secs")]
    pub data_block_secs: u64,

    /// Maximum total connection duration.
    ///
    /// Default: 1800 seconds
    #[serde(default = "defaults::connection_secs")]
    pub connection_secs: u64,
}

impl ServerTimeouts {
    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data_block(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    #[must_use]
    pub const fn connection(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::command_secs(),
            data_block_secs: defaults::data_block_secs(),
            connection_secs: defaults::connection_secs(),
        }
    }
}

mod defaults {
    pub const fn command_secs() -> u64 {
        300
    }

    pub const fn data_block_secs() -> u64 {
        180
    }

    pub const fn connection_secs() -> u64 {
        1800
    }
}
