//! The relay half of courier: an authenticated loopback SMTP listener that
//! checks every recipient before handing mail to the operator's provider,
//! plus the client side used to reach both.

pub mod auth;
pub mod client;
pub mod command;
pub mod error;
pub mod mime;
pub mod policy;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;
pub mod submission;
pub mod upstream;

pub use auth::Credentials;
pub use error::{ParseError, RelayError};
pub use policy::{RecipientPolicy, RecipientVerdict, SenderPolicy};
pub use relay::{OutboundMessage, RecordingRelay, RelayReceipt, RelayTransport};
pub use server::{RelayConfig, RelayServer};
pub use submission::SubmissionClient;
pub use upstream::{Security, SmtpRelay, UpstreamConfig};
