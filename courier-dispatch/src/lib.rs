//! The dispatch engine: turns single, bulk and campaign send requests into
//! independent per-recipient attempts, each validated, logged `pending`,
//! relayed and settled on its own.

pub mod config;
pub mod contacts;
pub mod dispatcher;
pub mod error;
pub mod report;
pub mod request;
pub mod tenant;

pub use config::{DispatchConfig, Route};
pub use contacts::{Contact, ContactDirectory, StaticContactDirectory, resolve_targets};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Rejection, Result};
pub use report::{RecipientResult, Report, Summary};
pub use request::{BulkRequest, CampaignRequest, EmailDraft};
pub use tenant::{Tenant, TenantRegistry};
