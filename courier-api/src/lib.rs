//! HTTP surface for the dispatch engine.
//!
//! Every route acts for the tenant named in the `x-tenant-id` header:
//!
//! | Route | |
//! |---|---|
//! | `POST /send` | one recipient, answered with its outcome |
//! | `POST /send/bulk` | `{ emails: [{ to, subject, text, html }] }` |
//! | `POST /send/campaign` | `{ subject, text, html, emails?, campaignId? }` |
//! | `GET /logs?campaign=` | the tenant's delivery log, optionally one campaign |
//! | `GET /logs/{id}` | one delivery log entry |

mod config;
mod error;
pub mod handlers;
mod server;
mod state;

pub use config::ApiConfig;
pub use error::ApiError;
pub use server::{ApiServer, router};
pub use state::{AppState, CurrentTenant, TENANT_HEADER};
