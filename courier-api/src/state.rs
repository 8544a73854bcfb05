use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use courier_dispatch::{Dispatcher, Tenant, TenantRegistry};

use crate::error::ApiError;

/// Identifies the calling tenant. Authenticating the caller happens in
/// front of this service; by the time a request arrives the header is
/// trusted.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub tenants: Arc<TenantRegistry>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, tenants: TenantRegistry) -> Self {
        Self {
            dispatcher,
            tenants: Arc::new(tenants),
        }
    }
}

/// The tenant a request acts for, resolved from [`TENANT_HEADER`].
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub Arc<Tenant>);

impl FromRequestParts<AppState> for CurrentTenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingTenant)?;

        state
            .tenants
            .get(id)
            .map(Self)
            .ok_or(ApiError::UnknownTenant)
    }
}
