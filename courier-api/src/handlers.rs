//! Request handlers

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use courier_dispatch::{BulkRequest, CampaignRequest, EmailDraft, Report};
use courier_store::{DeliveryLogEntry, DeliveryLogId};
use serde::Deserialize;

use crate::{
    error::ApiError,
    state::{AppState, CurrentTenant},
};

/// `POST /send`
///
/// A relay failure still answers with a report, under `502 Bad Gateway`.
pub async fn send_one(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Json(draft): Json<EmailDraft>,
) -> Result<Response, ApiError> {
    let result = state.dispatcher.send_one(&tenant, draft).await?;
    let report = Report::single(result);

    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(report)).into_response())
}

/// `POST /send/bulk`
pub async fn send_bulk(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Json(request): Json<BulkRequest>,
) -> Json<Report> {
    Json(state.dispatcher.send_bulk(&tenant, request).await)
}

/// `POST /send/campaign`
pub async fn send_campaign(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Json(request): Json<CampaignRequest>,
) -> Result<Json<Report>, ApiError> {
    Ok(Json(state.dispatcher.send_campaign(&tenant, request).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub campaign: Option<String>,
}

/// `GET /logs[?campaign=<id>]`
pub async fn list_logs(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<DeliveryLogEntry>>, ApiError> {
    let store = state.dispatcher.store();

    let entries = match query.campaign.as_deref() {
        Some(campaign) => store.list_by_campaign(&tenant.id, campaign).await?,
        None => store.list_by_tenant(&tenant.id).await?,
    };

    Ok(Json(entries))
}

/// `GET /logs/{id}`
///
/// Another tenant's entry is reported as missing.
pub async fn get_log(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Path(id): Path<String>,
) -> Result<Json<DeliveryLogEntry>, ApiError> {
    let id: DeliveryLogId = id.parse().map_err(|_| ApiError::InvalidId(id))?;
    let entry = state.dispatcher.store().get(&id).await?;

    if entry.tenant_id != tenant.id {
        return Err(ApiError::NotFound);
    }

    Ok(Json(entry))
}
