//! API error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use courier_dispatch::DispatchError;
use courier_store::StoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Failed to bind to the specified address
    #[error("Failed to bind API server to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// API server encountered a runtime error
    #[error("API server error: {0}")]
    Server(String),

    #[error("missing tenant")]
    MissingTenant,

    #[error("unknown tenant")]
    UnknownTenant,

    #[error("invalid delivery log id: {0}")]
    InvalidId(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingTenant => StatusCode::UNAUTHORIZED,
            Self::UnknownTenant | Self::Dispatch(DispatchError::UnknownTenant(_)) => {
                StatusCode::FORBIDDEN
            }
            Self::InvalidId(_) | Self::Dispatch(DispatchError::Rejected(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound | Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Dispatch(DispatchError::Contacts(_)) => StatusCode::BAD_GATEWAY,
            Self::Bind { .. }
            | Self::Server(_)
            | Self::Store(_)
            | Self::Dispatch(DispatchError::Store(_) | DispatchError::Interrupted(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            match self {
                Self::Dispatch(DispatchError::Contacts(_)) => String::from("contacts unavailable"),
                _ => String::from("internal server error"),
            }
        } else {
            tracing::debug!(error = %self, "Request rejected");
            match self {
                Self::Dispatch(DispatchError::Rejected(rejection)) => rejection.to_string(),
                other => other.to_string(),
            }
        };

        (
            status,
            Json(json!({
                "success": false,
                "error": message,
            })),
        )
            .into_response()
    }
}
