//! API error envelope.
//!
//! Every handler failure is an `ApiError` carrying one of the stable error
//! kinds plus an optional human message. Clients key their retry behavior
//! off the `error` token, so kinds are never renamed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// Per-SKU shortfall detail attached to `insufficient_stock` responses.
#[derive(Debug, Clone, Serialize)]
pub struct StockShortfall {
    #[serde(rename = "skuId")]
    pub sku_id: String,
    pub available: i64,
    pub required: i64,
    pub name: String,
    pub message: String,
}

impl StockShortfall {
    pub fn new(sku_id: impl Into<String>, available: i64, required: i64, name: impl Into<String>) -> Self {
        Self {
            sku_id: sku_id.into(),
            available,
            required,
            name: name.into(),
            message: format!("required {} but only {} available", required, available),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: Option<String>,
    pub details: Option<Vec<StockShortfall>>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, kind: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: None,
            details: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn bad_request(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, kind)
    }

    pub fn unauthorized(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, kind)
    }

    pub fn forbidden(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, kind)
    }

    pub fn not_found(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, kind)
    }

    pub fn conflict(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, kind)
    }

    /// 409 with per-SKU `{skuId, available, required, name, message}` details.
    pub fn insufficient_stock(details: Vec<StockShortfall>) -> Self {
        let mut err = Self::conflict("insufficient_stock");
        err.details = Some(details);
        err
    }

    pub fn db_unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error").with_message(message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.kind });
        if let Some(message) = &self.message {
            body["message"] = json!(message);
        }
        if let Some(details) = &self.details {
            body["details"] = json!(details);
        }
        (self.status, Json(body)).into_response()
    }
}
