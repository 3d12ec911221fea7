//! Device auth middleware.
//!
//! Resolves the `x-device-token` header into a `DeviceContext` request
//! extension and enforces the binding rules: the device must be active, its
//! store must be active, and any `storeId` the client smuggles into the
//! query string or request body (at any nesting depth) must equal the bound
//! store.

use crate::api::AppState;
use crate::errors::{ApiError, ApiResult};
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Resolved device -> store binding, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub device_id: String,
    pub store_id: Option<String>,
    pub device_active: bool,
    pub store_active: bool,
    pub store_name: Option<String>,
}

impl DeviceContext {
    /// Bound store id, or `device_not_enrolled` for unbound devices.
    pub fn require_store(&self) -> ApiResult<&str> {
        self.store_id
            .as_deref()
            .ok_or_else(|| ApiError::forbidden("device_not_enrolled"))
    }
}

async fn resolve_token(state: &AppState, token: &str) -> ApiResult<Option<DeviceContext>> {
    let token = token.to_string();
    state
        .db
        .read(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT d.id, d.store_id, d.active, COALESCE(s.active, 0), s.upi_vpa, s.name
                     FROM pos_devices d LEFT JOIN stores s ON s.id = d.store_id
                     WHERE d.device_token = ?1",
                    params![token],
                    |row| {
                        let upi_vpa: Option<String> = row.get(4)?;
                        Ok(DeviceContext {
                            device_id: row.get(0)?,
                            store_id: row.get(1)?,
                            device_active: row.get::<_, i64>(2)? != 0,
                            // A store is only active while it carries a
                            // usable UPI VPA.
                            store_active: row.get::<_, i64>(3)? != 0
                                && upi_vpa.map_or(false, |v| !v.trim().is_empty()),
                            store_name: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
}

fn token_from_request(req: &Request) -> Option<String> {
    req.headers()
        .get("x-device-token")
        .and_then(|h| h.to_str().ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Collect every `storeId` string found anywhere in a JSON document.
fn collect_store_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "storeId" {
                    if let Value::String(s) = child {
                        out.push(s.clone());
                    }
                }
                collect_store_ids(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_store_ids(child, out);
            }
        }
        _ => {}
    }
}

fn query_store_ids(query: Option<&str>) -> Vec<String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.strip_prefix("storeId="))
        .map(|v| v.to_string())
        .collect()
}

/// Strict middleware for every write/read path that acts on the bound store.
pub async fn device_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = token_from_request(&req).ok_or_else(|| ApiError::unauthorized("device_unauthorized"))?;
    let context = resolve_token(&state, &token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("device_unauthorized"))?;

    let bound_store = context.require_store()?.to_string();
    if !context.device_active {
        return Err(ApiError::forbidden("device_inactive"));
    }
    if !context.store_active {
        return Err(ApiError::forbidden("store_inactive"));
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::bad_request("invalid_item").with_message(e.to_string()))?;

    let mut supplied = query_store_ids(parts.uri.query());
    if !bytes.is_empty() {
        if let Ok(json) = serde_json::from_slice::<Value>(&bytes) {
            collect_store_ids(&json, &mut supplied);
        }
    }
    if supplied.iter().any(|s| s != &bound_store) {
        return Err(ApiError::forbidden("store_mismatch"));
    }

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

/// Permissive variant for read-only status endpoints: the token must
/// resolve, but enrollment/active/mismatch checks are left to the handler.
pub async fn device_status(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = token_from_request(&req).ok_or_else(|| ApiError::unauthorized("device_unauthorized"))?;
    let context = resolve_token(&state, &token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("device_unauthorized"))?;
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

/// Admin surface guard: `x-admin-token` must match the configured secret;
/// with no secret configured the surface is disabled outright.
pub async fn admin_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ApiError::new(
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "admin_disabled",
        ));
    };
    let supplied = req
        .headers()
        .get("x-admin-token")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if supplied != expected {
        return Err(ApiError::unauthorized("Unauthorized"));
    }
    Ok(next.run(req).await)
}
