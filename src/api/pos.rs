//! POS endpoint handlers.
//!
//! Every handler runs behind the device-auth middleware (strict or
//! permissive, see routes.rs) and receives the resolved `DeviceContext` as
//! a request extension. Money is integer minor units throughout.

use crate::api::AppState;
use crate::auth::{enroll_device, DeviceContext, DeviceMeta};
use crate::catalog;
use crate::errors::{ApiError, ApiResult};
use crate::purchases::{self, CreatePurchaseRequest};
use crate::sales::{self, CreateSaleRequest, PaymentMode};
use crate::sync::{self, SyncEnvelope, SyncResponse};
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enrollment / device status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub code: String,
    pub device_meta: DeviceMeta,
}

pub async fn enroll(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> ApiResult<Json<Value>> {
    if request.code.trim().is_empty() {
        return Err(ApiError::bad_request("enrollment_invalid").with_message("code is required"));
    }
    let outcome = state
        .db
        .write_tx(move |tx| enroll_device(tx, &request.code, &request.device_meta))
        .await?;
    Ok(Json(json!(outcome)))
}

pub async fn devices_me(Extension(context): Extension<DeviceContext>) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?;
    Ok(Json(json!({
        "deviceId": context.device_id,
        "storeId": store_id,
        "storeName": context.store_name,
    })))
}

pub async fn ui_status(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
) -> ApiResult<Json<Value>> {
    let device_id = context.device_id.clone();
    let snapshot = state
        .db
        .write_tx(move |tx| {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE pos_devices SET last_seen_online = ?2 WHERE id = ?1",
                params![device_id, now],
            )?;
            let row = tx.query_row(
                "SELECT last_sync_at, pending_outbox_count, app_version, printing_mode
                 FROM pos_devices WHERE id = ?1",
                params![device_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )?;
            Ok((now, row))
        })
        .await?;
    let (last_seen_online, (last_sync_at, pending_outbox_count, app_version, printing_mode)) = snapshot;

    Ok(Json(json!({
        "deviceId": context.device_id,
        "deviceActive": context.device_active,
        "storeId": context.store_id,
        "storeName": context.store_name,
        "storeActive": context.store_active,
        "lastSeenOnline": last_seen_online,
        "lastSyncAt": last_sync_at,
        "pendingOutboxCount": pending_outbox_count,
        "appVersion": app_version,
        "printingMode": printing_mode,
    })))
}

pub async fn store_status(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .read(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, active != 0 AND COALESCE(TRIM(upi_vpa), '') != ''
                     FROM stores WHERE id = ?1",
                    params![store_id],
                    |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, bool>(2)?))
                    },
                )
                .optional()?)
        })
        .await?
        .ok_or_else(|| ApiError::not_found("store not found"))?;

    Ok(Json(json!({
        "storeId": row.0,
        "name": row.1,
        "active": row.2,
    })))
}

// ---------------------------------------------------------------------------
// Scan resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResolveRequest {
    pub scan_value: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub format_hint: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
}

pub async fn scan_resolve(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<ScanResolveRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let raw_value = request.scan_value.trim().to_string();
    if raw_value.is_empty() {
        return Err(ApiError::bad_request("invalid_scan").with_message("scanValue is required"));
    }
    let mode = request.mode.as_deref().unwrap_or("SELL").to_ascii_uppercase();
    if mode != "SELL" && mode != "DIGITISE" {
        return Err(ApiError::bad_request("invalid_scan").with_message("mode must be SELL or DIGITISE"));
    }

    if state.debouncer.is_duplicate(&store_id, &mode, &raw_value) {
        let device_id = context.device_id.clone();
        let (store_id_copy, mode_copy, raw_copy) = (store_id.clone(), mode.clone(), raw_value.clone());
        state
            .db
            .write_tx(move |tx| {
                tx.execute(
                    "INSERT INTO scan_events (id, store_id, device_id, scan_value, mode, action, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'IGNORED', ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        store_id_copy,
                        device_id,
                        raw_copy,
                        mode_copy,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        return Ok(Json(json!({ "action": "IGNORED" })));
    }

    let scan = crate::scan::normalize_scan(request.format_hint.as_deref(), &raw_value)
        .ok_or_else(|| ApiError::bad_request("invalid_scan"))?;

    let device_id = context.device_id.clone();
    let product_name = request.product_name.clone();
    let resolution = state
        .db
        .write_tx(move |tx| {
            catalog::resolve_scan(
                tx,
                &store_id,
                Some(&device_id),
                &mode,
                &raw_value,
                &scan,
                product_name.as_deref(),
            )
        })
        .await?;
    Ok(Json(json!(resolution)))
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSetRequest {
    pub product_id: String,
    pub price_minor: i64,
}

pub async fn set_price(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<PriceSetRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    if request.price_minor < 1 || request.price_minor > sales::MAX_ITEM_PRICE_MINOR {
        return Err(ApiError::bad_request("invalid_item").with_message("items are invalid"));
    }

    state
        .db
        .write_tx(move |tx| {
            catalog::ensure_store_product(tx, &store_id, &request.product_id)?;
            let updated = tx.execute(
                "UPDATE store_products SET sell_price_minor = ?3
                 WHERE store_id = ?1 AND global_product_id = ?2",
                params![store_id, request.product_id, request.price_minor],
            )?;
            if updated == 0 {
                return Err(ApiError::not_found("product_not_found"));
            }
            // Mirror onto the default variant's retail link when one exists.
            let variant_id: Option<String> = tx
                .query_row(
                    "SELECT v.id FROM variants v
                     JOIN products p ON p.id = v.product_id
                     WHERE p.global_product_id = ?1 AND v.unit_base IS NULL AND v.size_base IS NULL",
                    params![request.product_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(variant_id) = variant_id {
                catalog::link_retailer_variant(tx, &store_id, &variant_id, Some(request.price_minor))?;
            }
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Sales and payments
// ---------------------------------------------------------------------------

pub async fn create_sale(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<CreateSaleRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let device_id = context.device_id.clone();
    let summary = state
        .db
        .write_tx(move |tx| sales::create_sale(tx, &store_id, Some(&device_id), &request, false))
        .await?;
    Ok(Json(json!(summary)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub payment_mode: String,
}

pub async fn confirm_sale(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Path(sale_id): Path<String>,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let mode = PaymentMode::parse(&request.payment_mode)
        .ok_or_else(|| ApiError::bad_request("paymentMode_required"))?;
    let summary = state
        .db
        .write_tx(move |tx| sales::confirm_sale(tx, &store_id, &sale_id, mode, None))
        .await?;
    Ok(Json(json!(summary)))
}

pub async fn cancel_sale(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Path(sale_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let summary = state
        .db
        .write_tx(move |tx| sales::cancel_sale(tx, &store_id, &sale_id))
        .await?;
    Ok(Json(json!(summary)))
}

pub async fn upi_init(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    // UPI intent composition is the client's job; a pre-composed intent in
    // the request is always rejected.
    if body.get("upiIntent").is_some() {
        return Err(ApiError::bad_request("upi_intent_not_allowed"));
    }
    let sale_id = body
        .get("saleId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("saleId_required"))?;
    let transaction_id = body
        .get("transactionId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let init = state
        .db
        .write_tx(move |tx| sales::init_upi_payment(tx, &store_id, &sale_id, transaction_id.as_deref()))
        .await?;
    Ok(Json(json!(init)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualConfirmRequest {
    pub payment_id: String,
}

pub async fn upi_confirm_manual(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<ManualConfirmRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let summary = state
        .db
        .write_tx(move |tx| {
            let sale_id = sales::sale_for_payment(tx, &store_id, &request.payment_id)?;
            sales::confirm_sale(tx, &store_id, &sale_id, PaymentMode::Upi, Some(&request.payment_id))
        })
        .await?;
    Ok(Json(json!(summary)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePaymentRequest {
    pub sale_id: String,
}

async fn confirm_with_mode(state: AppState, store_id: String, sale_id: String, mode: PaymentMode) -> ApiResult<Json<Value>> {
    let summary = state
        .db
        .write_tx(move |tx| sales::confirm_sale(tx, &store_id, &sale_id, mode, None))
        .await?;
    Ok(Json(json!(summary)))
}

pub async fn pay_cash(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<SalePaymentRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    confirm_with_mode(state, store_id, request.sale_id, PaymentMode::Cash).await
}

pub async fn pay_due(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<SalePaymentRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    confirm_with_mode(state, store_id, request.sale_id, PaymentMode::Due).await
}

// ---------------------------------------------------------------------------
// Bills (read-only)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PagingQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn list_bills(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Query(paging): Query<PagingQuery>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let bills = state
        .db
        .read(move |conn| {
            sales::list_sales(conn, &store_id, paging.limit.unwrap_or(50), paging.offset.unwrap_or(0))
        })
        .await?;
    Ok(Json(json!({ "bills": bills })))
}

pub async fn bill_detail(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Path(sale_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let detail = state
        .db
        .read(move |conn| sales::sale_detail(conn, &store_id, &sale_id))
        .await?;
    Ok(Json(json!(detail)))
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRequest {
    #[serde(default)]
    pub collection_id: Option<String>,
    pub amount_minor: i64,
    pub mode: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Record a free-standing collection (khata repayment etc.). Client ids
/// make retries idempotent, mirroring the offline sync path.
pub async fn create_collection(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<CollectionRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    if request.amount_minor < 1 {
        return Err(ApiError::bad_request("invalid_item").with_message("items are invalid"));
    }
    let device_id = context.device_id.clone();
    let collection_id = request
        .collection_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let id = collection_id.clone();
    state
        .db
        .write_tx(move |tx| {
            tx.execute(
                "INSERT INTO collections (id, store_id, device_id, amount_minor, mode, reference, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'RECORDED', ?7)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    id,
                    store_id,
                    device_id,
                    request.amount_minor,
                    request.mode.to_ascii_uppercase(),
                    request.reference,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "collectionId": collection_id })))
}

pub async fn list_collections(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Query(paging): Query<PagingQuery>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    let collections = state
        .db
        .read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, amount_minor, mode, reference, status, created_at
                 FROM collections WHERE store_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![store_id, paging.limit.unwrap_or(50).clamp(1, 200), paging.offset.unwrap_or(0).max(0)],
                    |row| {
                        Ok(json!({
                            "collectionId": row.get::<_, String>(0)?,
                            "amountMinor": row.get::<_, i64>(1)?,
                            "mode": row.get::<_, String>(2)?,
                            "reference": row.get::<_, Option<String>>(3)?,
                            "status": row.get::<_, String>(4)?,
                            "createdAt": row.get::<_, String>(5)?,
                        }))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(Json(json!({ "collections": collections })))
}

// ---------------------------------------------------------------------------
// Purchases, sync, telemetry
// ---------------------------------------------------------------------------

pub async fn create_purchase(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(request): Json<CreatePurchaseRequest>,
) -> ApiResult<Json<Value>> {
    let store_id = context.require_store()?.to_string();
    // Client-generated purchase ids carry retry semantics.
    let skip_if_exists = request.purchase_id.is_some();
    let summary = state
        .db
        .write_tx(move |tx| purchases::create_purchase(tx, &store_id, &request, skip_if_exists))
        .await?;
    Ok(Json(json!(summary)))
}

pub async fn sync_batch(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(envelope): Json<SyncEnvelope>,
) -> ApiResult<Json<SyncResponse>> {
    let store_id = context.require_store()?.to_string();
    let device_id = context.device_id.clone();
    let response = state
        .db
        .with_conn(move |conn| sync::process_batch(conn, &store_id, &device_id, &envelope))
        .await?;
    Ok(Json(response))
}

pub async fn record_event(
    State(state): State<AppState>,
    Extension(context): Extension<DeviceContext>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let store_id = context.store_id.clone();
    let device_id = context.device_id.clone();
    let event_type = body
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();
    state
        .db
        .write_tx(move |tx| {
            tx.execute(
                "INSERT INTO pos_events (id, store_id, device_id, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    store_id,
                    device_id,
                    event_type,
                    body.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
