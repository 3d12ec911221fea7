//! Thin admin surface.
//!
//! Narrow glue over store creation, enrollment-code issuance, device
//! listing, and the inventory/ledger read paths, plus manual stock
//! adjustment. Everything runs behind the `x-admin-token` guard.

use crate::api::AppState;
use crate::auth::issue_enrollment_code;
use crate::errors::{ApiError, ApiResult};
use crate::inventory::{self, MovementRef, MovementType};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

fn require_store(conn: &Connection, store_id: &str) -> ApiResult<()> {
    let known: Option<String> = conn
        .query_row("SELECT id FROM stores WHERE id = ?1", params![store_id], |row| row.get(0))
        .optional()?;
    if known.is_none() {
        return Err(ApiError::not_found("store not found"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoreRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub upi_vpa: Option<String>,
}

fn is_plausible_vpa(vpa: &str) -> bool {
    let mut parts = vpa.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(handle), None) => {
            !user.is_empty() && !handle.is_empty() && !vpa.contains(char::is_whitespace)
        }
        _ => false,
    }
}

pub async fn create_store(
    State(state): State<AppState>,
    Json(request): Json<CreateStoreRequest>,
) -> ApiResult<Json<Value>> {
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::bad_request("storeName_required"))?
        .to_string();
    let upi_vpa = request.upi_vpa.as_deref().map(str::trim).filter(|v| !v.is_empty());
    if let Some(vpa) = upi_vpa {
        if !is_plausible_vpa(vpa) {
            return Err(ApiError::bad_request("upi_vpa_invalid"));
        }
    }
    let upi_vpa = upi_vpa.map(str::to_string);

    let store = state
        .db
        .write_tx(move |tx| {
            let duplicate: Option<String> = tx
                .query_row("SELECT id FROM stores WHERE name = ?1", params![name], |row| row.get(0))
                .optional()?;
            if duplicate.is_some() {
                return Err(ApiError::conflict("store_exists"));
            }

            let store_id = Uuid::new_v4().to_string();
            // Active follows directly from carrying a usable VPA.
            let active = upi_vpa.is_some();
            tx.execute(
                "INSERT INTO stores (id, name, upi_vpa, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![store_id, name, upi_vpa, active as i64, Utc::now().to_rfc3339()],
            )?;
            Ok(json!({ "storeId": store_id, "name": name, "active": active }))
        })
        .await?;
    Ok(Json(store))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeRequest {
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

pub async fn issue_code(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    body: Option<Json<IssueCodeRequest>>,
) -> ApiResult<Json<Value>> {
    if store_id.trim().is_empty() {
        return Err(ApiError::bad_request("storeId_invalid"));
    }
    let ttl_minutes = body.and_then(|Json(b)| b.ttl_minutes);
    let issued = state
        .db
        .write_tx(move |tx| issue_enrollment_code(tx, &store_id, ttl_minutes))
        .await?;
    Ok(Json(json!(issued)))
}

pub async fn list_devices(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let devices = state
        .db
        .read(move |conn| {
            require_store(conn, &store_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, label, device_type, active, last_seen_online, last_sync_at,
                        pending_outbox_count, app_version
                 FROM pos_devices WHERE store_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![store_id], |row| {
                    Ok(json!({
                        "deviceId": row.get::<_, String>(0)?,
                        "label": row.get::<_, Option<String>>(1)?,
                        "deviceType": row.get::<_, Option<String>>(2)?,
                        "active": row.get::<_, i64>(3)? != 0,
                        "lastSeenOnline": row.get::<_, Option<String>>(4)?,
                        "lastSyncAt": row.get::<_, Option<String>>(5)?,
                        "pendingOutboxCount": row.get::<_, i64>(6)?,
                        "appVersion": row.get::<_, Option<String>>(7)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(Json(json!({ "devices": devices })))
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(rename = "globalProductId")]
    #[serde(default)]
    pub global_product_id: Option<String>,
}

/// Per-store stock snapshot: unit inventory joined to catalog names, plus
/// the bulk pools.
pub async fn store_inventory(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let snapshot = state
        .db
        .read(move |conn| {
            require_store(conn, &store_id)?;
            let mut stmt = conn.prepare(
                "SELECT si.global_product_id, gp.global_name, si.available_qty,
                        sp.sell_price_minor, sp.purchase_price_minor
                 FROM store_inventory si
                 JOIN global_products gp ON gp.id = si.global_product_id
                 LEFT JOIN store_products sp
                   ON sp.store_id = si.store_id AND sp.global_product_id = si.global_product_id
                 WHERE si.store_id = ?1
                 ORDER BY gp.global_name",
            )?;
            let products = stmt
                .query_map(params![store_id], |row| {
                    Ok(json!({
                        "globalProductId": row.get::<_, String>(0)?,
                        "name": row.get::<_, String>(1)?,
                        "availableQty": row.get::<_, i64>(2)?,
                        "sellPriceMinor": row.get::<_, Option<i64>>(3)?,
                        "purchasePriceMinor": row.get::<_, Option<i64>>(4)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT bi.product_id, p.name, bi.base_unit, bi.quantity_base
                 FROM bulk_inventory bi JOIN products p ON p.id = bi.product_id
                 WHERE bi.store_id = ?1 ORDER BY p.name",
            )?;
            let bulk = stmt
                .query_map(params![store_id], |row| {
                    Ok(json!({
                        "productId": row.get::<_, String>(0)?,
                        "name": row.get::<_, String>(1)?,
                        "baseUnit": row.get::<_, String>(2)?,
                        "quantityBase": row.get::<_, i64>(3)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(json!({ "products": products, "bulk": bulk }))
        })
        .await?;
    Ok(Json(snapshot))
}

/// Recent ledger movements, optionally narrowed to one product.
pub async fn store_ledger(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Json<Value>> {
    let movements = state
        .db
        .read(move |conn| {
            require_store(conn, &store_id)?;
            let limit = query.limit.unwrap_or(100).clamp(1, 500);
            let mut stmt = conn.prepare(
                "SELECT id, global_product_id, movement_type, quantity, unit_cost_minor,
                        unit_sell_minor, reason, reference_type, reference_id, created_at
                 FROM inventory_ledger
                 WHERE store_id = ?1 AND (?2 IS NULL OR global_product_id = ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![store_id, query.global_product_id, limit], |row| {
                    Ok(json!({
                        "movementId": row.get::<_, String>(0)?,
                        "globalProductId": row.get::<_, String>(1)?,
                        "movementType": row.get::<_, String>(2)?,
                        "quantity": row.get::<_, i64>(3)?,
                        "unitCostMinor": row.get::<_, Option<i64>>(4)?,
                        "unitSellMinor": row.get::<_, Option<i64>>(5)?,
                        "reason": row.get::<_, Option<String>>(6)?,
                        "referenceType": row.get::<_, Option<String>>(7)?,
                        "referenceId": row.get::<_, Option<String>>(8)?,
                        "createdAt": row.get::<_, String>(9)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(Json(json!({ "movements": movements })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRequest {
    pub global_product_id: String,
    /// Signed delta in units; negative writes off stock.
    pub quantity: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Manual stock correction; lands as an ADJUSTMENT ledger movement so the
/// ledger-sum invariant keeps holding.
pub async fn adjust_inventory(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    Json(request): Json<AdjustmentRequest>,
) -> ApiResult<Json<Value>> {
    let new_qty = state
        .db
        .write_tx(move |tx| {
            require_store(tx, &store_id)?;
            inventory::apply_movement(
                tx,
                &store_id,
                &request.global_product_id,
                MovementType::Adjustment,
                request.quantity,
                None,
                None,
                MovementRef {
                    reference_type: None,
                    reference_id: None,
                    reason: request.reason.as_deref(),
                },
            )
        })
        .await?;
    Ok(Json(json!({ "availableQty": new_qty })))
}
