//! Offline sync engine.
//!
//! Applies a client batch of outbox events, one transaction per event.
//! The `processed_events` insert is the idempotency guard: a conflicting
//! event id short-circuits to `duplicate_ignored` (re-emitting the stored
//! sale/collection mapping), and a rejected event rolls back alone without
//! touching its siblings.

use crate::catalog;
use crate::errors::{ApiError, ApiResult};
use crate::purchases::{self, CreatePurchaseRequest};
use crate::sales::{self, CreateSaleRequest, PaymentMode};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    #[serde(default)]
    pub pending_outbox_count: Option<i64>,
    pub events: Vec<SyncEventInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEventInput {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEventResult {
    pub event_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_sale_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_receipt_ref: Option<String>,
    pub server_sale_id: String,
    pub bill_ref: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMapping {
    pub client_collection_id: String,
    pub server_collection_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub results: Vec<SyncEventResult>,
    pub sale_mappings: Vec<SaleMapping>,
    pub collection_mappings: Vec<CollectionMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductUpsertPayload {
    barcode: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    selling_price_minor: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductPriceSetPayload {
    #[serde(default)]
    barcode: Option<String>,
    #[serde(default)]
    variant_id: Option<String>,
    selling_price_minor: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleCreatedPayload {
    #[serde(default)]
    sale_id: Option<String>,
    #[serde(default)]
    offline_receipt_ref: Option<String>,
    items: Vec<sales::SaleItemInput>,
    #[serde(default)]
    discount_minor: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayload {
    sale_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionCreatedPayload {
    #[serde(default)]
    collection_id: Option<String>,
    amount_minor: i64,
    mode: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

enum EventOutcome {
    Plain,
    Sale(SaleMapping),
    Collection(CollectionMapping),
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> ApiResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ApiError::bad_request("invalid_item").with_message(format!("malformed payload: {e}")))
}

/// Process one sync batch. Heartbeat fields are written outside the
/// per-event transactions so a rejected tail never loses them.
pub fn process_batch(
    conn: &mut Connection,
    store_id: &str,
    device_id: &str,
    envelope: &SyncEnvelope,
) -> ApiResult<SyncResponse> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE pos_devices SET last_seen_online = ?2, pending_outbox_count = COALESCE(?3, pending_outbox_count)
         WHERE id = ?1",
        params![device_id, now, envelope.pending_outbox_count],
    )?;

    let mut results = Vec::with_capacity(envelope.events.len());
    let mut sale_mappings = Vec::new();
    let mut collection_mappings = Vec::new();

    for event in &envelope.events {
        match process_event(conn, store_id, device_id, event) {
            Ok((status, outcome)) => {
                match outcome {
                    EventOutcome::Sale(mapping) => sale_mappings.push(mapping),
                    EventOutcome::Collection(mapping) => collection_mappings.push(mapping),
                    EventOutcome::Plain => {}
                }
                results.push(SyncEventResult {
                    event_id: event.event_id.clone(),
                    status,
                    error: None,
                });
            }
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "sync event rejected"
                );
                results.push(SyncEventResult {
                    event_id: event.event_id.clone(),
                    status: "rejected",
                    error: Some(err.kind),
                });
            }
        }
    }

    conn.execute(
        "UPDATE pos_devices SET last_sync_at = ?2 WHERE id = ?1",
        params![device_id, Utc::now().to_rfc3339()],
    )?;

    Ok(SyncResponse { results, sale_mappings, collection_mappings })
}

fn process_event(
    conn: &mut Connection,
    store_id: &str,
    device_id: &str,
    event: &SyncEventInput,
) -> ApiResult<(&'static str, EventOutcome)> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|_| ApiError::db_unavailable())?;

    let inserted = tx.execute(
        "INSERT INTO processed_events (event_id, device_id, store_id, event_type, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(event_id) DO NOTHING",
        params![
            event.event_id,
            device_id,
            store_id,
            event.event_type,
            Utc::now().to_rfc3339(),
        ],
    )?;

    if inserted == 0 {
        let outcome = duplicate_outcome(&tx, store_id, event)?;
        drop(tx); // roll back: a duplicate writes nothing
        return Ok(("duplicate_ignored", outcome));
    }

    let outcome = dispatch(&tx, store_id, device_id, event)?;
    tx.commit()?;
    Ok(("applied", outcome))
}

/// For replayed SALE_CREATED / COLLECTION_CREATED events the client still
/// needs its id mapping; look the persisted row up by the payload ids.
fn duplicate_outcome(conn: &Connection, store_id: &str, event: &SyncEventInput) -> ApiResult<EventOutcome> {
    match event.event_type.as_str() {
        "SALE_CREATED" => {
            let payload: SaleCreatedPayload = match parse_payload(&event.payload) {
                Ok(p) => p,
                Err(_) => return Ok(EventOutcome::Plain),
            };
            let row: Option<(String, String)> = match (&payload.sale_id, &payload.offline_receipt_ref) {
                (Some(sale_id), _) => conn
                    .query_row(
                        "SELECT id, bill_ref FROM sales WHERE id = ?1 AND store_id = ?2",
                        params![sale_id, store_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?,
                (None, Some(receipt_ref)) => conn
                    .query_row(
                        "SELECT id, bill_ref FROM sales WHERE store_id = ?1 AND offline_receipt_ref = ?2",
                        params![store_id, receipt_ref],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?,
                (None, None) => None,
            };
            Ok(match row {
                Some((server_sale_id, bill_ref)) => EventOutcome::Sale(SaleMapping {
                    client_sale_id: payload.sale_id,
                    offline_receipt_ref: payload.offline_receipt_ref,
                    server_sale_id,
                    bill_ref,
                }),
                None => EventOutcome::Plain,
            })
        }
        "COLLECTION_CREATED" => {
            let payload: CollectionCreatedPayload = match parse_payload(&event.payload) {
                Ok(p) => p,
                Err(_) => return Ok(EventOutcome::Plain),
            };
            let Some(collection_id) = payload.collection_id else {
                return Ok(EventOutcome::Plain);
            };
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM collections WHERE id = ?1 AND store_id = ?2",
                    params![collection_id, store_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match found {
                Some(server_collection_id) => EventOutcome::Collection(CollectionMapping {
                    client_collection_id: collection_id,
                    server_collection_id,
                }),
                None => EventOutcome::Plain,
            })
        }
        _ => Ok(EventOutcome::Plain),
    }
}

fn dispatch(
    conn: &Connection,
    store_id: &str,
    device_id: &str,
    event: &SyncEventInput,
) -> ApiResult<EventOutcome> {
    match event.event_type.as_str() {
        "PRODUCT_UPSERT" => {
            let payload: ProductUpsertPayload = parse_payload(&event.payload)?;
            let variant_id = ensure_variant_for_barcode(conn, &payload.barcode, payload.name.as_deref())?;
            catalog::link_retailer_variant(conn, store_id, &variant_id, payload.selling_price_minor)?;
            Ok(EventOutcome::Plain)
        }
        "PRODUCT_PRICE_SET" => {
            let payload: ProductPriceSetPayload = parse_payload(&event.payload)?;
            let variant_id = match (&payload.variant_id, &payload.barcode) {
                (Some(variant_id), _) => catalog::variant_by_id(conn, variant_id)?
                    .ok_or_else(|| ApiError::not_found("product_not_found"))?
                    .id,
                (None, Some(barcode)) => ensure_variant_for_barcode(conn, barcode, None)?,
                (None, None) => return Err(ApiError::bad_request("invalid_item")),
            };
            catalog::link_retailer_variant(conn, store_id, &variant_id, Some(payload.selling_price_minor))?;
            Ok(EventOutcome::Plain)
        }
        "SALE_CREATED" => {
            let payload: SaleCreatedPayload = parse_payload(&event.payload)?;
            let request = CreateSaleRequest {
                items: payload.items,
                discount_minor: payload.discount_minor,
                currency: payload.currency,
                sale_id: payload.sale_id.clone(),
                offline_receipt_ref: payload.offline_receipt_ref.clone(),
            };
            // The client already closed this checkout locally, so stock is
            // applied in the same transaction instead of at a confirm step.
            let summary = sales::create_sale(conn, store_id, Some(device_id), &request, true)?;
            Ok(EventOutcome::Sale(SaleMapping {
                client_sale_id: payload.sale_id,
                offline_receipt_ref: payload.offline_receipt_ref,
                server_sale_id: summary.sale_id,
                bill_ref: summary.bill_ref,
            }))
        }
        "PAYMENT_CASH" | "PAYMENT_DUE" => {
            let payload: PaymentPayload = parse_payload(&event.payload)?;
            let mode = if event.event_type == "PAYMENT_CASH" {
                PaymentMode::Cash
            } else {
                PaymentMode::Due
            };
            apply_offline_payment(conn, store_id, &payload.sale_id, mode)?;
            Ok(EventOutcome::Plain)
        }
        "COLLECTION_CREATED" => {
            let payload: CollectionCreatedPayload = parse_payload(&event.payload)?;
            let collection_id = payload
                .collection_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            conn.execute(
                "INSERT INTO collections (id, store_id, device_id, amount_minor, mode, reference, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    collection_id,
                    store_id,
                    device_id,
                    payload.amount_minor,
                    payload.mode,
                    payload.reference,
                    payload.status.unwrap_or_else(|| "RECORDED".to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(EventOutcome::Collection(CollectionMapping {
                client_collection_id: collection_id.clone(),
                server_collection_id: collection_id,
            }))
        }
        "PURCHASE_SUBMIT" | "PURCHASE_CREATED" => {
            let request: CreatePurchaseRequest = parse_payload(&event.payload)?;
            purchases::create_purchase(conn, store_id, &request, true)?;
            Ok(EventOutcome::Plain)
        }
        other => Err(ApiError::bad_request("unknown event type")
            .with_message(format!("unknown event type: {other}"))),
    }
}

/// Sale status transition driven by an offline payment event. Stock was
/// already applied when the SALE_CREATED event landed, so this only records
/// the payment row and moves the status.
fn apply_offline_payment(conn: &Connection, store_id: &str, sale_id: &str, mode: PaymentMode) -> ApiResult<()> {
    let total: Option<i64> = conn
        .query_row(
            "SELECT total_minor FROM sales WHERE id = ?1 AND store_id = ?2",
            params![sale_id, store_id],
            |row| row.get(0),
        )
        .optional()?;
    let total = total.ok_or_else(|| ApiError::not_found("sale_not_found"))?;

    sales::record_payment(conn, sale_id, mode, total, None)?;
    conn.execute(
        "UPDATE sales SET status = ?2 WHERE id = ?1",
        params![sale_id, mode.terminal_status().as_str()],
    )?;
    Ok(())
}

fn ensure_variant_for_barcode(conn: &Connection, barcode: &str, name: Option<&str>) -> ApiResult<String> {
    if let Some(variant) = catalog::find_variant_by_barcode(conn, barcode)? {
        return Ok(variant.id);
    }
    let scan = crate::scan::normalize_scan(None, barcode)
        .ok_or_else(|| ApiError::bad_request("invalid_scan"))?;
    let (global_product_id, _) =
        catalog::ensure_global_product(conn, &scan.code_type, barcode, &scan.normalized_value, name)?;
    let display_name = name.unwrap_or(barcode);
    let variant_id = catalog::ensure_variant_for_global(conn, &global_product_id, display_name)?;
    if !catalog::is_sm_barcode(barcode) {
        catalog::attach_barcode(conn, barcode, &variant_id, "manufacturer")?;
    }
    Ok(variant_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::inventory::{self, MovementRef, MovementType};
    use serde_json::json;

    async fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.write_tx(|tx| {
            tx.execute(
                "INSERT INTO stores (id, name, upi_vpa, active, created_at)
                 VALUES ('s1', 'Kirana One', 'kirana@upi', 1, '2026-01-01T00:00:00Z')",
                [],
            )?;
            tx.execute(
                "INSERT INTO pos_devices (id, store_id, device_token, active, label, created_at)
                 VALUES ('d1', 's1', 'feedbeef', 1, 'Counter 1', '2026-01-01T00:00:00Z')",
                [],
            )?;
            let (gp, _) = catalog::ensure_global_product(tx, "EAN", "x", "08901234567890", Some("Salt"))?;
            catalog::ensure_variant_for_global(tx, &gp, "Salt")?;
            inventory::apply_movement(tx, "s1", &gp, MovementType::Receive, 10, None, None, MovementRef::default())?;
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    async fn salt_gp(db: &Db) -> String {
        db.read(|conn| {
            Ok(conn.query_row(
                "SELECT id FROM global_products WHERE global_name = 'Salt'",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }

    fn sale_event(event_id: &str, gp: &str, sale_id: &str) -> SyncEventInput {
        SyncEventInput {
            event_id: event_id.to_string(),
            event_type: "SALE_CREATED".to_string(),
            payload: json!({
                "saleId": sale_id,
                "offlineReceiptRef": format!("receipt-{sale_id}"),
                "items": [
                    {"globalProductId": gp, "quantity": 2, "priceMinor": 1500}
                ]
            }),
        }
    }

    fn envelope(events: Vec<SyncEventInput>) -> SyncEnvelope {
        SyncEnvelope { pending_outbox_count: Some(events.len() as i64), events }
    }

    #[tokio::test]
    async fn sale_event_applies_stock_immediately() {
        let db = test_db().await;
        let gp = salt_gp(&db).await;

        let response = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![sale_event("e1", &gp, "cs-1")])))
            .await
            .unwrap();
        assert_eq!(response.results[0].status, "applied");
        assert_eq!(response.sale_mappings.len(), 1);
        assert_eq!(response.sale_mappings[0].client_sale_id.as_deref(), Some("cs-1"));

        db.read(|conn| {
            let qty: i64 = conn.query_row(
                "SELECT available_qty FROM store_inventory WHERE store_id = 's1'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(qty, 8);
            assert_eq!(inventory::fetch_ledger_stock(conn, "s1", &gp)?, 8);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_event_is_a_noop_with_mapping() {
        let db = test_db().await;
        let gp = salt_gp(&db).await;

        let first = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![sale_event("e1", &gp, "cs-1")])))
            .await
            .unwrap();
        let replay = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![sale_event("e1", &gp, "cs-1")])))
            .await
            .unwrap();

        assert_eq!(replay.results[0].status, "duplicate_ignored");
        assert_eq!(replay.sale_mappings.len(), 1);
        assert_eq!(
            replay.sale_mappings[0].server_sale_id,
            first.sale_mappings[0].server_sale_id
        );
        assert_eq!(replay.sale_mappings[0].bill_ref, first.sale_mappings[0].bill_ref);

        db.read(|conn| {
            let sales: i64 = conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))?;
            assert_eq!(sales, 1);
            let qty: i64 = conn.query_row(
                "SELECT available_qty FROM store_inventory WHERE store_id = 's1'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(qty, 8);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rejected_event_does_not_abort_siblings() {
        let db = test_db().await;
        let gp = salt_gp(&db).await;

        let bad = SyncEventInput {
            event_id: "e-bad".to_string(),
            event_type: "SALE_CREATED".to_string(),
            payload: json!({
                "saleId": "cs-bad",
                "items": [{"globalProductId": gp, "quantity": 99, "priceMinor": 1500}]
            }),
        };
        let response = db
            .with_conn(|conn| {
                process_batch(
                    conn,
                    "s1",
                    "d1",
                    &envelope(vec![bad, sale_event("e-good", &gp, "cs-good")]),
                )
            })
            .await
            .unwrap();

        assert_eq!(response.results[0].status, "rejected");
        assert_eq!(response.results[0].error.as_deref(), Some("insufficient_stock"));
        assert_eq!(response.results[1].status, "applied");

        let sales: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(sales, 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_rejected() {
        let db = test_db().await;
        let event = SyncEventInput {
            event_id: "e-odd".to_string(),
            event_type: "CART_ABANDONED".to_string(),
            payload: json!({}),
        };
        let response = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![event])))
            .await
            .unwrap();
        assert_eq!(response.results[0].status, "rejected");
        assert_eq!(response.results[0].error.as_deref(), Some("unknown event type"));
    }

    #[tokio::test]
    async fn offline_payment_moves_sale_status() {
        let db = test_db().await;
        let gp = salt_gp(&db).await;
        db.with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![sale_event("e1", &gp, "cs-1")])))
            .await
            .unwrap();

        let pay = SyncEventInput {
            event_id: "e2".to_string(),
            event_type: "PAYMENT_CASH".to_string(),
            payload: json!({"saleId": "cs-1"}),
        };
        let response = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![pay])))
            .await
            .unwrap();
        assert_eq!(response.results[0].status, "applied");

        db.read(|conn| {
            let status: String = conn.query_row(
                "SELECT status FROM sales WHERE id = 'cs-1'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(status, "PAID_CASH");
            let payments: i64 = conn.query_row(
                "SELECT COUNT(*) FROM payments WHERE sale_id = 'cs-1' AND mode = 'CASH' AND status = 'PAID'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(payments, 1);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn replayed_payment_with_fresh_event_id_inserts_no_second_row() {
        let db = test_db().await;
        let gp = salt_gp(&db).await;
        db.with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![sale_event("e1", &gp, "cs-1")])))
            .await
            .unwrap();

        for event_id in ["e2", "e3"] {
            let pay = SyncEventInput {
                event_id: event_id.to_string(),
                event_type: "PAYMENT_CASH".to_string(),
                payload: json!({"saleId": "cs-1"}),
            };
            db.with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![pay])))
                .await
                .unwrap();
        }

        let payments: i64 = db
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM payments WHERE sale_id = 'cs-1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(payments, 1);
    }

    #[tokio::test]
    async fn collection_event_round_trips_mapping() {
        let db = test_db().await;
        let event = SyncEventInput {
            event_id: "e-col".to_string(),
            event_type: "COLLECTION_CREATED".to_string(),
            payload: json!({
                "collectionId": "col-1",
                "amountMinor": 25_000,
                "mode": "CASH"
            }),
        };
        let first = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![event])))
            .await
            .unwrap();
        assert_eq!(first.collection_mappings[0].client_collection_id, "col-1");

        let replay_event = SyncEventInput {
            event_id: "e-col".to_string(),
            event_type: "COLLECTION_CREATED".to_string(),
            payload: json!({
                "collectionId": "col-1",
                "amountMinor": 25_000,
                "mode": "CASH"
            }),
        };
        let replay = db
            .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![replay_event])))
            .await
            .unwrap();
        assert_eq!(replay.results[0].status, "duplicate_ignored");
        assert_eq!(replay.collection_mappings.len(), 1);

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn purchase_submit_delegates_with_skip() {
        let db = test_db().await;
        let payload = json!({
            "purchaseId": "pur-1",
            "items": [{
                "barcode": "8901111111111",
                "productName": "Atta",
                "quantity": 10,
                "unit": "kg",
                "unitCostMinor": 4000
            }]
        });
        for event_id in ["e1", "e2"] {
            let event = SyncEventInput {
                event_id: event_id.to_string(),
                event_type: "PURCHASE_SUBMIT".to_string(),
                payload: payload.clone(),
            };
            let response = db
                .with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![event])))
                .await
                .unwrap();
            assert_eq!(response.results[0].status, "applied");
        }

        let purchases: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM purchases", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(purchases, 1);
    }

    #[tokio::test]
    async fn product_price_set_by_barcode() {
        let db = test_db().await;
        let event = SyncEventInput {
            event_id: "e-price".to_string(),
            event_type: "PRODUCT_PRICE_SET".to_string(),
            payload: json!({"barcode": "8902222222222", "sellingPriceMinor": 9900}),
        };
        db.with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![event])))
            .await
            .unwrap();

        let price: i64 = db
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT selling_price_minor FROM retailer_variants WHERE store_id = 's1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(price, 9900);
    }

    #[tokio::test]
    async fn heartbeat_fields_are_updated() {
        let db = test_db().await;
        db.with_conn(|conn| process_batch(conn, "s1", "d1", &envelope(vec![])))
            .await
            .unwrap();
        db.read(|conn| {
            let (seen, synced, outbox): (Option<String>, Option<String>, i64) = conn.query_row(
                "SELECT last_seen_online, last_sync_at, pending_outbox_count FROM pos_devices WHERE id = 'd1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            assert!(seen.is_some());
            assert!(synced.is_some());
            assert_eq!(outbox, 0);
            Ok(())
        })
        .await
        .unwrap();
    }
}
