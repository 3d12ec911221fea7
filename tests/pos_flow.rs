//! End-to-end POS flows.
//!
//! Drives the public HTTP surface (router + middleware) and the service
//! layer against an in-memory database: enrollment, store binding, the
//! two-phase sale protocol, bulk purchase/sale, and offline sync
//! idempotency.

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use supermandi_backend::api::routes::build_router;
use supermandi_backend::catalog;
use supermandi_backend::inventory::{self, MovementRef, MovementType};
use supermandi_backend::models::Config;
use supermandi_backend::purchases::{self, CreatePurchaseRequest, PurchaseItemInput};
use supermandi_backend::sales::{self, PaymentMode};
use supermandi_backend::{AppState, Db};
use tower::ServiceExt;

const DEVICE_TOKEN_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn test_config() -> Config {
    Config {
        database_path: ":memory:".to_string(),
        port: 0,
        admin_token: Some("secret-admin".to_string()),
    }
}

async fn seed(db: &Db) {
    db.write_tx(|tx| {
        tx.execute(
            "INSERT INTO stores (id, name, upi_vpa, active, created_at)
             VALUES ('store-A', 'Kirana One', 'kirana@upi', 1, '2026-01-01T00:00:00Z')",
            [],
        )?;
        tx.execute(
            "INSERT INTO stores (id, name, upi_vpa, active, created_at)
             VALUES ('store-B', 'Kirana Two', 'two@upi', 1, '2026-01-01T00:00:00Z')",
            [],
        )?;
        tx.execute(
            "INSERT INTO pos_devices (id, store_id, device_token, active, label, created_at)
             VALUES ('device-A', 'store-A', ?1, 1, 'Counter 1', '2026-01-01T00:00:00Z')",
            [DEVICE_TOKEN_A],
        )?;
        Ok(())
    })
    .await
    .unwrap();
}

async fn app_with_state() -> (Router, AppState) {
    let db = Db::open_in_memory().unwrap();
    seed(&db).await;
    let state = AppState::new(db, test_config());
    (build_router(state.clone()), state)
}

async fn seed_salt(state: &AppState, initial_qty: i64) -> String {
    state
        .db
        .write_tx(move |tx| {
            let (gp, _) = catalog::ensure_global_product(tx, "EAN", "8901234567890", "08901234567890", Some("Salt"))?;
            catalog::ensure_variant_for_global(tx, &gp, "Salt")?;
            if initial_qty > 0 {
                inventory::apply_movement(
                    tx,
                    "store-A",
                    &gp,
                    MovementType::Receive,
                    initial_qty,
                    None,
                    None,
                    MovementRef::default(),
                )?;
            }
            Ok(gp)
        })
        .await
        .unwrap()
}

async fn send(
    app: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("x-device-token", token);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let mut request = request;
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

// ---------------------------------------------------------------------------
// Auth & store binding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let (app, _) = app_with_state().await;
    let (status, body) = send(&app, "POST", "/api/v1/pos/sales", None, Some(json!({"items": []}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "device_unauthorized");
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let (app, _) = app_with_state().await;
    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/pos/bills",
        Some("ffffffffffffffffffffffffffffffff"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "device_unauthorized");
}

#[tokio::test]
async fn foreign_store_id_in_body_is_rejected() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/pos/sales",
        Some(DEVICE_TOKEN_A),
        Some(json!({
            "storeId": "store-B",
            "items": [{"globalProductId": gp, "quantity": 1, "priceMinor": 100}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "store_mismatch");
}

#[tokio::test]
async fn nested_store_id_mismatch_is_rejected() {
    let (app, _) = app_with_state().await;
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/pos/sync",
        Some(DEVICE_TOKEN_A),
        Some(json!({
            "events": [{
                "eventId": "e1",
                "type": "SALE_CREATED",
                "payload": {"storeId": "store-B", "items": []}
            }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "store_mismatch");
}

#[tokio::test]
async fn matching_store_id_passes_the_guard() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/pos/sales",
        Some(DEVICE_TOKEN_A),
        Some(json!({
            "storeId": "store-A",
            "items": [{"globalProductId": gp, "quantity": 1, "priceMinor": 100}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn inactive_store_blocks_writes_but_not_status() {
    let (app, state) = app_with_state().await;
    state
        .db
        .write_tx(|tx| {
            tx.execute("UPDATE stores SET upi_vpa = NULL, active = 0 WHERE id = 'store-A'", [])?;
            Ok(())
        })
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/pos/sales",
        Some(DEVICE_TOKEN_A),
        Some(json!({"items": [{"globalProductId": "x", "quantity": 1, "priceMinor": 100}]})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "store_inactive");

    let (status, body) = send(&app, "GET", "/api/v1/pos/ui-status", Some(DEVICE_TOKEN_A), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storeActive"], false);
}

#[tokio::test]
async fn inactive_device_is_forbidden() {
    let (app, state) = app_with_state().await;
    state
        .db
        .write_tx(|tx| {
            tx.execute("UPDATE pos_devices SET active = 0 WHERE id = 'device-A'", [])?;
            Ok(())
        })
        .await
        .unwrap();
    let (status, body) = send(&app, "GET", "/api/v1/pos/bills", Some(DEVICE_TOKEN_A), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "device_inactive");
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enrollment_binds_a_device() {
    let (app, state) = app_with_state().await;
    let code = state
        .db
        .write_tx(|tx| supermandi_backend::auth::issue_enrollment_code(tx, "store-A", None))
        .await
        .unwrap()
        .code;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/pos/enroll",
        None,
        Some(json!({
            "code": code,
            "deviceMeta": {"label": "Counter 9", "deviceType": "handheld", "printingMode": "BLUETOOTH"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storeId"], "store-A");
    assert_eq!(body["storeActive"], true);

    let token = body["deviceToken"].as_str().unwrap().to_string();
    let (status, me) = send(&app, "GET", "/api/v1/pos/devices/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["storeId"], "store-A");
    assert_eq!(me["storeName"], "Kirana One");
}

#[tokio::test]
async fn enrollment_is_rate_limited_per_ip() {
    let (app, _) = app_with_state().await;
    let body = json!({"code": "NOPE99", "deviceMeta": {"label": "X"}});

    let mut last_status = StatusCode::OK;
    for _ in 0..11 {
        let (status, _) = send(&app, "POST", "/api/v1/pos/enroll", None, Some(body.clone())).await;
        last_status = status;
    }
    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
}

// ---------------------------------------------------------------------------
// Two-phase sale over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cash_sale_happy_path() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;

    let (status, sale) = send(
        &app,
        "POST",
        "/api/v1/pos/sales",
        Some(DEVICE_TOKEN_A),
        Some(json!({"items": [{"globalProductId": gp, "quantity": 2, "priceMinor": 5000}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sale["status"], "PENDING");
    assert_eq!(sale["totals"], json!({"subtotal": 10000, "discount": 0, "total": 10000}));
    assert_eq!(sale["billRef"].as_str().unwrap().len(), 13);

    let sale_id = sale["saleId"].as_str().unwrap();
    let (status, confirmed) = send(
        &app,
        "POST",
        &format!("/api/v1/pos/sales/{sale_id}/confirm"),
        Some(DEVICE_TOKEN_A),
        Some(json!({"paymentMode": "CASH"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "PAID_CASH");

    let (qty, payment): (i64, (String, String, i64)) = state
        .db
        .read(|conn| {
            let qty = conn.query_row(
                "SELECT available_qty FROM store_inventory WHERE store_id = 'store-A'",
                [],
                |row| row.get(0),
            )?;
            let payment = conn.query_row(
                "SELECT mode, status, amount_minor FROM payments",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok((qty, payment))
        })
        .await
        .unwrap();
    assert_eq!(qty, 3);
    assert_eq!(payment, ("CASH".to_string(), "PAID".to_string(), 10_000));
}

#[tokio::test]
async fn losing_confirm_race_reports_shortfall() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;

    let make_sale = json!({"items": [{"globalProductId": gp, "quantity": 3, "priceMinor": 1000}]});
    let (_, first) = send(&app, "POST", "/api/v1/pos/sales", Some(DEVICE_TOKEN_A), Some(make_sale.clone())).await;
    let (_, second) = send(&app, "POST", "/api/v1/pos/sales", Some(DEVICE_TOKEN_A), Some(make_sale)).await;

    let first_id = first["saleId"].as_str().unwrap();
    let second_id = second["saleId"].as_str().unwrap();

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/pos/sales/{first_id}/confirm"),
        Some(DEVICE_TOKEN_A),
        Some(json!({"paymentMode": "CASH"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/pos/sales/{second_id}/confirm"),
        Some(DEVICE_TOKEN_A),
        Some(json!({"paymentMode": "CASH"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "insufficient_stock");
    assert_eq!(body["details"][0]["available"], 2);
    assert_eq!(body["details"][0]["required"], 3);
    assert_eq!(body["details"][0]["skuId"], gp);

    let qty: i64 = state
        .db
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT available_qty FROM store_inventory WHERE store_id = 'store-A'",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(qty, 2);
}

#[tokio::test]
async fn invalid_item_bounds_are_a_400() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;
    for (quantity, price) in [(0, 100), (100_001, 100), (1, 0), (1, 100_000_001)] {
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/pos/sales",
            Some(DEVICE_TOKEN_A),
            Some(json!({"items": [{"globalProductId": gp, "quantity": quantity, "priceMinor": price}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "items are invalid");
    }
}

// ---------------------------------------------------------------------------
// UPI
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upi_init_rejects_precomposed_intents() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;
    let (_, sale) = send(
        &app,
        "POST",
        "/api/v1/pos/sales",
        Some(DEVICE_TOKEN_A),
        Some(json!({"items": [{"globalProductId": gp, "quantity": 1, "priceMinor": 4200}]})),
    )
    .await;
    let sale_id = sale["saleId"].as_str().unwrap();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/pos/payments/upi/init",
        Some(DEVICE_TOKEN_A),
        Some(json!({"saleId": sale_id, "upiIntent": "upi://pay?pa=evil@upi"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "upi_intent_not_allowed");

    let (status, init) = send(
        &app,
        "POST",
        "/api/v1/pos/payments/upi/init",
        Some(DEVICE_TOKEN_A),
        Some(json!({"saleId": sale_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(init["amountMinor"], 4200);
    assert_eq!(init["storeName"], "Kirana One");
    assert_eq!(init["upiVpa"], "kirana@upi");

    let payment_id = init["paymentId"].as_str().unwrap();
    let (status, confirmed) = send(
        &app,
        "POST",
        "/api/v1/pos/payments/upi/confirm-manual",
        Some(DEVICE_TOKEN_A),
        Some(json!({"paymentId": payment_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "PAID_UPI");
}

// ---------------------------------------------------------------------------
// Scan pipeline: digitise, sell, debounce
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gs1_digitise_then_sell() {
    let (app, state) = app_with_state().await;
    let raw = "]d2010401234567890115230101";

    let (status, digitised) = send(
        &app,
        "POST",
        "/api/v1/pos/scan/resolve",
        Some(DEVICE_TOKEN_A),
        Some(json!({"scanValue": raw, "mode": "DIGITISE", "productName": "Choco Bar"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(digitised["action"], "DIGITISED");
    assert_eq!(digitised["product"]["isFirstTimeInStore"], true);

    let identifier: (String, String) = state
        .db
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT code_type, normalized_value FROM global_product_identifiers",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(identifier, ("GS1".to_string(), "04012345678901".to_string()));

    let (status, sell) = send(
        &app,
        "POST",
        "/api/v1/pos/scan/resolve",
        Some(DEVICE_TOKEN_A),
        Some(json!({"scanValue": raw, "mode": "SELL"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sell["action"], "PROMPT_PRICE");
    assert_eq!(
        sell["product"]["globalProductId"],
        digitised["product"]["globalProductId"]
    );

    // Price it, then the same scan goes straight to the cart.
    let gp = sell["product"]["globalProductId"].as_str().unwrap();
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/pos/products/price",
        Some(DEVICE_TOKEN_A),
        Some(json!({"productId": gp, "priceMinor": 2500})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Past the debounce window the same (store, mode, value) scan resolves
    // again instead of being ignored.
    tokio::time::sleep(std::time::Duration::from_millis(550)).await;
    let (_, sell_again) = send(
        &app,
        "POST",
        "/api/v1/pos/scan/resolve",
        Some(DEVICE_TOKEN_A),
        Some(json!({"scanValue": raw, "mode": "SELL"})),
    )
    .await;
    assert_eq!(sell_again["action"], "ADD_TO_CART");
}

#[tokio::test]
async fn rapid_duplicate_scan_is_ignored() {
    let (app, state) = app_with_state().await;
    seed_salt(&state, 5).await;

    let scan = json!({"scanValue": "8901234567890", "mode": "SELL"});
    let (_, first) = send(&app, "POST", "/api/v1/pos/scan/resolve", Some(DEVICE_TOKEN_A), Some(scan.clone())).await;
    assert_eq!(first["action"], "PROMPT_PRICE");

    let (status, second) = send(&app, "POST", "/api/v1/pos/scan/resolve", Some(DEVICE_TOKEN_A), Some(scan)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["action"], "IGNORED");
}

// ---------------------------------------------------------------------------
// Bulk purchase then retail sale
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bulk_purchase_then_pack_sale() {
    let (_, state) = app_with_state().await;

    let request = CreatePurchaseRequest {
        items: vec![PurchaseItemInput {
            product_id: None,
            barcode: Some("8901111111111".to_string()),
            product_name: Some("Atta".to_string()),
            quantity: 10,
            unit: Some("kg".to_string()),
            unit_cost_minor: 4000,
            selling_price_minor: Some(5000),
        }],
        supplier_name: Some("Mandi Traders".to_string()),
        currency: None,
        purchase_id: None,
    };
    state
        .db
        .write_tx(|tx| purchases::create_purchase(tx, "store-A", &request, false))
        .await
        .unwrap();

    // 250 g pack variant was materialized by the purchase.
    let pack_variant: String = state
        .db
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT id FROM variants WHERE unit_base = 'g' AND size_base = 250",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();

    let sale_request = sales::CreateSaleRequest {
        items: vec![sales::SaleItemInput {
            variant_id: Some(pack_variant),
            product_id: None,
            global_product_id: None,
            quantity: 2,
            price_minor: 1500,
            name: None,
            barcode: None,
        }],
        discount_minor: None,
        currency: None,
        sale_id: None,
        offline_receipt_ref: None,
    };
    let summary = state
        .db
        .write_tx(|tx| sales::create_sale(tx, "store-A", None, &sale_request, false))
        .await
        .unwrap();
    state
        .db
        .write_tx(|tx| sales::confirm_sale(tx, "store-A", &summary.sale_id, PaymentMode::Cash, None))
        .await
        .unwrap();

    let quantity_base: i64 = state
        .db
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT quantity_base FROM bulk_inventory WHERE store_id = 'store-A'",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(quantity_base, 9_500);
}

#[tokio::test]
async fn pack_sale_fails_when_base_units_run_out() {
    let (_, state) = app_with_state().await;
    let request = CreatePurchaseRequest {
        items: vec![PurchaseItemInput {
            product_id: None,
            barcode: Some("8901111111111".to_string()),
            product_name: Some("Atta".to_string()),
            quantity: 1,
            unit: Some("kg".to_string()),
            unit_cost_minor: 4000,
            selling_price_minor: None,
        }],
        supplier_name: None,
        currency: None,
        purchase_id: None,
    };
    state
        .db
        .write_tx(|tx| purchases::create_purchase(tx, "store-A", &request, false))
        .await
        .unwrap();

    let kilo_variant: String = state
        .db
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT id FROM variants WHERE unit_base = 'g' AND size_base = 1000",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();

    let sale_request = sales::CreateSaleRequest {
        items: vec![sales::SaleItemInput {
            variant_id: Some(kilo_variant),
            product_id: None,
            global_product_id: None,
            quantity: 2,
            price_minor: 6000,
            name: None,
            barcode: None,
        }],
        discount_minor: None,
        currency: None,
        sale_id: None,
        offline_receipt_ref: None,
    };
    let err = state
        .db
        .write_tx(|tx| sales::create_sale(tx, "store-A", None, &sale_request, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, "insufficient_stock");
    let details = err.details.unwrap();
    assert_eq!(details[0].required, 2000);
    assert_eq!(details[0].available, 1000);
}

// ---------------------------------------------------------------------------
// Offline sync over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_sync_event_round_trip() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 10).await;

    let batch = json!({
        "pendingOutboxCount": 1,
        "events": [{
            "eventId": "evt-1",
            "type": "SALE_CREATED",
            "payload": {
                "saleId": "client-sale-1",
                "offlineReceiptRef": "R-0001",
                "items": [{"globalProductId": gp, "quantity": 2, "priceMinor": 1500}]
            }
        }]
    });

    let (status, first) = send(&app, "POST", "/api/v1/pos/sync", Some(DEVICE_TOKEN_A), Some(batch.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["results"][0]["status"], "applied");
    assert_eq!(first["saleMappings"][0]["clientSaleId"], "client-sale-1");

    let (_, replay) = send(&app, "POST", "/api/v1/pos/sync", Some(DEVICE_TOKEN_A), Some(batch)).await;
    assert_eq!(replay["results"][0]["status"], "duplicate_ignored");
    assert_eq!(
        replay["saleMappings"][0]["serverSaleId"],
        first["saleMappings"][0]["serverSaleId"]
    );
    assert_eq!(replay["saleMappings"][0]["billRef"], first["saleMappings"][0]["billRef"]);

    let (sales_count, ledger_count, qty): (i64, i64, i64) = state
        .db
        .read(|conn| {
            Ok((
                conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))?,
                conn.query_row("SELECT COUNT(*) FROM inventory_ledger WHERE movement_type = 'SELL'", [], |row| {
                    row.get(0)
                })?,
                conn.query_row("SELECT available_qty FROM store_inventory", [], |row| row.get(0))?,
            ))
        })
        .await
        .unwrap();
    assert_eq!(sales_count, 1);
    assert_eq!(ledger_count, 1);
    assert_eq!(qty, 8);
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

async fn send_admin(app: &Router, method: &str, path: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("x-admin-token", token);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let mut request = request;
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40001))));
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn admin_guard_and_store_creation() {
    let (app, _) = app_with_state().await;

    let (status, _) = send_admin(&app, "POST", "/api/v1/admin/stores", None, Some(json!({"name": "X"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send_admin(
        &app,
        "POST",
        "/api/v1/admin/stores",
        Some("secret-admin"),
        Some(json!({"name": "Kirana Three", "upiVpa": "three@upi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);

    let (status, body) = send_admin(
        &app,
        "POST",
        "/api/v1/admin/stores",
        Some("secret-admin"),
        Some(json!({"name": "Kirana Three"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "store_exists");

    let (status, body) = send_admin(
        &app,
        "POST",
        "/api/v1/admin/stores",
        Some("secret-admin"),
        Some(json!({"name": "Bad VPA", "upiVpa": "not a vpa"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "upi_vpa_invalid");

    let (status, body) = send_admin(
        &app,
        "POST",
        "/api/v1/admin/stores",
        Some("secret-admin"),
        Some(json!({"upiVpa": "x@upi"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "storeName_required");
}

#[tokio::test]
async fn admin_disabled_without_secret() {
    let db = Db::open_in_memory().unwrap();
    seed(&db).await;
    let state = AppState::new(
        db,
        Config {
            database_path: ":memory:".to_string(),
            port: 0,
            admin_token: None,
        },
    );
    let app = build_router(state);

    let (status, body) = send_admin(&app, "POST", "/api/v1/admin/stores", Some("anything"), Some(json!({"name": "X"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "admin_disabled");
}

#[tokio::test]
async fn admin_inventory_ledger_and_adjustment() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 5).await;

    let (status, inventory_view) = send_admin(
        &app,
        "GET",
        "/api/v1/admin/stores/store-A/inventory",
        Some("secret-admin"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inventory_view["products"][0]["availableQty"], 5);
    assert_eq!(inventory_view["products"][0]["name"], "Salt");

    // Write off two damaged units.
    let (status, adjusted) = send_admin(
        &app,
        "POST",
        "/api/v1/admin/stores/store-A/inventory/adjust",
        Some("secret-admin"),
        Some(json!({"globalProductId": gp, "quantity": -2, "reason": "damaged"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(adjusted["availableQty"], 3);

    let (status, ledger) = send_admin(
        &app,
        "GET",
        &format!("/api/v1/admin/stores/store-A/ledger?globalProductId={gp}"),
        Some("secret-admin"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let movements = ledger["movements"].as_array().unwrap();
    assert_eq!(movements.len(), 2);
    assert_eq!(movements[0]["movementType"], "ADJUSTMENT");
    assert_eq!(movements[0]["quantity"], -2);
    assert_eq!(movements[0]["reason"], "damaged");

    // The ledger still sums to the live quantity.
    let (available, ledger_sum): (i64, i64) = state
        .db
        .read(|conn| {
            let available = conn.query_row(
                "SELECT available_qty FROM store_inventory WHERE store_id = 'store-A'",
                [],
                |row| row.get(0),
            )?;
            let sum = conn.query_row(
                "SELECT SUM(quantity) FROM inventory_ledger WHERE store_id = 'store-A'",
                [],
                |row| row.get(0),
            )?;
            Ok((available, sum))
        })
        .await
        .unwrap();
    assert_eq!(available, 3);
    assert_eq!(ledger_sum, 3);
}

#[tokio::test]
async fn overdrawing_adjustment_is_rejected() {
    let (app, state) = app_with_state().await;
    let gp = seed_salt(&state, 1).await;
    let (status, body) = send_admin(
        &app,
        "POST",
        "/api/v1/admin/stores/store-A/inventory/adjust",
        Some("secret-admin"),
        Some(json!({"globalProductId": gp, "quantity": -5})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "insufficient_stock");
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn collection_create_is_idempotent_by_client_id() {
    let (app, state) = app_with_state().await;
    let body = json!({"collectionId": "col-7", "amountMinor": 12_500, "mode": "cash", "reference": "khata #12"});

    let (status, first) = send(&app, "POST", "/api/v1/pos/collections", Some(DEVICE_TOKEN_A), Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["collectionId"], "col-7");

    let (status, _) = send(&app, "POST", "/api/v1/pos/collections", Some(DEVICE_TOKEN_A), Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    let count: i64 = state
        .db
        .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))?))
        .await
        .unwrap();
    assert_eq!(count, 1);

    let (status, listed) = send(&app, "GET", "/api/v1/pos/collections", Some(DEVICE_TOKEN_A), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["collections"][0]["amountMinor"], 12_500);
    assert_eq!(listed["collections"][0]["mode"], "CASH");
}

// ---------------------------------------------------------------------------
// Store status (permissive path)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_status_reads_through_permissive_auth() {
    let (app, _) = app_with_state().await;
    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/pos/stores/store-A/status",
        Some(DEVICE_TOKEN_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storeId"], "store-A");
    assert_eq!(body["active"], true);
    assert_eq!(body["name"], "Kirana One");

    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/pos/stores/missing/status",
        Some(DEVICE_TOKEN_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "store not found");
}
