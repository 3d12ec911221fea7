//! Router assembly.

use crate::api::{admin, pos, AppState};
use crate::auth;
use crate::middleware::{logging, rate_limit};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

pub fn build_router(state: AppState) -> Router {
    let enroll_routes = Router::new()
        .route("/enroll", post(pos::enroll))
        .route_layer(axum_mw::from_fn_with_state(
            state.enroll_limiter.clone(),
            rate_limit::enroll_rate_limit,
        ));

    // Status endpoints use the permissive auth variant: the token must
    // resolve, but inactive devices/stores may still read their state.
    let status_routes = Router::new()
        .route("/devices/me", get(pos::devices_me))
        .route("/ui-status", get(pos::ui_status))
        .route("/stores/:storeId/status", get(pos::store_status))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::device_status));

    let pos_routes = Router::new()
        .route("/scan/resolve", post(pos::scan_resolve))
        .route("/products/price", post(pos::set_price))
        .route("/sales", post(pos::create_sale))
        .route("/sales/:saleId/confirm", post(pos::confirm_sale))
        .route("/sales/:saleId/cancel", post(pos::cancel_sale))
        .route("/payments/upi/init", post(pos::upi_init))
        .route("/payments/upi/confirm-manual", post(pos::upi_confirm_manual))
        .route("/payments/cash", post(pos::pay_cash))
        .route("/payments/due", post(pos::pay_due))
        .route("/bills", get(pos::list_bills))
        .route("/bills/:saleId", get(pos::bill_detail))
        .route("/collections", post(pos::create_collection).get(pos::list_collections))
        .route("/purchases", post(pos::create_purchase))
        .route("/sync", post(pos::sync_batch))
        .route("/events", post(pos::record_event))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::device_auth));

    let admin_routes = Router::new()
        .route("/stores", post(admin::create_store))
        .route("/stores/:storeId/enrollment-codes", post(admin::issue_code))
        .route("/stores/:storeId/devices", get(admin::list_devices))
        .route("/stores/:storeId/inventory", get(admin::store_inventory))
        .route("/stores/:storeId/inventory/adjust", post(admin::adjust_inventory))
        .route("/stores/:storeId/ledger", get(admin::store_ledger))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::admin_auth));

    Router::new()
        .route("/health", get(pos::health))
        .nest(
            "/api/v1/pos",
            enroll_routes.merge(status_routes).merge(pos_routes),
        )
        .nest("/api/v1/admin", admin_routes)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(logging::request_logging))
        .with_state(state)
}
