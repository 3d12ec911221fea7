//! Supermandi POS backend library.
//!
//! Exposes the core modules for the server binary and the integration
//! tests: scan normalization, device auth, catalog resolution, the
//! inventory ledger, the sales state machine, purchases, and offline sync.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod db;
pub mod errors;
pub mod inventory;
pub mod middleware;
pub mod models;
pub mod purchases;
pub mod sales;
pub mod scan;
pub mod sync;

pub use api::AppState;
pub use db::Db;
pub use models::Config;
