//! HTTP surface: shared state, POS handlers, admin handlers, router wiring.

pub mod admin;
pub mod pos;
pub mod routes;

use crate::db::Db;
use crate::middleware::EnrollRateLimiter;
use crate::models::Config;
use crate::scan::ScanDebouncer;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub debouncer: ScanDebouncer,
    pub enroll_limiter: EnrollRateLimiter,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Db, config: Config) -> Self {
        Self {
            db,
            debouncer: ScanDebouncer::new(),
            enroll_limiter: EnrollRateLimiter::new(Default::default()),
            config: Arc::new(config),
        }
    }
}
