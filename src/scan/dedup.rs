//! In-memory scan debouncing.
//!
//! Suppresses identical scans arriving within a short window for the same
//! (store, mode) pair. Advisory only: the durable dedup lives in the
//! scan_events/processed_events tables, so this map is safe to evict at any
//! time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Clone, Default)]
pub struct ScanDebouncer {
    state: std::sync::Arc<Mutex<HashMap<(String, String, String), Instant>>>,
}

impl ScanDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this scan is a rapid duplicate of one seen within
    /// the window; otherwise records it and returns `false`.
    pub fn is_duplicate(&self, store_id: &str, mode: &str, scan_value: &str) -> bool {
        let key = (store_id.to_string(), mode.to_string(), scan_value.to_string());
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(last) = state.get(&key) {
            if now.duration_since(*last) < DEBOUNCE_WINDOW {
                return true;
            }
        }
        state.insert(key, now);

        if state.len() > 4096 {
            state.retain(|_, seen| now.duration_since(*seen) < DEBOUNCE_WINDOW * 2);
        }
        false
    }
}
