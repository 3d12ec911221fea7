//! Device enrollment.
//!
//! Short human-readable codes bind a handheld to a store. Codes are
//! single-use for first-time binding; re-enrolling an existing device under
//! the same label rotates its token and is allowed even after the code
//! expired, so a reinstalled app can recover its seat without operator
//! involvement.

use crate::errors::{ApiError, ApiResult};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

const CODE_LENGTH: usize = 6;
const DEFAULT_CODE_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMeta {
    pub label: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub printing_mode: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollOutcome {
    pub device_id: String,
    pub store_id: String,
    pub device_token: String,
    pub store_active: bool,
}

fn new_device_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Unambiguous code alphabet (no 0/O, 1/I).
fn new_enrollment_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    (0..CODE_LENGTH)
        .map(|_| ALPHABET[rand::random::<usize>() % ALPHABET.len()] as char)
        .collect()
}

/// Consume an enrollment code and bind (or re-bind) a device.
pub fn enroll_device(conn: &Connection, code: &str, meta: &DeviceMeta) -> ApiResult<EnrollOutcome> {
    if meta.label.trim().is_empty() {
        return Err(ApiError::bad_request("enrollment_invalid").with_message("label is required"));
    }

    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT store_id, expires_at, used_at FROM device_enrollment_codes WHERE code = ?1",
            params![code.trim().to_ascii_uppercase()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((store_id, expires_at, used_at)) = row else {
        return Err(ApiError::bad_request("enrollment_invalid"));
    };

    let (store_active,): (bool,) = conn
        .query_row(
            "SELECT active != 0 AND COALESCE(TRIM(upi_vpa), '') != '' FROM stores WHERE id = ?1",
            params![store_id],
            |row| Ok((row.get(0)?,)),
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("store not found"))?;

    let now = Utc::now();
    let token = new_device_token();

    // Same-label re-enrollment rotates the token regardless of code state.
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM pos_devices WHERE store_id = ?1 AND label = ?2",
            params![store_id, meta.label],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(device_id) = existing {
        conn.execute(
            "UPDATE pos_devices
             SET device_token = ?2, device_type = COALESCE(?3, device_type),
                 printing_mode = COALESCE(?4, printing_mode),
                 app_version = COALESCE(?5, app_version),
                 last_seen_online = ?6
             WHERE id = ?1",
            params![device_id, token, meta.device_type, meta.printing_mode, meta.app_version, now.to_rfc3339()],
        )?;
        info!(device_id = %device_id, store_id = %store_id, "device re-enrolled, token rotated");
        return Ok(EnrollOutcome { device_id, store_id, device_token: token, store_active });
    }

    if used_at.is_some() {
        return Err(ApiError::bad_request("enrollment_invalid"));
    }
    let expired = DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t.with_timezone(&Utc) < now)
        .unwrap_or(true);
    if expired {
        return Err(ApiError::bad_request("enrollment_invalid"));
    }

    let device_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO pos_devices
            (id, store_id, device_token, active, label, device_type, printing_mode, app_version, created_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8)",
        params![
            device_id,
            store_id,
            token,
            meta.label,
            meta.device_type,
            meta.printing_mode,
            meta.app_version,
            now.to_rfc3339(),
        ],
    )?;
    conn.execute(
        "UPDATE device_enrollment_codes SET used_at = ?2 WHERE code = ?1",
        params![code.trim().to_ascii_uppercase(), now.to_rfc3339()],
    )?;
    info!(device_id = %device_id, store_id = %store_id, label = %meta.label, "device enrolled");

    Ok(EnrollOutcome { device_id, store_id, device_token: token, store_active })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCode {
    pub code: String,
    pub store_id: String,
    pub expires_at: String,
}

/// Mint a fresh enrollment code for a store (admin surface).
pub fn issue_enrollment_code(
    conn: &Connection,
    store_id: &str,
    ttl_minutes: Option<i64>,
) -> ApiResult<IssuedCode> {
    let known: Option<String> = conn
        .query_row("SELECT id FROM stores WHERE id = ?1", params![store_id], |row| row.get(0))
        .optional()?;
    if known.is_none() {
        return Err(ApiError::not_found("store not found"));
    }

    let expires_at =
        (Utc::now() + Duration::minutes(ttl_minutes.unwrap_or(DEFAULT_CODE_TTL_MINUTES))).to_rfc3339();
    for _ in 0..5 {
        let code = new_enrollment_code();
        let inserted = conn.execute(
            "INSERT INTO device_enrollment_codes (code, store_id, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(code) DO NOTHING",
            params![code, store_id, expires_at],
        )?;
        if inserted == 1 {
            return Ok(IssuedCode { code, store_id: store_id.to_string(), expires_at });
        }
    }
    Err(ApiError::internal("could not allocate an enrollment code"))
}
