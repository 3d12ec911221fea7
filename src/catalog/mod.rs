//! Catalog resolution.
//!
//! Turns normalized scans into global products and per-store SKUs. Global
//! products are created on the first unseen `(code_type, normalized_value)`
//! identifier; the unique index on that pair is the only cross-request
//! mutex, with `ON CONFLICT DO NOTHING` + re-read as conflict recovery.
//! Store products are materialized lazily on first store-local use.

use crate::errors::{ApiError, ApiResult};
use crate::scan::NormalizedScan;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Pack sizes (in base units) materialized for every divisible product.
pub const STANDARD_PACK_SIZES: [i64; 4] = [100, 250, 500, 1000];

const SM_BARCODE_RETRIES: usize = 5;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedProduct {
    pub global_product_id: String,
    pub global_name: String,
    pub store_display_name: String,
    pub sell_price_minor: Option<i64>,
    pub purchase_price_minor: Option<i64>,
    pub unit: Option<String>,
    pub variant: Option<String>,
    pub available_qty: i64,
    pub is_first_time_in_store: bool,
    pub variant_id: Option<String>,
    pub barcode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VariantRow {
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub unit_base: Option<String>,
    pub size_base: Option<i64>,
    pub global_product_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResolution {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ResolvedProduct>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub product_not_found_for_store: bool,
}

/// Identifier lookup. For `*_TEXT` code types the strongly-typed base code
/// type is probed as well, so legacy text entries migrate transparently.
pub fn find_global_by_identifier(
    conn: &Connection,
    code_type: &str,
    normalized_value: &str,
) -> ApiResult<Option<String>> {
    let lookup = |ct: &str| -> ApiResult<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT global_product_id FROM global_product_identifiers
                 WHERE code_type = ?1 AND normalized_value = ?2",
                params![ct, normalized_value],
                |row| row.get(0),
            )
            .optional()?)
    };

    if let Some(id) = lookup(code_type)? {
        return Ok(Some(id));
    }
    if let Some(base) = code_type.strip_suffix("_TEXT") {
        return lookup(base);
    }
    Ok(None)
}

/// Find or create the global product for an identifier. Returns
/// `(global_product_id, created)`.
pub fn ensure_global_product(
    conn: &Connection,
    code_type: &str,
    raw_value: &str,
    normalized_value: &str,
    name: Option<&str>,
) -> ApiResult<(String, bool)> {
    if let Some(id) = find_global_by_identifier(conn, code_type, normalized_value)? {
        return Ok((id, false));
    }

    let global_product_id = Uuid::new_v4().to_string();
    let global_name = name.filter(|n| !n.trim().is_empty()).unwrap_or(normalized_value);
    conn.execute(
        "INSERT INTO global_products (id, global_name, created_at) VALUES (?1, ?2, ?3)",
        params![global_product_id, global_name, Utc::now().to_rfc3339()],
    )?;

    let inserted = conn.execute(
        "INSERT INTO global_product_identifiers
            (id, global_product_id, code_type, raw_value, normalized_value)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(code_type, normalized_value) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            global_product_id,
            code_type,
            raw_value,
            normalized_value,
        ],
    )?;

    if inserted == 0 {
        // Lost the race: another request registered this identifier between
        // our lookup and insert. Recover by re-reading the winning row and
        // discarding the orphan product.
        conn.execute(
            "DELETE FROM global_products WHERE id = ?1",
            params![global_product_id],
        )?;
        let winner = find_global_by_identifier(conn, code_type, normalized_value)?
            .ok_or_else(|| ApiError::conflict("global_identifier_conflict"))?;
        return Ok((winner, false));
    }

    Ok((global_product_id, true))
}

/// Lazily materialize the per-store SKU row. Returns `true` on the first
/// insert for this (store, global product) pair.
pub fn ensure_store_product(conn: &Connection, store_id: &str, global_product_id: &str) -> ApiResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO store_products (id, store_id, global_product_id)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(store_id, global_product_id) DO NOTHING",
        params![Uuid::new_v4().to_string(), store_id, global_product_id],
    )?;
    Ok(inserted == 1)
}

/// Draw an unused internal barcode: `SM` + 12 upper-hex characters.
pub fn generate_sm_barcode(conn: &Connection) -> ApiResult<String> {
    for _ in 0..SM_BARCODE_RETRIES {
        let candidate = format!("SM{}", hex::encode_upper(rand::random::<[u8; 6]>()));
        let taken: Option<String> = conn
            .query_row(
                "SELECT barcode FROM barcodes WHERE barcode = ?1",
                params![candidate],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_none() {
            return Ok(candidate);
        }
    }
    Err(ApiError::internal("could not allocate an internal barcode"))
}

/// True for `SM` + 12 hex chars, in any case.
pub fn is_sm_barcode(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 14
        && bytes[0].eq_ignore_ascii_case(&b'S')
        && bytes[1].eq_ignore_ascii_case(&b'M')
        && bytes[2..].iter().all(|b| b.is_ascii_hexdigit())
}

/// Register a barcode for a variant. Duplicate barcodes surface as
/// `barcode_in_use`.
pub fn attach_barcode(conn: &Connection, barcode: &str, variant_id: &str, barcode_type: &str) -> ApiResult<()> {
    let stored = if is_sm_barcode(barcode) {
        barcode.to_ascii_uppercase()
    } else {
        barcode.to_string()
    };
    let inserted = conn.execute(
        "INSERT INTO barcodes (barcode, variant_id, barcode_type)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(barcode) DO NOTHING",
        params![stored, variant_id, barcode_type],
    )?;
    if inserted == 0 {
        let owner: Option<String> = conn
            .query_row(
                "SELECT variant_id FROM barcodes WHERE barcode = ?1",
                params![stored],
                |row| row.get(0),
            )
            .optional()?;
        if owner.as_deref() != Some(variant_id) {
            return Err(ApiError::conflict("barcode_in_use"));
        }
    }
    Ok(())
}

/// Internal SM codes are matched upper-cased; external codes verbatim.
pub fn find_variant_by_barcode(conn: &Connection, raw: &str) -> ApiResult<Option<VariantRow>> {
    let needle = if is_sm_barcode(raw) {
        raw.to_ascii_uppercase()
    } else {
        raw.to_string()
    };
    let variant_id: Option<String> = conn
        .query_row(
            "SELECT variant_id FROM barcodes WHERE barcode = ?1",
            params![needle],
            |row| row.get(0),
        )
        .optional()?;
    match variant_id {
        Some(id) => variant_by_id(conn, &id),
        None => Ok(None),
    }
}

pub fn variant_by_id(conn: &Connection, variant_id: &str) -> ApiResult<Option<VariantRow>> {
    Ok(conn
        .query_row(
            "SELECT v.id, v.product_id, v.name, v.unit_base, v.size_base, p.global_product_id
             FROM variants v JOIN products p ON p.id = v.product_id
             WHERE v.id = ?1",
            params![variant_id],
            |row| {
                Ok(VariantRow {
                    id: row.get(0)?,
                    product_id: row.get(1)?,
                    name: row.get(2)?,
                    unit_base: row.get(3)?,
                    size_base: row.get(4)?,
                    global_product_id: row.get(5)?,
                })
            },
        )
        .optional()?)
}

fn product_for_global(conn: &Connection, global_product_id: &str) -> ApiResult<Option<(String, String)>> {
    Ok(conn
        .query_row(
            "SELECT id, name FROM products WHERE global_product_id = ?1",
            params![global_product_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Default (unit-sized) variant for a product, if any.
fn default_variant(conn: &Connection, product_id: &str) -> ApiResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM variants
             WHERE product_id = ?1 AND unit_base IS NULL AND size_base IS NULL",
            params![product_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Ensure the legacy product row + default variant + SM barcode exist for a
/// global product. Returns the default variant id.
pub fn ensure_variant_for_global(conn: &Connection, global_product_id: &str, name: &str) -> ApiResult<String> {
    let (product_id, _) = match product_for_global(conn, global_product_id)? {
        Some(p) => p,
        None => {
            let product_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO products (id, global_product_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![product_id, global_product_id, name, Utc::now().to_rfc3339()],
            )?;
            (product_id, name.to_string())
        }
    };

    if let Some(variant_id) = default_variant(conn, &product_id)? {
        return Ok(variant_id);
    }

    let variant_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO variants (id, product_id, name) VALUES (?1, ?2, ?3)",
        params![variant_id, product_id, name],
    )?;
    let barcode = generate_sm_barcode(conn)?;
    attach_barcode(conn, &barcode, &variant_id, "supermandi")?;
    Ok(variant_id)
}

/// Link a variant to a store, optionally setting its selling price.
pub fn link_retailer_variant(
    conn: &Connection,
    store_id: &str,
    variant_id: &str,
    selling_price_minor: Option<i64>,
) -> ApiResult<()> {
    conn.execute(
        "INSERT INTO retailer_variants (id, store_id, variant_id)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(store_id, variant_id) DO NOTHING",
        params![Uuid::new_v4().to_string(), store_id, variant_id],
    )?;
    if let Some(price) = selling_price_minor {
        conn.execute(
            "UPDATE retailer_variants SET selling_price_minor = ?3, price_updated_at = ?4
             WHERE store_id = ?1 AND variant_id = ?2",
            params![store_id, variant_id, price, Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}

/// Idempotently materialize the standard 100/250/500/1000 base-unit packs
/// for a divisible product, each with its own SM barcode and a store link.
pub fn ensure_standard_packs(
    conn: &Connection,
    store_id: &str,
    product_id: &str,
    unit_base: &str,
) -> ApiResult<()> {
    let product_name: String = conn.query_row(
        "SELECT name FROM products WHERE id = ?1",
        params![product_id],
        |row| row.get(0),
    )?;

    for size in STANDARD_PACK_SIZES {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM variants
                 WHERE product_id = ?1 AND unit_base = ?2 AND size_base = ?3",
                params![product_id, unit_base, size],
                |row| row.get(0),
            )
            .optional()?;
        let variant_id = match existing {
            Some(id) => id,
            None => {
                let variant_id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO variants (id, product_id, name, unit_base, size_base)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        variant_id,
                        product_id,
                        format!("{product_name} {size}{unit_base}"),
                        unit_base,
                        size,
                    ],
                )?;
                let barcode = generate_sm_barcode(conn)?;
                attach_barcode(conn, &barcode, &variant_id, "supermandi")?;
                variant_id
            }
        };
        link_retailer_variant(conn, store_id, &variant_id, None)?;
    }
    Ok(())
}

/// Assemble the store-local product payload returned from scan resolution.
pub fn store_product_payload(
    conn: &Connection,
    store_id: &str,
    global_product_id: &str,
    is_first_time_in_store: bool,
) -> ApiResult<ResolvedProduct> {
    let (global_name,): (String,) = conn.query_row(
        "SELECT global_name FROM global_products WHERE id = ?1",
        params![global_product_id],
        |row| Ok((row.get(0)?,)),
    )?;

    let row = conn
        .query_row(
            "SELECT store_display_name, sell_price_minor, purchase_price_minor, unit, variant
             FROM store_products WHERE store_id = ?1 AND global_product_id = ?2",
            params![store_id, global_product_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let (store_display_name, mut sell_price_minor, purchase_price_minor, unit, variant) =
        row.unwrap_or((None, None, None, None, None));

    let available_qty: i64 = conn
        .query_row(
            "SELECT available_qty FROM store_inventory
             WHERE store_id = ?1 AND global_product_id = ?2",
            params![store_id, global_product_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    let mut variant_id = None;
    let mut barcode = None;
    if let Some((product_id, _)) = product_for_global(conn, global_product_id)? {
        if let Some(vid) = default_variant(conn, &product_id)? {
            if sell_price_minor.is_none() {
                sell_price_minor = conn
                    .query_row(
                        "SELECT selling_price_minor FROM retailer_variants
                         WHERE store_id = ?1 AND variant_id = ?2",
                        params![store_id, vid],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
            }
            barcode = conn
                .query_row(
                    "SELECT barcode FROM barcodes
                     WHERE variant_id = ?1 AND barcode_type = 'supermandi'",
                    params![vid],
                    |row| row.get(0),
                )
                .optional()?;
            variant_id = Some(vid);
        }
    }

    Ok(ResolvedProduct {
        global_product_id: global_product_id.to_string(),
        store_display_name: store_display_name.unwrap_or_else(|| global_name.clone()),
        global_name,
        sell_price_minor,
        purchase_price_minor,
        unit,
        variant,
        available_qty,
        is_first_time_in_store,
        variant_id,
        barcode,
    })
}

/// Resolve a normalized scan in a store and record the scan event.
pub fn resolve_scan(
    conn: &Connection,
    store_id: &str,
    device_id: Option<&str>,
    mode: &str,
    raw_value: &str,
    scan: &NormalizedScan,
    product_name: Option<&str>,
) -> ApiResult<ScanResolution> {
    let existing = find_global_by_identifier(conn, &scan.code_type, &scan.normalized_value)?;

    let resolution = match (mode, existing) {
        ("SELL", None) => ScanResolution {
            action: "IGNORED".to_string(),
            product: None,
            product_not_found_for_store: true,
        },
        ("SELL", Some(global_product_id)) => {
            let is_first = ensure_store_product(conn, store_id, &global_product_id)?;
            let product = store_product_payload(conn, store_id, &global_product_id, is_first)?;
            let action = if product.sell_price_minor.is_some() {
                "ADD_TO_CART"
            } else {
                "PROMPT_PRICE"
            };
            ScanResolution {
                action: action.to_string(),
                product: Some(product),
                product_not_found_for_store: false,
            }
        }
        ("DIGITISE", existing) => {
            let created = existing.is_none();
            let (global_product_id, _) = match existing {
                Some(id) => (id, false),
                None => ensure_global_product(
                    conn,
                    &scan.code_type,
                    raw_value,
                    &scan.normalized_value,
                    product_name,
                )?,
            };
            let name: String = conn.query_row(
                "SELECT global_name FROM global_products WHERE id = ?1",
                params![&global_product_id],
                |row| row.get(0),
            )?;
            let variant_id = ensure_variant_for_global(conn, &global_product_id, &name)?;
            link_retailer_variant(conn, store_id, &variant_id, None)?;
            let is_first = ensure_store_product(conn, store_id, &global_product_id)?;
            let product = store_product_payload(conn, store_id, &global_product_id, is_first)?;
            let action = if created { "DIGITISED" } else { "ALREADY_DIGITISED" };
            ScanResolution {
                action: action.to_string(),
                product: Some(product),
                product_not_found_for_store: false,
            }
        }
        _ => return Err(ApiError::bad_request("invalid_scan").with_message("unknown scan mode")),
    };

    let variant_id = resolution.product.as_ref().and_then(|p| p.variant_id.clone());
    conn.execute(
        "INSERT INTO scan_events (id, store_id, device_id, scan_value, mode, action, variant_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Uuid::new_v4().to_string(),
            store_id,
            device_id,
            raw_value,
            mode,
            resolution.action,
            variant_id,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(resolution)
}
