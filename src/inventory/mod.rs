//! Inventory ledger.
//!
//! Append-only movement log driving the authoritative per-store quantity.
//! `store_inventory.available_qty` must always equal the ledger sum for the
//! same `(store, global product)` pair. Divisible products are tracked
//! separately in `bulk_inventory`, denominated in base units (g/ml).

use crate::errors::{ApiError, ApiResult, StockShortfall};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementType {
    Receive,
    Sell,
    Adjustment,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Receive => "RECEIVE",
            MovementType::Sell => "SELL",
            MovementType::Adjustment => "ADJUSTMENT",
        }
    }
}

/// Provenance attached to a ledger row.
#[derive(Debug, Clone, Copy, Default)]
pub struct MovementRef<'a> {
    pub reference_type: Option<&'a str>,
    pub reference_id: Option<&'a str>,
    pub reason: Option<&'a str>,
}

impl<'a> MovementRef<'a> {
    pub fn sale(sale_id: &'a str) -> Self {
        Self {
            reference_type: Some("SALE"),
            reference_id: Some(sale_id),
            reason: None,
        }
    }

    pub fn purchase(purchase_id: &'a str) -> Self {
        Self {
            reference_type: Some("PURCHASE"),
            reference_id: Some(purchase_id),
            reason: None,
        }
    }
}

/// One availability requirement for `ensure_availability`.
#[derive(Debug, Clone)]
pub struct StockRequirement {
    pub global_product_id: String,
    pub required: i64,
    pub name: Option<String>,
}

/// Apply one stock movement: adjust `store_inventory` and append the ledger
/// row, atomically within the caller's transaction. Returns the new
/// available quantity.
pub fn apply_movement(
    conn: &Connection,
    store_id: &str,
    global_product_id: &str,
    movement: MovementType,
    quantity: i64,
    unit_cost_minor: Option<i64>,
    unit_sell_minor: Option<i64>,
    reference: MovementRef<'_>,
) -> ApiResult<i64> {
    if quantity == 0 {
        return Err(ApiError::bad_request("invalid_quantity").with_message("quantity must be non-zero"));
    }
    let delta = match movement {
        MovementType::Receive => quantity.abs(),
        MovementType::Sell => -quantity.abs(),
        MovementType::Adjustment => quantity,
    };

    conn.execute(
        "INSERT INTO store_inventory (store_id, global_product_id, available_qty)
         VALUES (?1, ?2, 0)
         ON CONFLICT(store_id, global_product_id) DO NOTHING",
        params![store_id, global_product_id],
    )?;

    let current: i64 = conn.query_row(
        "SELECT available_qty FROM store_inventory
         WHERE store_id = ?1 AND global_product_id = ?2",
        params![store_id, global_product_id],
        |row| row.get(0),
    )?;

    let next = current + delta;
    if next < 0 {
        let name = product_name(conn, global_product_id)?;
        return Err(ApiError::insufficient_stock(vec![StockShortfall::new(
            global_product_id,
            current,
            delta.abs(),
            name,
        )]));
    }

    conn.execute(
        "UPDATE store_inventory SET available_qty = ?3
         WHERE store_id = ?1 AND global_product_id = ?2",
        params![store_id, global_product_id, next],
    )?;

    conn.execute(
        "INSERT INTO inventory_ledger
            (id, store_id, global_product_id, movement_type, quantity,
             unit_cost_minor, unit_sell_minor, reason, reference_type, reference_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            Uuid::new_v4().to_string(),
            store_id,
            global_product_id,
            movement.as_str(),
            delta,
            unit_cost_minor,
            unit_sell_minor,
            reference.reason,
            reference.reference_type,
            reference.reference_id,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(next)
}

/// Verify that every requirement can be satisfied. Requirements for the same
/// product are aggregated, and rows are examined in sorted product order so
/// concurrent checks always walk the table the same way.
pub fn ensure_availability(
    conn: &Connection,
    store_id: &str,
    requirements: &[StockRequirement],
) -> ApiResult<()> {
    let mut required: BTreeMap<&str, (i64, Option<&str>)> = BTreeMap::new();
    for req in requirements {
        let entry = required.entry(req.global_product_id.as_str()).or_insert((0, None));
        entry.0 += req.required;
        if entry.1.is_none() {
            entry.1 = req.name.as_deref();
        }
    }

    let mut shortfalls = Vec::new();
    for (global_product_id, (needed, name)) in required {
        let available: i64 = conn
            .query_row(
                "SELECT available_qty FROM store_inventory
                 WHERE store_id = ?1 AND global_product_id = ?2",
                params![store_id, global_product_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if available < needed {
            let name = match name {
                Some(n) => n.to_string(),
                None => product_name(conn, global_product_id)?,
            };
            shortfalls.push(StockShortfall::new(global_product_id, available, needed, name));
        }
    }

    if shortfalls.is_empty() {
        Ok(())
    } else {
        Err(ApiError::insufficient_stock(shortfalls))
    }
}

/// Ledger sum for a product; reconciliation against `store_inventory`.
pub fn fetch_ledger_stock(conn: &Connection, store_id: &str, global_product_id: &str) -> ApiResult<i64> {
    let sum: Option<i64> = conn.query_row(
        "SELECT SUM(quantity) FROM inventory_ledger
         WHERE store_id = ?1 AND global_product_id = ?2",
        params![store_id, global_product_id],
        |row| row.get(0),
    )?;
    Ok(sum.unwrap_or(0))
}

fn product_name(conn: &Connection, global_product_id: &str) -> ApiResult<String> {
    Ok(conn
        .query_row(
            "SELECT global_name FROM global_products WHERE id = ?1",
            params![global_product_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| global_product_id.to_string()))
}

// ---------------------------------------------------------------------------
// Bulk sub-engine
// ---------------------------------------------------------------------------

/// Purchase/selling units mapped to (base unit, multiplier).
pub fn unit_to_base(unit: &str) -> Option<(&'static str, i64)> {
    match unit.trim().to_ascii_lowercase().as_str() {
        "g" => Some(("g", 1)),
        "kg" => Some(("g", 1000)),
        "ml" => Some(("ml", 1)),
        "l" => Some(("ml", 1000)),
        _ => None,
    }
}

/// One bulk requirement: `required_base` base units of a divisible product.
#[derive(Debug, Clone)]
pub struct BulkRequirement {
    pub product_id: String,
    pub base_unit: String,
    pub required_base: i64,
    pub name: String,
}

fn bulk_row(conn: &Connection, store_id: &str, product_id: &str) -> ApiResult<Option<(String, i64)>> {
    Ok(conn
        .query_row(
            "SELECT base_unit, quantity_base FROM bulk_inventory
             WHERE store_id = ?1 AND product_id = ?2",
            params![store_id, product_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Check aggregate base-unit availability across all lines sharing a product.
pub fn ensure_bulk_availability(
    conn: &Connection,
    store_id: &str,
    requirements: &[BulkRequirement],
) -> ApiResult<()> {
    let mut required: BTreeMap<&str, (i64, &str, &str)> = BTreeMap::new();
    for req in requirements {
        let entry = required
            .entry(req.product_id.as_str())
            .or_insert((0, req.base_unit.as_str(), req.name.as_str()));
        entry.0 += req.required_base;
    }

    let mut shortfalls = Vec::new();
    for (product_id, (needed, base_unit, name)) in required {
        match bulk_row(conn, store_id, product_id)? {
            Some((unit, quantity_base)) => {
                if unit != base_unit {
                    return Err(ApiError::conflict("bulk_unit_mismatch")
                        .with_message(format!("bulk inventory is tracked in {unit}, movement uses {base_unit}")));
                }
                if quantity_base < needed {
                    shortfalls.push(StockShortfall::new(product_id, quantity_base, needed, name));
                }
            }
            None => shortfalls.push(StockShortfall::new(product_id, 0, needed, name)),
        }
    }

    if shortfalls.is_empty() {
        Ok(())
    } else {
        Err(ApiError::insufficient_stock(shortfalls))
    }
}

/// Deduct base units from a product's bulk pool. The pool must already exist
/// with a matching base unit and enough quantity.
pub fn apply_bulk_deduction(
    conn: &Connection,
    store_id: &str,
    product_id: &str,
    base_unit: &str,
    amount_base: i64,
    name: &str,
) -> ApiResult<i64> {
    match bulk_row(conn, store_id, product_id)? {
        Some((unit, quantity_base)) => {
            if unit != base_unit {
                return Err(ApiError::conflict("bulk_unit_mismatch")
                    .with_message(format!("bulk inventory is tracked in {unit}, movement uses {base_unit}")));
            }
            if quantity_base < amount_base {
                return Err(ApiError::insufficient_stock(vec![StockShortfall::new(
                    product_id,
                    quantity_base,
                    amount_base,
                    name,
                )]));
            }
            let next = quantity_base - amount_base;
            conn.execute(
                "UPDATE bulk_inventory SET quantity_base = ?3
                 WHERE store_id = ?1 AND product_id = ?2",
                params![store_id, product_id, next],
            )?;
            Ok(next)
        }
        None => Err(ApiError::insufficient_stock(vec![StockShortfall::new(
            product_id, 0, amount_base, name,
        )])),
    }
}

/// Add base units to a product's bulk pool, creating it on first use. The
/// first row fixes `base_unit` for the (store, product) pair.
pub fn bulk_topup(
    conn: &Connection,
    store_id: &str,
    product_id: &str,
    base_unit: &str,
    amount_base: i64,
) -> ApiResult<i64> {
    match bulk_row(conn, store_id, product_id)? {
        Some((unit, quantity_base)) => {
            if unit != base_unit {
                return Err(ApiError::conflict("bulk_unit_mismatch")
                    .with_message(format!("bulk inventory is tracked in {unit}, movement uses {base_unit}")));
            }
            let next = quantity_base + amount_base;
            conn.execute(
                "UPDATE bulk_inventory SET quantity_base = ?3
                 WHERE store_id = ?1 AND product_id = ?2",
                params![store_id, product_id, next],
            )?;
            Ok(next)
        }
        None => {
            conn.execute(
                "INSERT INTO bulk_inventory (store_id, product_id, base_unit, quantity_base)
                 VALUES (?1, ?2, ?3, ?4)",
                params![store_id, product_id, base_unit, amount_base],
            )?;
            Ok(amount_base)
        }
    }
}
