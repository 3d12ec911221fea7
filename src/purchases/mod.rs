//! Purchase pipeline.
//!
//! Records supplier receipts: every item resolves (or creates) a product,
//! lands a RECEIVE ledger movement, and, for divisible quantities, tops up
//! the bulk pool and materializes the standard retail packs. Purchase ids
//! are client-generatable; `skip_if_exists` makes replays return the stored
//! totals instead of double-recording.

use crate::catalog::{self, VariantRow};
use crate::errors::{ApiError, ApiResult};
use crate::inventory::{self, MovementRef, MovementType};
use crate::scan::normalize_scan;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Items whose base-unit quantity reaches this threshold are treated as
/// bulk stock (grams/millilitres) rather than unit inventory alone.
const BULK_THRESHOLD_BASE: i64 = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseItemInput {
    pub product_id: Option<String>,
    pub barcode: Option<String>,
    pub product_name: Option<String>,
    pub quantity: i64,
    #[serde(default)]
    pub unit: Option<String>,
    pub unit_cost_minor: i64,
    #[serde(default)]
    pub selling_price_minor: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePurchaseRequest {
    pub items: Vec<PurchaseItemInput>,
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub purchase_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseSummary {
    pub purchase_id: String,
    pub total_minor: i64,
    pub currency: String,
    pub item_count: i64,
}

struct ResolvedPurchaseLine {
    product_id: String,
    variant_id: Option<String>,
    global_product_id: Option<String>,
    quantity: i64,
    unit: Option<String>,
    base_unit: Option<&'static str>,
    quantity_base: Option<i64>,
    unit_cost_minor: i64,
    selling_price_minor: Option<i64>,
}

fn existing_summary(conn: &Connection, store_id: &str, purchase_id: &str) -> ApiResult<Option<PurchaseSummary>> {
    Ok(conn
        .query_row(
            "SELECT p.id, p.total_minor, p.currency,
                    (SELECT COUNT(*) FROM purchase_items pi WHERE pi.purchase_id = p.id)
             FROM purchases p WHERE p.id = ?1 AND p.store_id = ?2",
            params![purchase_id, store_id],
            |row| {
                Ok(PurchaseSummary {
                    purchase_id: row.get(0)?,
                    total_minor: row.get(1)?,
                    currency: row.get(2)?,
                    item_count: row.get(3)?,
                })
            },
        )
        .optional()?)
}

fn resolve_line(conn: &Connection, item: &PurchaseItemInput) -> ApiResult<ResolvedPurchaseLine> {
    if item.quantity < 1 {
        return Err(ApiError::bad_request("invalid_quantity"));
    }
    if item.unit_cost_minor < 0 {
        return Err(ApiError::bad_request("invalid_unit_cost"));
    }

    let (product_id, variant_id) = if let Some(product_id) = &item.product_id {
        let known: Option<String> = conn
            .query_row(
                "SELECT id FROM products WHERE id = ?1",
                params![product_id],
                |row| row.get(0),
            )
            .optional()?;
        let product_id = known.ok_or_else(|| ApiError::not_found("product_not_found"))?;
        let variant: Option<String> = conn
            .query_row(
                "SELECT id FROM variants WHERE product_id = ?1 AND unit_base IS NULL AND size_base IS NULL",
                params![product_id],
                |row| row.get(0),
            )
            .optional()?;
        (product_id, variant)
    } else if let Some(barcode) = &item.barcode {
        match catalog::find_variant_by_barcode(conn, barcode)? {
            Some(VariantRow { id, product_id, .. }) => (product_id, Some(id)),
            None => create_product_for_item(conn, item)?,
        }
    } else if item.product_name.is_some() {
        create_product_for_item(conn, item)?
    } else {
        return Err(ApiError::bad_request("invalid_item").with_message("items are invalid"));
    };

    let global_product_id: Option<String> = conn
        .query_row(
            "SELECT global_product_id FROM products WHERE id = ?1",
            params![product_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let (base_unit, quantity_base) = match item.unit.as_deref().and_then(inventory::unit_to_base) {
        Some((base_unit, multiplier)) => (Some(base_unit), Some(item.quantity * multiplier)),
        None => (None, None),
    };

    Ok(ResolvedPurchaseLine {
        product_id,
        variant_id,
        global_product_id,
        quantity: item.quantity,
        unit: item.unit.clone(),
        base_unit,
        quantity_base,
        unit_cost_minor: item.unit_cost_minor,
        selling_price_minor: item.selling_price_minor,
    })
}

/// Create product + default variant for an unseen purchase item, attaching
/// the supplier barcode (verbatim) and registering a global identity so
/// later scans resolve to the same product.
fn create_product_for_item(conn: &Connection, item: &PurchaseItemInput) -> ApiResult<(String, Option<String>)> {
    let name = item
        .product_name
        .as_deref()
        .or(item.barcode.as_deref())
        .ok_or_else(|| ApiError::bad_request("invalid_item").with_message("items are invalid"))?;

    let global_product_id = match &item.barcode {
        Some(barcode) => match normalize_scan(None, barcode) {
            Some(scan) => {
                let (gp, _) = catalog::ensure_global_product(
                    conn,
                    &scan.code_type,
                    barcode,
                    &scan.normalized_value,
                    Some(name),
                )?;
                gp
            }
            None => new_global_product(conn, name)?,
        },
        None => new_global_product(conn, name)?,
    };

    let variant_id = catalog::ensure_variant_for_global(conn, &global_product_id, name)?;
    if let Some(barcode) = &item.barcode {
        catalog::attach_barcode(conn, barcode, &variant_id, "manufacturer")?;
    }
    let product_id: String = conn.query_row(
        "SELECT product_id FROM variants WHERE id = ?1",
        params![variant_id],
        |row| row.get(0),
    )?;
    Ok((product_id, Some(variant_id)))
}

fn new_global_product(conn: &Connection, name: &str) -> ApiResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO global_products (id, global_name, created_at) VALUES (?1, ?2, ?3)",
        params![id, name, Utc::now().to_rfc3339()],
    )?;
    Ok(id)
}

/// Record a purchase in one transaction. See module docs for the per-item
/// side effects.
pub fn create_purchase(
    conn: &Connection,
    store_id: &str,
    request: &CreatePurchaseRequest,
    skip_if_exists: bool,
) -> ApiResult<PurchaseSummary> {
    if let Some(purchase_id) = &request.purchase_id {
        if let Some(existing) = existing_summary(conn, store_id, purchase_id)? {
            if skip_if_exists {
                return Ok(existing);
            }
            return Err(ApiError::conflict("purchase_exists"));
        }
    }

    if request.items.is_empty() {
        return Err(ApiError::bad_request("items_required"));
    }
    let lines: Vec<ResolvedPurchaseLine> = request
        .items
        .iter()
        .map(|item| resolve_line(conn, item))
        .collect::<ApiResult<_>>()?;

    let total_minor: i64 = lines.iter().map(|l| l.quantity * l.unit_cost_minor).sum();
    let currency = request.currency.clone().unwrap_or_else(|| "INR".to_string());
    let purchase_id = request.purchase_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    conn.execute(
        "INSERT INTO purchases (id, store_id, supplier_name, total_minor, currency, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            purchase_id,
            store_id,
            request.supplier_name,
            total_minor,
            currency,
            Utc::now().to_rfc3339(),
        ],
    )?;

    for line in &lines {
        conn.execute(
            "INSERT INTO purchase_items
                (id, purchase_id, product_id, variant_id, quantity, unit, quantity_base,
                 unit_cost_minor, line_total_minor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                purchase_id,
                line.product_id,
                line.variant_id,
                line.quantity,
                line.unit,
                line.quantity_base,
                line.unit_cost_minor,
                line.quantity * line.unit_cost_minor,
            ],
        )?;

        if let Some(global_product_id) = &line.global_product_id {
            inventory::apply_movement(
                conn,
                store_id,
                global_product_id,
                MovementType::Receive,
                line.quantity,
                Some(line.unit_cost_minor),
                None,
                MovementRef::purchase(&purchase_id),
            )?;

            catalog::ensure_store_product(conn, store_id, global_product_id)?;
            conn.execute(
                "UPDATE store_products SET purchase_price_minor = ?3, unit = COALESCE(?4, unit)
                 WHERE store_id = ?1 AND global_product_id = ?2",
                params![store_id, global_product_id, line.unit_cost_minor, line.unit],
            )?;
        }

        if let (Some(base_unit), Some(quantity_base)) = (line.base_unit, line.quantity_base) {
            if quantity_base >= BULK_THRESHOLD_BASE {
                inventory::bulk_topup(conn, store_id, &line.product_id, base_unit, quantity_base)?;
                catalog::ensure_standard_packs(conn, store_id, &line.product_id, base_unit)?;
            }
        }

        if let Some(variant_id) = &line.variant_id {
            catalog::link_retailer_variant(conn, store_id, variant_id, line.selling_price_minor)?;
            if let (Some(price), Some(global_product_id)) =
                (line.selling_price_minor, &line.global_product_id)
            {
                conn.execute(
                    "UPDATE store_products SET sell_price_minor = ?3
                     WHERE store_id = ?1 AND global_product_id = ?2",
                    params![store_id, global_product_id, price],
                )?;
            }
        }
    }

    Ok(PurchaseSummary {
        purchase_id,
        total_minor,
        currency,
        item_count: lines.len() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.write_tx(|tx| {
            tx.execute(
                "INSERT INTO stores (id, name, upi_vpa, active, created_at)
                 VALUES ('s1', 'Kirana One', 'kirana@upi', 1, '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    fn atta_purchase(purchase_id: Option<&str>) -> CreatePurchaseRequest {
        CreatePurchaseRequest {
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
            purchase_id: purchase_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn bulk_purchase_creates_packs_and_pools() {
        let db = test_db().await;
        let summary = db
            .write_tx(|tx| create_purchase(tx, "s1", &atta_purchase(None), false))
            .await
            .unwrap();
        assert_eq!(summary.total_minor, 40_000);
        assert_eq!(summary.item_count, 1);

        db.read(|conn| {
            let (base_unit, quantity_base): (String, i64) = conn.query_row(
                "SELECT base_unit, quantity_base FROM bulk_inventory WHERE store_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(base_unit, "g");
            assert_eq!(quantity_base, 10_000);

            let packs: i64 = conn.query_row(
                "SELECT COUNT(*) FROM variants WHERE unit_base = 'g'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(packs, 4);

            let receive: i64 = conn.query_row(
                "SELECT quantity FROM inventory_ledger WHERE movement_type = 'RECEIVE'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(receive, 10);

            let (purchase_price, sell_price): (i64, i64) = conn.query_row(
                "SELECT purchase_price_minor, sell_price_minor FROM store_products WHERE store_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(purchase_price, 4000);
            assert_eq!(sell_price, 5000);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn skip_if_exists_returns_stored_totals() {
        let db = test_db().await;
        let first = db
            .write_tx(|tx| create_purchase(tx, "s1", &atta_purchase(Some("purchase-1")), true))
            .await
            .unwrap();
        let replay = db
            .write_tx(|tx| create_purchase(tx, "s1", &atta_purchase(Some("purchase-1")), true))
            .await
            .unwrap();
        assert_eq!(first.total_minor, replay.total_minor);

        db.read(|conn| {
            let purchases: i64 = conn.query_row("SELECT COUNT(*) FROM purchases", [], |row| row.get(0))?;
            let items: i64 = conn.query_row("SELECT COUNT(*) FROM purchase_items", [], |row| row.get(0))?;
            let movements: i64 = conn.query_row("SELECT COUNT(*) FROM inventory_ledger", [], |row| row.get(0))?;
            assert_eq!((purchases, items, movements), (1, 1, 1));
            let (_, quantity_base): (String, i64) = conn.query_row(
                "SELECT base_unit, quantity_base FROM bulk_inventory WHERE store_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(quantity_base, 10_000);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn repurchase_by_barcode_reuses_product() {
        let db = test_db().await;
        db.write_tx(|tx| create_purchase(tx, "s1", &atta_purchase(None), false))
            .await
            .unwrap();
        db.write_tx(|tx| create_purchase(tx, "s1", &atta_purchase(None), false))
            .await
            .unwrap();

        db.read(|conn| {
            let products: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
            assert_eq!(products, 1);
            let (_, quantity_base): (String, i64) = conn.query_row(
                "SELECT base_unit, quantity_base FROM bulk_inventory",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(quantity_base, 20_000);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn small_quantity_stays_out_of_bulk() {
        let db = test_db().await;
        let mut request = atta_purchase(None);
        request.items[0].quantity = 500;
        request.items[0].unit = Some("g".to_string());
        db.write_tx(|tx| create_purchase(tx, "s1", &request, false))
            .await
            .unwrap();

        let bulk_rows: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM bulk_inventory", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(bulk_rows, 0);
    }

    #[tokio::test]
    async fn invalid_quantities_and_costs_are_rejected() {
        let db = test_db().await;
        let mut zero_quantity = atta_purchase(None);
        zero_quantity.items[0].quantity = 0;
        let err = db
            .write_tx(|tx| create_purchase(tx, "s1", &zero_quantity, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_quantity");

        let mut negative_cost = atta_purchase(None);
        negative_cost.items[0].unit_cost_minor = -1;
        let err = db
            .write_tx(|tx| create_purchase(tx, "s1", &negative_cost, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_unit_cost");
    }

    #[tokio::test]
    async fn unknown_product_id_is_not_found() {
        let db = test_db().await;
        let request = CreatePurchaseRequest {
            items: vec![PurchaseItemInput {
                product_id: Some("nope".to_string()),
                barcode: None,
                product_name: None,
                quantity: 1,
                unit: None,
                unit_cost_minor: 100,
                selling_price_minor: None,
            }],
            supplier_name: None,
            currency: None,
            purchase_id: None,
        };
        let err = db
            .write_tx(|tx| create_purchase(tx, "s1", &request, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "product_not_found");
    }
}
