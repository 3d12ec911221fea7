//! Sales state machine.
//!
//! Two-phase protocol: `create` persists a PENDING cart after validating
//! availability, `confirm` re-verifies stock and performs every deduction
//! (ledger SELL for unit products, base-unit deduction for packs) together
//! with the payment row, inside one immediate transaction. Cancellation is
//! only reachable from PENDING and restores nothing, because nothing was
//! deducted yet.

use crate::catalog::{self, VariantRow};
use crate::errors::{ApiError, ApiResult};
use crate::inventory::{self, BulkRequirement, MovementRef, MovementType, StockRequirement};
use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_ITEM_QUANTITY: i64 = 100_000;
pub const MAX_ITEM_PRICE_MINOR: i64 = 100_000_000;

const BILL_REF_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleStatus {
    Pending,
    PaidCash,
    PaidUpi,
    Due,
    Cancelled,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Pending => "PENDING",
            SaleStatus::PaidCash => "PAID_CASH",
            SaleStatus::PaidUpi => "PAID_UPI",
            SaleStatus::Due => "DUE",
            SaleStatus::Cancelled => "CANCELLED",
        }
    }

    /// `CREATED` is a legacy synonym for `PENDING` written by old sync
    /// clients; reads accept it, writes always canonicalize.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" | "CREATED" => Some(SaleStatus::Pending),
            "PAID_CASH" => Some(SaleStatus::PaidCash),
            "PAID_UPI" => Some(SaleStatus::PaidUpi),
            "DUE" => Some(SaleStatus::Due),
            "CANCELLED" => Some(SaleStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    Cash,
    Upi,
    Due,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "CASH",
            PaymentMode::Upi => "UPI",
            PaymentMode::Due => "DUE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CASH" => Some(PaymentMode::Cash),
            "UPI" => Some(PaymentMode::Upi),
            "DUE" => Some(PaymentMode::Due),
            _ => None,
        }
    }

    pub fn terminal_status(&self) -> SaleStatus {
        match self {
            PaymentMode::Cash => SaleStatus::PaidCash,
            PaymentMode::Upi => SaleStatus::PaidUpi,
            PaymentMode::Due => SaleStatus::Due,
        }
    }

    pub fn payment_status(&self) -> &'static str {
        match self {
            PaymentMode::Cash | PaymentMode::Upi => "PAID",
            PaymentMode::Due => "DUE",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItemInput {
    pub variant_id: Option<String>,
    pub product_id: Option<String>,
    pub global_product_id: Option<String>,
    pub quantity: i64,
    pub price_minor: i64,
    pub name: Option<String>,
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSaleRequest {
    pub items: Vec<SaleItemInput>,
    #[serde(default)]
    pub discount_minor: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub sale_id: Option<String>,
    #[serde(default)]
    pub offline_receipt_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SaleTotals {
    pub subtotal: i64,
    pub discount: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleSummary {
    pub sale_id: String,
    pub bill_ref: String,
    pub status: String,
    pub totals: SaleTotals,
    pub currency: String,
}

struct ResolvedLine {
    variant: VariantRow,
    name: String,
    quantity: i64,
    price_minor: i64,
    barcode: Option<String>,
}

fn base36_upper(mut value: u32, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut out = vec![b'0'; width];
    let mut i = width;
    while value > 0 && i > 0 {
        i -= 1;
        out[i] = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    out.into_iter().map(char::from).collect()
}

/// 13-char bill reference: 8-digit millisecond tail + 5 base36 chars drawn
/// from 24 random bits. Regenerated on collision.
pub fn generate_bill_ref(conn: &Connection) -> ApiResult<String> {
    for _ in 0..BILL_REF_RETRIES {
        let tail = Utc::now().timestamp_millis().rem_euclid(100_000_000);
        let entropy: u32 = rand::thread_rng().gen_range(0..(1 << 24));
        let candidate = format!("{:08}{}", tail, base36_upper(entropy, 5));
        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM sales WHERE bill_ref = ?1",
                params![candidate],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_none() {
            return Ok(candidate);
        }
    }
    Err(ApiError::internal("could not allocate a bill reference"))
}

fn invalid_items() -> ApiError {
    ApiError::bad_request("invalid_item").with_message("items are invalid")
}

fn resolve_item(conn: &Connection, store_id: &str, item: &SaleItemInput) -> ApiResult<ResolvedLine> {
    if item.quantity < 1
        || item.quantity > MAX_ITEM_QUANTITY
        || item.price_minor < 1
        || item.price_minor > MAX_ITEM_PRICE_MINOR
    {
        return Err(invalid_items());
    }

    let variant = if let Some(variant_id) = &item.variant_id {
        catalog::variant_by_id(conn, variant_id)?.ok_or_else(invalid_items)?
    } else if let Some(global_product_id) = &item.global_product_id {
        variant_for_global(conn, store_id, global_product_id)?.ok_or_else(invalid_items)?
    } else if let Some(product_id) = &item.product_id {
        let direct: Option<String> = conn
            .query_row(
                "SELECT global_product_id FROM products WHERE id = ?1",
                params![product_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        // A miss means the client sent a global product id in the legacy
        // productId field.
        let global_product_id = direct.unwrap_or_else(|| product_id.clone());
        variant_for_global(conn, store_id, &global_product_id)?.ok_or_else(invalid_items)?
    } else {
        return Err(invalid_items());
    };

    Ok(ResolvedLine {
        name: item.name.clone().unwrap_or_else(|| variant.name.clone()),
        quantity: item.quantity,
        price_minor: item.price_minor,
        barcode: item.barcode.clone(),
        variant,
    })
}

/// Variant lookup keyed by global product, creating the store-linked default
/// variant on first use.
fn variant_for_global(conn: &Connection, store_id: &str, global_product_id: &str) -> ApiResult<Option<VariantRow>> {
    let name: Option<String> = conn
        .query_row(
            "SELECT global_name FROM global_products WHERE id = ?1",
            params![global_product_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(name) = name else {
        return Ok(None);
    };
    let variant_id = catalog::ensure_variant_for_global(conn, global_product_id, &name)?;
    catalog::link_retailer_variant(conn, store_id, &variant_id, None)?;
    catalog::variant_by_id(conn, &variant_id)
}

/// A line is bulk-tracked when its variant is a fixed pack in base units.
fn bulk_pack(variant: &VariantRow) -> Option<(&str, i64)> {
    match (&variant.unit_base, variant.size_base) {
        (Some(unit), Some(size)) => Some((unit.as_str(), size)),
        _ => None,
    }
}

fn check_availability(conn: &Connection, store_id: &str, lines: &[ResolvedLine]) -> ApiResult<()> {
    let mut stock = Vec::new();
    let mut bulk = Vec::new();
    for line in lines {
        if let Some((base_unit, size_base)) = bulk_pack(&line.variant) {
            bulk.push(BulkRequirement {
                product_id: line.variant.product_id.clone(),
                base_unit: base_unit.to_string(),
                required_base: line.quantity * size_base,
                name: line.name.clone(),
            });
        } else if let Some(global_product_id) = &line.variant.global_product_id {
            stock.push(StockRequirement {
                global_product_id: global_product_id.clone(),
                required: line.quantity,
                name: Some(line.name.clone()),
            });
        }
    }
    inventory::ensure_availability(conn, store_id, &stock)?;
    inventory::ensure_bulk_availability(conn, store_id, &bulk)
}

fn deduct_stock(conn: &Connection, store_id: &str, sale_id: &str, lines: &[ResolvedLine]) -> ApiResult<()> {
    for line in lines {
        if let Some((base_unit, size_base)) = bulk_pack(&line.variant) {
            inventory::apply_bulk_deduction(
                conn,
                store_id,
                &line.variant.product_id,
                base_unit,
                line.quantity * size_base,
                &line.name,
            )?;
        } else if let Some(global_product_id) = &line.variant.global_product_id {
            inventory::apply_movement(
                conn,
                store_id,
                global_product_id,
                MovementType::Sell,
                line.quantity,
                None,
                Some(line.price_minor),
                MovementRef::sale(sale_id),
            )?;
        }
    }
    Ok(())
}

fn summary_row(conn: &Connection, store_id: &str, sale_id: &str) -> ApiResult<Option<SaleSummary>> {
    Ok(conn
        .query_row(
            "SELECT id, bill_ref, status, subtotal_minor, discount_minor, total_minor, currency
             FROM sales WHERE id = ?1 AND store_id = ?2",
            params![sale_id, store_id],
            |row| {
                Ok(SaleSummary {
                    sale_id: row.get(0)?,
                    bill_ref: row.get(1)?,
                    status: row.get(2)?,
                    totals: SaleTotals {
                        subtotal: row.get(3)?,
                        discount: row.get(4)?,
                        total: row.get(5)?,
                    },
                    currency: row.get(6)?,
                })
            },
        )
        .optional()?)
}

/// Create a PENDING sale. `deduct_immediately` is the offline-sync variant,
/// where the client already completed checkout and stock is applied in the
/// same transaction.
pub fn create_sale(
    conn: &Connection,
    store_id: &str,
    device_id: Option<&str>,
    request: &CreateSaleRequest,
    deduct_immediately: bool,
) -> ApiResult<SaleSummary> {
    if let Some(sale_id) = &request.sale_id {
        if let Some(existing) = summary_row(conn, store_id, sale_id)? {
            return Ok(existing);
        }
        let elsewhere: Option<String> = conn
            .query_row(
                "SELECT store_id FROM sales WHERE id = ?1",
                params![sale_id],
                |row| row.get(0),
            )
            .optional()?;
        if elsewhere.is_some() {
            return Err(ApiError::conflict("sale_id_conflict"));
        }
    }

    if request.items.is_empty() {
        return Err(ApiError::bad_request("items_required"));
    }
    let lines: Vec<ResolvedLine> = request
        .items
        .iter()
        .map(|item| resolve_item(conn, store_id, item))
        .collect::<ApiResult<_>>()?;

    check_availability(conn, store_id, &lines)?;

    let subtotal: i64 = lines.iter().map(|l| l.quantity * l.price_minor).sum();
    let discount = request.discount_minor.unwrap_or(0).max(0);
    let total = (subtotal - discount).max(0);
    let currency = request.currency.clone().unwrap_or_else(|| "INR".to_string());

    let sale_id = request.sale_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let bill_ref = generate_bill_ref(conn)?;
    conn.execute(
        "INSERT INTO sales
            (id, store_id, device_id, bill_ref, offline_receipt_ref, subtotal_minor,
             discount_minor, total_minor, currency, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            sale_id,
            store_id,
            device_id,
            bill_ref,
            request.offline_receipt_ref,
            subtotal,
            discount,
            total,
            currency,
            SaleStatus::Pending.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;

    for line in &lines {
        conn.execute(
            "INSERT INTO sale_items
                (id, sale_id, variant_id, quantity, price_minor, line_total_minor, item_name, barcode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                sale_id,
                line.variant.id,
                line.quantity,
                line.price_minor,
                line.quantity * line.price_minor,
                line.name,
                line.barcode,
            ],
        )?;
    }

    if deduct_immediately {
        deduct_stock(conn, store_id, &sale_id, &lines)?;
    }

    Ok(SaleSummary {
        sale_id,
        bill_ref,
        status: SaleStatus::Pending.as_str().to_string(),
        totals: SaleTotals { subtotal, discount, total },
        currency,
    })
}

fn load_sale_lines(conn: &Connection, sale_id: &str) -> ApiResult<Vec<ResolvedLine>> {
    let mut stmt = conn.prepare(
        "SELECT si.variant_id, si.item_name, si.quantity, si.price_minor, si.barcode
         FROM sale_items si WHERE si.sale_id = ?1",
    )?;
    let rows: Vec<(String, String, i64, i64, Option<String>)> = stmt
        .query_map(params![sale_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut lines = Vec::with_capacity(rows.len());
    for (variant_id, name, quantity, price_minor, barcode) in rows {
        let variant = catalog::variant_by_id(conn, &variant_id)?
            .ok_or_else(|| ApiError::internal(format!("sale item references missing variant {variant_id}")))?;
        lines.push(ResolvedLine { variant, name, quantity, price_minor, barcode });
    }
    Ok(lines)
}

/// Confirm a PENDING sale: re-verify stock, deduct, record the payment, and
/// move to the terminal status for `mode`. When `payment_id` is given (the
/// manual UPI flow), that pending payment row is completed instead of a new
/// one being inserted.
pub fn confirm_sale(
    conn: &Connection,
    store_id: &str,
    sale_id: &str,
    mode: PaymentMode,
    payment_id: Option<&str>,
) -> ApiResult<SaleSummary> {
    let sale = summary_row(conn, store_id, sale_id)?
        .ok_or_else(|| ApiError::not_found("sale_not_found"))?;
    match SaleStatus::parse(&sale.status) {
        Some(SaleStatus::Pending) => {}
        Some(SaleStatus::Cancelled) => return Err(ApiError::conflict("sale_not_pending")),
        Some(_) => return Err(ApiError::conflict("sale_already_confirmed")),
        None => return Err(ApiError::internal(format!("sale {sale_id} has unknown status"))),
    }

    let lines = load_sale_lines(conn, sale_id)?;
    check_availability(conn, store_id, &lines)?;
    deduct_stock(conn, store_id, sale_id, &lines)?;

    let now = Utc::now().to_rfc3339();
    match payment_id {
        Some(payment_id) => {
            let updated = conn.execute(
                "UPDATE payments SET status = ?3, confirmed_at = ?4
                 WHERE id = ?1 AND sale_id = ?2",
                params![payment_id, sale_id, mode.payment_status(), now],
            )?;
            if updated == 0 {
                return Err(ApiError::not_found("payment not found"));
            }
        }
        None => {
            record_payment(conn, sale_id, mode, sale.totals.total, None)?;
        }
    }

    let status = mode.terminal_status();
    conn.execute(
        "UPDATE sales SET status = ?2 WHERE id = ?1",
        params![sale_id, status.as_str()],
    )?;

    Ok(SaleSummary { status: status.as_str().to_string(), ..sale })
}

/// Insert a payment row for a sale unless an identical (mode, status) row
/// already exists; returns the payment id either way.
pub fn record_payment(
    conn: &Connection,
    sale_id: &str,
    mode: PaymentMode,
    amount_minor: i64,
    provider_ref: Option<&str>,
) -> ApiResult<String> {
    let status = mode.payment_status();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM payments WHERE sale_id = ?1 AND mode = ?2 AND status = ?3",
            params![sale_id, mode.as_str(), status],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let confirmed_at = if status == "PAID" { Some(now.clone()) } else { None };
    conn.execute(
        "INSERT INTO payments (id, sale_id, mode, status, amount_minor, provider_ref, confirmed_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![payment_id, sale_id, mode.as_str(), status, amount_minor, provider_ref, confirmed_at, now],
    )?;
    Ok(payment_id)
}

/// PENDING -> CANCELLED. Terminal states reject with `cannot_cancel`.
pub fn cancel_sale(conn: &Connection, store_id: &str, sale_id: &str) -> ApiResult<SaleSummary> {
    let sale = summary_row(conn, store_id, sale_id)?
        .ok_or_else(|| ApiError::not_found("sale_not_found"))?;
    if SaleStatus::parse(&sale.status) != Some(SaleStatus::Pending) {
        return Err(ApiError::conflict("cannot_cancel"));
    }
    conn.execute(
        "UPDATE sales SET status = ?2 WHERE id = ?1",
        params![sale_id, SaleStatus::Cancelled.as_str()],
    )?;
    Ok(SaleSummary { status: SaleStatus::Cancelled.as_str().to_string(), ..sale })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpiInit {
    pub payment_id: String,
    pub bill_ref: String,
    pub amount_minor: i64,
    pub store_name: String,
    pub upi_vpa: String,
}

/// Create (or reuse) the PENDING UPI payment for a sale and return the
/// fields the client needs to compose its own UPI intent.
pub fn init_upi_payment(
    conn: &Connection,
    store_id: &str,
    sale_id: &str,
    transaction_id: Option<&str>,
) -> ApiResult<UpiInit> {
    let sale = summary_row(conn, store_id, sale_id)?
        .ok_or_else(|| ApiError::not_found("sale_not_found"))?;
    if SaleStatus::parse(&sale.status) != Some(SaleStatus::Pending) {
        return Err(ApiError::conflict("sale_not_pending"));
    }

    let (store_name, upi_vpa): (String, Option<String>) = conn.query_row(
        "SELECT name, upi_vpa FROM stores WHERE id = ?1",
        params![store_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let upi_vpa = upi_vpa.ok_or_else(|| ApiError::forbidden("store_inactive"))?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM payments WHERE sale_id = ?1 AND mode = 'UPI' AND status = 'PENDING'",
            params![sale_id],
            |row| row.get(0),
        )
        .optional()?;
    let payment_id = match existing {
        Some(id) => id,
        None => {
            let payment_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO payments (id, sale_id, mode, status, amount_minor, provider_ref, created_at)
                 VALUES (?1, ?2, 'UPI', 'PENDING', ?3, ?4, ?5)",
                params![
                    payment_id,
                    sale_id,
                    sale.totals.total,
                    transaction_id,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            payment_id
        }
    };

    Ok(UpiInit {
        payment_id,
        bill_ref: sale.bill_ref,
        amount_minor: sale.totals.total,
        store_name,
        upi_vpa,
    })
}

/// Sale owning a payment id, scoped to the bound store.
pub fn sale_for_payment(conn: &Connection, store_id: &str, payment_id: &str) -> ApiResult<String> {
    conn.query_row(
        "SELECT s.id FROM payments p JOIN sales s ON s.id = p.sale_id
         WHERE p.id = ?1 AND s.store_id = ?2",
        params![payment_id, store_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| ApiError::not_found("payment not found"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleListEntry {
    pub sale_id: String,
    pub bill_ref: String,
    pub status: String,
    pub total_minor: i64,
    pub currency: String,
    pub created_at: String,
}

pub fn list_sales(conn: &Connection, store_id: &str, limit: i64, offset: i64) -> ApiResult<Vec<SaleListEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, bill_ref, status, total_minor, currency, created_at
         FROM sales WHERE store_id = ?1
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
    )?;
    let entries = stmt
        .query_map(params![store_id, limit.clamp(1, 200), offset.max(0)], |row| {
            Ok(SaleListEntry {
                sale_id: row.get(0)?,
                bill_ref: row.get(1)?,
                status: row.get(2)?,
                total_minor: row.get(3)?,
                currency: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItemDetail {
    pub variant_id: String,
    pub item_name: String,
    pub quantity: i64,
    pub price_minor: i64,
    pub line_total_minor: i64,
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetail {
    pub payment_id: String,
    pub mode: String,
    pub status: String,
    pub amount_minor: i64,
    pub confirmed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleDetail {
    #[serde(flatten)]
    pub summary: SaleSummary,
    pub items: Vec<SaleItemDetail>,
    pub payments: Vec<PaymentDetail>,
    pub created_at: String,
}

pub fn sale_detail(conn: &Connection, store_id: &str, sale_id: &str) -> ApiResult<SaleDetail> {
    let summary = summary_row(conn, store_id, sale_id)?
        .ok_or_else(|| ApiError::not_found("sale_not_found"))?;
    let created_at: String = conn.query_row(
        "SELECT created_at FROM sales WHERE id = ?1",
        params![sale_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT variant_id, item_name, quantity, price_minor, line_total_minor, barcode
         FROM sale_items WHERE sale_id = ?1",
    )?;
    let items = stmt
        .query_map(params![sale_id], |row| {
            Ok(SaleItemDetail {
                variant_id: row.get(0)?,
                item_name: row.get(1)?,
                quantity: row.get(2)?,
                price_minor: row.get(3)?,
                line_total_minor: row.get(4)?,
                barcode: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, mode, status, amount_minor, confirmed_at
         FROM payments WHERE sale_id = ?1 ORDER BY created_at",
    )?;
    let payments = stmt
        .query_map(params![sale_id], |row| {
            Ok(PaymentDetail {
                payment_id: row.get(0)?,
                mode: row.get(1)?,
                status: row.get(2)?,
                amount_minor: row.get(3)?,
                confirmed_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SaleDetail { summary, items, payments, created_at })
}
