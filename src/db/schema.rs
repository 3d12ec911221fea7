//! Relational schema.
//!
//! All ids are uuid strings, money is integer minor units, timestamps are
//! RFC 3339 UTC text. Booleans are stored as 0/1 integers.

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stores (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            upi_vpa TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            scan_lookup_v2_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pos_devices (
            id TEXT PRIMARY KEY,
            store_id TEXT REFERENCES stores(id),
            device_token TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            label TEXT,
            device_type TEXT,
            printing_mode TEXT,
            last_seen_online TEXT,
            last_sync_at TEXT,
            pending_outbox_count INTEGER NOT NULL DEFAULT 0,
            app_version TEXT,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_pos_devices_token
            ON pos_devices(device_token) WHERE device_token IS NOT NULL;

        CREATE TABLE IF NOT EXISTS device_enrollment_codes (
            code TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id),
            expires_at TEXT NOT NULL,
            used_at TEXT
        );",
    )
    .context("init store/device tables")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS global_products (
            id TEXT PRIMARY KEY,
            global_name TEXT NOT NULL,
            category TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS global_product_identifiers (
            id TEXT PRIMARY KEY,
            global_product_id TEXT NOT NULL REFERENCES global_products(id),
            code_type TEXT NOT NULL,
            raw_value TEXT NOT NULL,
            normalized_value TEXT NOT NULL,
            UNIQUE(code_type, normalized_value)
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            global_product_id TEXT UNIQUE REFERENCES global_products(id),
            name TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'INR',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS variants (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL REFERENCES products(id),
            name TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'INR',
            unit_base TEXT,
            size_base INTEGER,
            UNIQUE(product_id, unit_base, size_base)
        );

        CREATE TABLE IF NOT EXISTS barcodes (
            barcode TEXT PRIMARY KEY,
            variant_id TEXT NOT NULL REFERENCES variants(id),
            barcode_type TEXT NOT NULL CHECK (barcode_type IN ('supermandi', 'manufacturer')),
            UNIQUE(variant_id, barcode_type)
        );

        CREATE TABLE IF NOT EXISTS store_products (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id),
            global_product_id TEXT NOT NULL REFERENCES global_products(id),
            store_display_name TEXT,
            sell_price_minor INTEGER,
            purchase_price_minor INTEGER,
            unit TEXT,
            variant TEXT,
            currency TEXT NOT NULL DEFAULT 'INR',
            UNIQUE(store_id, global_product_id)
        );

        CREATE TABLE IF NOT EXISTS retailer_variants (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id),
            variant_id TEXT NOT NULL REFERENCES variants(id),
            selling_price_minor INTEGER,
            price_updated_at TEXT,
            UNIQUE(store_id, variant_id)
        );",
    )
    .context("init catalog tables")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_inventory (
            store_id TEXT NOT NULL REFERENCES stores(id),
            global_product_id TEXT NOT NULL REFERENCES global_products(id),
            available_qty INTEGER NOT NULL DEFAULT 0 CHECK (available_qty >= 0),
            PRIMARY KEY (store_id, global_product_id)
        );

        CREATE TABLE IF NOT EXISTS bulk_inventory (
            store_id TEXT NOT NULL REFERENCES stores(id),
            product_id TEXT NOT NULL REFERENCES products(id),
            base_unit TEXT NOT NULL,
            quantity_base INTEGER NOT NULL DEFAULT 0 CHECK (quantity_base >= 0),
            PRIMARY KEY (store_id, product_id)
        );

        CREATE TABLE IF NOT EXISTS inventory_ledger (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            global_product_id TEXT NOT NULL,
            movement_type TEXT NOT NULL CHECK (movement_type IN ('RECEIVE', 'SELL', 'ADJUSTMENT')),
            quantity INTEGER NOT NULL,
            unit_cost_minor INTEGER,
            unit_sell_minor INTEGER,
            reason TEXT,
            reference_type TEXT,
            reference_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_store_product
            ON inventory_ledger(store_id, global_product_id);",
    )
    .context("init inventory tables")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id),
            device_id TEXT,
            bill_ref TEXT NOT NULL UNIQUE,
            offline_receipt_ref TEXT,
            subtotal_minor INTEGER NOT NULL,
            discount_minor INTEGER NOT NULL DEFAULT 0,
            total_minor INTEGER NOT NULL CHECK (total_minor >= 0),
            currency TEXT NOT NULL DEFAULT 'INR',
            status TEXT NOT NULL CHECK (status IN ('PENDING', 'PAID_CASH', 'PAID_UPI', 'DUE', 'CANCELLED', 'CREATED')),
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sales_offline_receipt
            ON sales(store_id, offline_receipt_ref) WHERE offline_receipt_ref IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_sales_store_created
            ON sales(store_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS sale_items (
            id TEXT PRIMARY KEY,
            sale_id TEXT NOT NULL REFERENCES sales(id),
            variant_id TEXT NOT NULL REFERENCES variants(id),
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            price_minor INTEGER NOT NULL CHECK (price_minor > 0),
            line_total_minor INTEGER NOT NULL,
            item_name TEXT NOT NULL,
            barcode TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sale_items_sale ON sale_items(sale_id);

        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            sale_id TEXT REFERENCES sales(id),
            mode TEXT NOT NULL CHECK (mode IN ('CASH', 'UPI', 'DUE')),
            status TEXT NOT NULL CHECK (status IN ('PENDING', 'PAID', 'DUE')),
            amount_minor INTEGER NOT NULL,
            provider_ref TEXT,
            confirmed_at TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payments_sale ON payments(sale_id);
        CREATE INDEX IF NOT EXISTS idx_payments_created ON payments(created_at DESC);

        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id),
            device_id TEXT,
            amount_minor INTEGER NOT NULL,
            mode TEXT NOT NULL,
            reference TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_collections_created ON collections(created_at DESC);

        CREATE TABLE IF NOT EXISTS purchases (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id),
            supplier_name TEXT,
            total_minor INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'INR',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS purchase_items (
            id TEXT PRIMARY KEY,
            purchase_id TEXT NOT NULL REFERENCES purchases(id),
            product_id TEXT NOT NULL REFERENCES products(id),
            variant_id TEXT REFERENCES variants(id),
            quantity INTEGER NOT NULL,
            unit TEXT,
            quantity_base INTEGER,
            unit_cost_minor INTEGER NOT NULL,
            line_total_minor INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_purchase_items_purchase ON purchase_items(purchase_id);",
    )
    .context("init sale/purchase tables")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS processed_events (
            event_id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            store_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            received_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scan_events (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            device_id TEXT,
            scan_value TEXT NOT NULL,
            mode TEXT NOT NULL CHECK (mode IN ('SELL', 'DIGITISE')),
            action TEXT NOT NULL,
            variant_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scan_events_dedup
            ON scan_events(store_id, mode, scan_value, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_scan_events_created ON scan_events(created_at DESC);

        CREATE TABLE IF NOT EXISTS pos_events (
            id TEXT PRIMARY KEY,
            store_id TEXT,
            device_id TEXT,
            event_type TEXT,
            payload TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pos_events_created ON pos_events(created_at DESC);",
    )
    .context("init sync/telemetry tables")?;

    Ok(())
}
