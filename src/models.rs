use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::{config::Config, rewriter::QueryRewriter};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub http: reqwest::Client,
    pub rewriter: Arc<QueryRewriter>,
    /// Merchant ids with a sync currently in flight.
    pub sync_guard: Arc<tokio::sync::Mutex<HashSet<i64>>>,
    pub config: Config,
}

/* ---------- Merchants ---------- */

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct Merchant {
    pub id: i64,
    pub name: String,
    pub feed_url: String,
    pub enabled: i64, // 0/1
    pub last_sync_at: Option<String>,
    pub sync_status: String, // pending | running | ok | error
    pub last_error: Option<String>,
    pub total_products: i64,
    pub created_at: String, // SQLite CURRENT_TIMESTAMP (UTC) as string
    pub updated_at: String,
}

#[derive(Deserialize, Debug)]
pub struct NewMerchant {
    pub name: String,
    pub feed_url: String,
}

/* ---------- Products ---------- */

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Product {
    pub id: i64,
    pub merchant_id: i64,
    pub merchant_product_code: String,
    pub title: String,
    pub description: Option<String>,
    pub ean: Option<String>,
    pub mpn: Option<String>,
    pub sku: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_pct: Option<f64>,
    pub availability: bool,
    pub stock_qty: Option<i64>,
    pub image_url: Option<String>,
    pub additional_images: Vec<String>,
    pub product_url: Option<String>,
    pub specifications: BTreeMap<String, String>,
    pub brand_id: Option<i64>,
    pub category_id: Option<i64>,
    pub merchant_name: Option<String>,
    pub brand_name: Option<String>,
    pub category_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/* ---------- DB row model ---------- */

#[derive(FromRow)]
pub struct ProductRow {
    pub id: i64,
    pub merchant_id: i64,
    pub merchant_product_code: String,
    pub title: String,
    pub description: Option<String>,
    pub ean: Option<String>,
    pub mpn: Option<String>,
    pub sku: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_pct: Option<f64>,
    pub availability: i64,
    pub stock_qty: Option<i64>,
    pub image_url: Option<String>,
    // store JSON arrays/objects as TEXT; sqlx Json<T> maps them for us
    pub additional_images: Json<Vec<String>>,
    pub specifications: Json<BTreeMap<String, String>>,
    pub product_url: Option<String>,
    pub brand_id: Option<i64>,
    pub category_id: Option<i64>,
    pub merchant_name: Option<String>,
    pub brand_name: Option<String>,
    pub category_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<ProductRow> for Product {
    fn from(r: ProductRow) -> Self {
        Self {
            id: r.id,
            merchant_id: r.merchant_id,
            merchant_product_code: r.merchant_product_code,
            title: r.title,
            description: r.description,
            ean: r.ean,
            mpn: r.mpn,
            sku: r.sku,
            price: r.price,
            original_price: r.original_price,
            discount_pct: r.discount_pct,
            availability: r.availability != 0,
            stock_qty: r.stock_qty,
            image_url: r.image_url,
            additional_images: r.additional_images.0,
            product_url: r.product_url,
            specifications: r.specifications.0,
            brand_id: r.brand_id,
            category_id: r.category_id,
            merchant_name: r.merchant_name,
            brand_name: r.brand_name,
            category_name: r.category_name,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/* ---------- Sync reporting ---------- */

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SyncResult {
    pub merchant_id: i64,
    pub merchant_name: String,
    pub fetched: u64,
    pub parsed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub error: Option<String>,
}
