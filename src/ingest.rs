use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::{
    feed::{self, FeedRecord},
    fetcher::Fetcher,
    models::{AppState, Merchant, SyncResult},
};

/// Products written per transaction, to cap memory on large feeds.
const UPSERT_BATCH: usize = 500;

/* =========================
 * Scheduler
 * ========================= */

/// Background loop: refresh every enabled merchant, then sleep.
/// The first round runs immediately at startup.
pub fn spawn_scheduler(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(state.config.feed_refresh_hours.max(1) * 3600);
        loop {
            let results = process_all_feeds(&state).await;
            let failed = results.iter().filter(|r| r.error.is_some()).count();
            tracing::info!(
                merchants = results.len(),
                failed,
                "feed refresh round complete"
            );
            tokio::time::sleep(interval).await;
        }
    })
}

/// Run one sync round over all enabled merchants, bounded by the configured
/// concurrency. Also the entry point for the manual admin trigger.
pub async fn process_all_feeds(state: &AppState) -> Vec<SyncResult> {
    let merchants: Vec<Merchant> =
        match sqlx::query_as("SELECT * FROM merchants WHERE enabled = 1 ORDER BY id")
            .fetch_all(&state.pool)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("failed to load merchants for sync round: {e}");
                return Vec::new();
            }
        };

    let cap = state.config.sync_concurrency.max(1);
    let mut results = Vec::with_capacity(merchants.len());

    for chunk in merchants.chunks(cap) {
        let mut set = JoinSet::new();
        for merchant in chunk {
            set.spawn(sync_merchant(state.clone(), merchant.clone()));
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("merchant sync task panicked: {e}"),
            }
        }
    }

    results.sort_by_key(|r| r.merchant_id);
    results
}

/* =========================
 * Per-merchant sync
 * ========================= */

/// Sync one merchant. Overlapping syncs for the same merchant are rejected,
/// not queued; the second caller gets an error result and the merchant row is
/// left untouched.
pub async fn sync_merchant(state: AppState, merchant: Merchant) -> SyncResult {
    {
        let mut in_flight = state.sync_guard.lock().await;
        if !in_flight.insert(merchant.id) {
            tracing::warn!(merchant = %merchant.name, "sync already running, rejecting");
            return SyncResult {
                merchant_id: merchant.id,
                merchant_name: merchant.name.clone(),
                error: Some("sync already running".into()),
                ..Default::default()
            };
        }
    }

    let result = run_sync(&state, &merchant).await;
    state.sync_guard.lock().await.remove(&merchant.id);
    result
}

async fn run_sync(state: &AppState, merchant: &Merchant) -> SyncResult {
    let mut result = SyncResult {
        merchant_id: merchant.id,
        merchant_name: merchant.name.clone(),
        ..Default::default()
    };

    if let Err(e) =
        sqlx::query("UPDATE merchants SET sync_status = 'running', updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(merchant.id)
            .execute(&state.pool)
            .await
    {
        result.error = Some(format!("failed to mark sync running: {e}"));
        return result;
    }

    match import_feed(state, merchant, &mut result).await {
        Ok(total_products) => {
            tracing::info!(
                merchant = %merchant.name,
                parsed = result.parsed,
                inserted = result.inserted,
                updated = result.updated,
                skipped = result.skipped,
                "feed sync ok"
            );
            let _ = sqlx::query(
                r#"
                UPDATE merchants
                   SET sync_status = 'ok',
                       last_sync_at = CURRENT_TIMESTAMP,
                       last_error = NULL,
                       total_products = ?,
                       updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?
                "#,
            )
            .bind(total_products)
            .bind(merchant.id)
            .execute(&state.pool)
            .await;
        }
        Err(e) => {
            // previously imported products stay untouched
            tracing::error!(merchant = %merchant.name, "feed sync failed: {e:#}");
            result.error = Some(format!("{e:#}"));
            let _ = sqlx::query(
                r#"
                UPDATE merchants
                   SET sync_status = 'error',
                       last_error = ?,
                       updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?
                "#,
            )
            .bind(format!("{e:#}"))
            .bind(merchant.id)
            .execute(&state.pool)
            .await;
        }
    }

    result
}

/// Fetch, parse and upsert one merchant feed. Returns the merchant's product
/// count after the import.
async fn import_feed(
    state: &AppState,
    merchant: &Merchant,
    result: &mut SyncResult,
) -> anyhow::Result<i64> {
    let fetcher = Fetcher::new(
        state.http.clone(),
        state.config.cache_dir.clone(),
        Duration::from_secs(state.config.cache_ttl_secs),
        Duration::from_secs(state.config.fetch_timeout_secs),
    )?;

    let (body, source) = fetcher.get(&merchant.feed_url).await?;
    tracing::debug!(merchant = %merchant.name, ?source, "feed body retrieved");

    let parsed = feed::parse_feed(&body);
    result.fetched = parsed.records.len() as u64 + parsed.skipped;
    result.parsed = parsed.records.len() as u64;
    result.skipped = parsed.skipped;

    if parsed.records.is_empty() && parsed.skipped == 0 {
        anyhow::bail!("feed contained no product records");
    }

    let before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE merchant_id = ?")
        .bind(merchant.id)
        .fetch_one(&state.pool)
        .await?;

    // rows untouched after this moment were absent from the feed
    let started_at: String = sqlx::query_scalar("SELECT datetime(CURRENT_TIMESTAMP)")
        .fetch_one(&state.pool)
        .await?;

    let mut brand_cache: HashMap<String, i64> = HashMap::new();
    let mut category_cache: HashMap<String, i64> = HashMap::new();

    for batch in parsed.records.chunks(UPSERT_BATCH) {
        let mut tx = state.pool.begin().await?;
        for record in batch {
            upsert_record(
                &mut tx,
                merchant.id,
                record,
                &mut brand_cache,
                &mut category_cache,
            )
            .await?;
        }
        tx.commit().await?;
    }

    let after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE merchant_id = ?")
        .bind(merchant.id)
        .fetch_one(&state.pool)
        .await?;

    result.inserted = (after - before).max(0) as u64;
    result.updated = result.parsed.saturating_sub(result.inserted);

    // products no longer present in the feed become unavailable, never deleted
    let vanished = sqlx::query(
        r#"
        UPDATE products
           SET availability = 0, updated_at = CURRENT_TIMESTAMP
         WHERE merchant_id = ? AND updated_at < ?
        "#,
    )
    .bind(merchant.id)
    .bind(&started_at)
    .execute(&state.pool)
    .await?
    .rows_affected();
    if vanished > 0 {
        tracing::info!(merchant = %merchant.name, vanished, "marked vanished products unavailable");
    }

    Ok(after)
}

async fn upsert_record(
    tx: &mut Transaction<'_, Sqlite>,
    merchant_id: i64,
    record: &FeedRecord,
    brand_cache: &mut HashMap<String, i64>,
    category_cache: &mut HashMap<String, i64>,
) -> anyhow::Result<()> {
    let brand_id = match &record.brand {
        Some(name) => get_or_create_brand(tx, brand_cache, name).await?,
        None => None,
    };
    let category_id = match &record.category {
        Some(leaf) => {
            get_or_create_category(tx, category_cache, leaf, &record.category_path).await?
        }
        None => None,
    };

    let additional_images = serde_json::to_string(&record.additional_images)?;
    let specifications = serde_json::to_string(&record.specifications)?;

    let product_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO products (
            merchant_id, merchant_product_code, title, description, ean, mpn, sku,
            price, original_price, discount_pct, availability, stock_qty,
            image_url, additional_images, product_url, specifications, search_text,
            brand_id, category_id, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, json(?), ?, json(?), ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        ON CONFLICT (merchant_id, merchant_product_code) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            ean = excluded.ean,
            mpn = excluded.mpn,
            sku = excluded.sku,
            price = excluded.price,
            original_price = excluded.original_price,
            discount_pct = excluded.discount_pct,
            availability = excluded.availability,
            stock_qty = excluded.stock_qty,
            image_url = excluded.image_url,
            additional_images = excluded.additional_images,
            product_url = excluded.product_url,
            specifications = excluded.specifications,
            search_text = excluded.search_text,
            brand_id = excluded.brand_id,
            category_id = excluded.category_id,
            updated_at = CURRENT_TIMESTAMP
        RETURNING id
        "#,
    )
    .bind(merchant_id)
    .bind(&record.merchant_product_code)
    .bind(&record.title)
    .bind(&record.description)
    .bind(&record.ean)
    .bind(&record.mpn)
    .bind(&record.sku)
    .bind(record.price)
    .bind(record.original_price)
    .bind(record.discount_pct)
    .bind(i64::from(record.availability))
    .bind(record.stock_qty)
    .bind(&record.image_url)
    .bind(additional_images)
    .bind(&record.product_url)
    .bind(specifications)
    .bind(&record.search_text)
    .bind(brand_id)
    .bind(category_id)
    .fetch_one(&mut **tx)
    .await?;

    if record.color.is_some() || record.size.is_some() {
        let variant_key = format!(
            "{}|{}",
            record.color.as_deref().unwrap_or(""),
            record.size.as_deref().unwrap_or("")
        )
        .to_lowercase();
        sqlx::query(
            r#"
            INSERT INTO product_variants (product_id, variant_key, color, size, stock_qty)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (product_id, variant_key) DO UPDATE SET
                color = excluded.color,
                size = excluded.size,
                stock_qty = excluded.stock_qty
            "#,
        )
        .bind(product_id)
        .bind(variant_key)
        .bind(&record.color)
        .bind(&record.size)
        .bind(record.stock_qty)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn get_or_create_brand(
    tx: &mut Transaction<'_, Sqlite>,
    cache: &mut HashMap<String, i64>,
    name: &str,
) -> anyhow::Result<Option<i64>> {
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() {
        return Ok(None);
    }
    if let Some(id) = cache.get(&normalized) {
        return Ok(Some(*id));
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO brands (name, normalized_name)
        VALUES (?, ?)
        ON CONFLICT (normalized_name) DO UPDATE SET name = excluded.name
        RETURNING id
        "#,
    )
    .bind(name.trim())
    .bind(&normalized)
    .fetch_one(&mut **tx)
    .await?;

    cache.insert(normalized, id);
    Ok(Some(id))
}

async fn get_or_create_category(
    tx: &mut Transaction<'_, Sqlite>,
    cache: &mut HashMap<String, i64>,
    leaf: &str,
    path: &[String],
) -> anyhow::Result<Option<i64>> {
    let normalized = leaf.trim().to_lowercase();
    if normalized.is_empty() {
        return Ok(None);
    }
    let path_str = path.join(" > ");
    let cache_key = format!("{normalized}\u{1f}{path_str}");
    if let Some(id) = cache.get(&cache_key) {
        return Ok(Some(*id));
    }

    let level = path.len().saturating_sub(1) as i64;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO categories (name, normalized_name, path, level)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (normalized_name, path) DO UPDATE SET name = excluded.name
        RETURNING id
        "#,
    )
    .bind(leaf.trim())
    .bind(&normalized)
    .bind(&path_str)
    .bind(level)
    .fetch_one(&mut **tx)
    .await?;

    cache.insert(cache_key, id);
    Ok(Some(id))
}
