use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::{
    feed::normalize_key_text,
    models::{AppState, Product, ProductRow},
    rewriter::RewrittenQuery,
};

/// Keep SELECT columns in one place to avoid drift with `ProductRow`.
pub const PRODUCT_COLS: &str = r#"
    p.id, p.merchant_id, p.merchant_product_code, p.title, p.description,
    p.ean, p.mpn, p.sku,
    p.price, p.original_price, p.discount_pct, p.availability, p.stock_qty,
    p.image_url, p.additional_images, p.product_url, p.specifications,
    p.brand_id, p.category_id,
    m.name AS merchant_name, b.name AS brand_name, c.name AS category_name,
    p.created_at, p.updated_at
"#;

const PRODUCT_JOINS: &str = r#"
    FROM products p
    JOIN merchants m ON p.merchant_id = m.id
    LEFT JOIN brands b ON p.brand_id = b.id
    LEFT JOIN categories c ON p.category_id = c.id
"#;

/* =========================
 * Filters & modes
 * ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sort {
    #[default]
    Relevance,
    PriceAsc,
    PriceDesc,
    Availability,
    Newest,
}

impl Sort {
    /// Unknown sort strings fall back to relevance.
    pub fn parse(s: Option<&str>) -> Self {
        match s.unwrap_or("relevance") {
            "price_asc" => Self::PriceAsc,
            "price_desc" => Self::PriceDesc,
            "availability" => Self::Availability,
            "newest" => Self::Newest,
            _ => Self::Relevance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// One result per listing.
    Flat,
    /// One result per logical product, collapsed across shops.
    Aggregated,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub title: Option<String>,
    pub brand: Option<String>,
    pub brands: Vec<String>,
    pub category: Option<String>,
    pub categories: Vec<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub availability: Option<bool>,
    pub ean: Option<String>,
    pub mpn: Option<String>,
    pub shops: Vec<String>,
    pub sort: Sort,
}

/* =========================
 * Response types
 * ========================= */

#[derive(Serialize, Clone, Debug)]
pub struct ProductGroup {
    /// Representative product id (lowest member id).
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub avg_price: Option<f64>,
    pub best_available_price: Option<f64>,
    pub shop_count: u32,
    pub available_shops: u32,
    pub shop_names: Vec<String>,
    pub availability: bool,
    pub price_range: String,
    pub brand_name: Option<String>,
    pub category_name: Option<String>,
    pub last_updated: String,
    pub product_ids: Vec<i64>,
    pub relevance_score: i64,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum SearchHit {
    Group(Box<ProductGroup>),
    Listing(Box<Product>),
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub products: Vec<SearchHit>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
    pub execution_time_ms: f64,
    pub search_type: &'static str,
    pub category_distribution: Vec<CategoryBucket>,
}

#[derive(Serialize, sqlx::FromRow, Clone, Debug)]
pub struct CategoryBucket {
    pub category_id: i64,
    pub category_name: String,
    pub count: i64,
    pub representative_image: Option<String>,
}

/* =========================
 * Entry point
 * ========================= */

/// Execute a search. Always returns a well-formed response: store failures
/// degrade to an empty page flagged `search_type = "fallback"`.
pub async fn search(
    state: &AppState,
    filters: &SearchFilters,
    mode: SearchMode,
    page: u32,
    per_page: u32,
) -> SearchResponse {
    let started = Instant::now();
    let page = page.max(1);
    let per_page = per_page.clamp(1, 100);

    let rewritten = match filters.title.as_deref() {
        Some(t) if !t.trim().is_empty() => Some(state.rewriter.rewrite(t).await),
        _ => None,
    };

    match run_search(&state.pool, filters, rewritten.as_ref(), mode, page, per_page).await {
        Ok(mut resp) => {
            let query_text = rewritten
                .as_ref()
                .map(|r| r.corrected_query.trim())
                .unwrap_or_default();
            if query_text.chars().count() >= 2 {
                // best-effort: never fails the search response
                resp.category_distribution =
                    match category_distribution(&state.pool, query_text, 10).await {
                        Ok(buckets) => buckets,
                        Err(e) => {
                            tracing::warn!("category distribution failed: {e:#}");
                            Vec::new()
                        }
                    };
            }
            resp.execution_time_ms = elapsed_ms(started);
            resp
        }
        Err(e) => {
            tracing::error!("search failed, serving fallback response: {e:#}");
            SearchResponse {
                products: Vec::new(),
                total: 0,
                page,
                per_page,
                total_pages: 0,
                execution_time_ms: elapsed_ms(started),
                search_type: "fallback",
                category_distribution: Vec::new(),
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0
}

async fn run_search(
    pool: &SqlitePool,
    filters: &SearchFilters,
    rewritten: Option<&RewrittenQuery>,
    mode: SearchMode,
    page: u32,
    per_page: u32,
) -> anyhow::Result<SearchResponse> {
    let rows = fetch_candidates(pool, filters, rewritten).await?;
    let query_text = rewritten
        .map(|r| r.corrected_query.trim().to_lowercase())
        .unwrap_or_default();

    let (products, total, search_type) = match mode {
        SearchMode::Aggregated => {
            let mut groups = aggregate(rows);
            for group in &mut groups {
                group.relevance_score = relevance_score(&group.title, &query_text);
            }
            groups.sort_by(|a, b| compare(&group_order_key(a), &group_order_key(b), filters.sort));
            let total = groups.len() as u64;
            let hits = paginate(groups, page, per_page)
                .map(|g| SearchHit::Group(Box::new(g)))
                .collect();
            (hits, total, "aggregated")
        }
        SearchMode::Flat => {
            let mut listings: Vec<(Product, OrderKey)> = rows
                .into_iter()
                .map(Product::from)
                .map(|p| {
                    let key = listing_order_key(&p, &query_text);
                    (p, key)
                })
                .collect();
            listings.sort_by(|a, b| compare(&a.1, &b.1, filters.sort));
            let total = listings.len() as u64;
            let hits = paginate(listings, page, per_page)
                .map(|(p, _)| SearchHit::Listing(Box::new(p)))
                .collect();
            (hits, total, "flat")
        }
    };

    Ok(SearchResponse {
        products,
        total,
        page,
        per_page,
        total_pages: total.div_ceil(u64::from(per_page)),
        execution_time_ms: 0.0,
        search_type,
        category_distribution: Vec::new(),
    })
}

fn paginate<T>(items: Vec<T>, page: u32, per_page: u32) -> impl Iterator<Item = T> {
    items
        .into_iter()
        .skip((page as usize - 1) * per_page as usize)
        .take(per_page as usize)
}

/* =========================
 * Candidate selection
 * ========================= */

async fn fetch_candidates(
    pool: &SqlitePool,
    filters: &SearchFilters,
    rewritten: Option<&RewrittenQuery>,
) -> anyhow::Result<Vec<ProductRow>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {PRODUCT_COLS} {PRODUCT_JOINS} WHERE 1=1"
    ));

    if let Some(r) = rewritten {
        let c = &r.components;
        // brand/category tokens also probe the title, since feeds routinely
        // carry the brand only in the product name
        if !c.brands.is_empty() {
            qb.push(" AND (");
            for (i, brand) in c.brands.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                let pattern = format!("%{}%", brand.to_lowercase());
                qb.push("LOWER(COALESCE(b.name, '')) LIKE ");
                qb.push_bind(pattern.clone());
                qb.push(" OR LOWER(p.title) LIKE ");
                qb.push_bind(pattern);
            }
            qb.push(")");
        }
        if !c.categories.is_empty() {
            qb.push(" AND (");
            for (i, category) in c.categories.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                let pattern = format!("%{}%", category.to_lowercase());
                qb.push("LOWER(COALESCE(c.name, '')) LIKE ");
                qb.push_bind(pattern.clone());
                qb.push(" OR LOWER(p.title) LIKE ");
                qb.push_bind(pattern);
            }
            qb.push(")");
        }
        if !c.product_terms.is_empty() {
            qb.push(" AND (");
            for (i, term) in c.product_terms.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                let pattern = format!("%{}%", term.to_lowercase());
                qb.push("LOWER(p.title) LIKE ");
                qb.push_bind(pattern.clone());
                qb.push(" OR LOWER(p.search_text) LIKE ");
                qb.push_bind(pattern);
            }
            qb.push(")");
        }
        // nothing extracted: plain substring match on the corrected query
        if c.brands.is_empty() && c.categories.is_empty() && c.product_terms.is_empty() {
            let phrase = r.corrected_query.trim().to_lowercase();
            if !phrase.is_empty() {
                qb.push(" AND LOWER(p.title) LIKE ");
                qb.push_bind(format!("%{phrase}%"));
            }
        }
    }

    if let Some(brand) = filters.brand.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND LOWER(COALESCE(b.name, '')) = ");
        qb.push_bind(brand.trim().to_lowercase());
    }
    push_any_of(&mut qb, "b.name", &filters.brands);

    if let Some(category) = filters.category.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND LOWER(COALESCE(c.name, '')) = ");
        qb.push_bind(category.trim().to_lowercase());
    }
    push_any_of(&mut qb, "c.name", &filters.categories);

    if let Some(min_price) = filters.min_price {
        qb.push(" AND p.price >= ");
        qb.push_bind(min_price);
    }
    if let Some(max_price) = filters.max_price {
        qb.push(" AND p.price <= ");
        qb.push_bind(max_price);
    }
    if let Some(ean) = filters.ean.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND p.ean = ");
        qb.push_bind(ean.trim().to_string());
    }
    if let Some(mpn) = filters.mpn.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND p.mpn = ");
        qb.push_bind(mpn.trim().to_string());
    }
    if let Some(availability) = filters.availability {
        qb.push(" AND p.availability = ");
        qb.push_bind(i64::from(availability));
    }
    push_any_of(&mut qb, "m.name", &filters.shops);

    let rows = qb.build_query_as::<ProductRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// `AND column IN (...)`, skipping blank entries. An all-blank list applies
/// no restriction at all.
fn push_any_of(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String]) {
    let valid: Vec<&str> = values
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if valid.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    for (i, value) in valid.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push_bind(value.to_string());
    }
    qb.push(")");
}

/* =========================
 * Grouping
 * ========================= */

/// Cross-shop grouping key: ean, else mpn, else normalized title.
pub fn group_key(ean: Option<&str>, mpn: Option<&str>, title: &str) -> String {
    if let Some(e) = ean.map(str::trim).filter(|e| !e.is_empty()) {
        return format!("ean:{e}");
    }
    if let Some(m) = mpn.map(str::trim).filter(|m| !m.is_empty()) {
        return format!("mpn:{m}");
    }
    format!("title:{}", normalize_key_text(title))
}

fn aggregate(rows: Vec<ProductRow>) -> Vec<ProductGroup> {
    // brand and category qualify the key to guard against title collisions
    let mut buckets: HashMap<(String, Option<i64>, Option<i64>), Vec<ProductRow>> = HashMap::new();
    for row in rows {
        let key = (
            group_key(row.ean.as_deref(), row.mpn.as_deref(), &row.title),
            row.brand_id,
            row.category_id,
        );
        buckets.entry(key).or_default().push(row);
    }

    let mut groups: Vec<ProductGroup> = buckets.into_values().map(build_group).collect();
    groups.sort_by_key(|g| g.id);
    groups
}

fn build_group(mut members: Vec<ProductRow>) -> ProductGroup {
    members.sort_by_key(|m| m.id);

    let prices: Vec<f64> = members.iter().filter_map(|m| m.price).collect();
    let min_price = prices.iter().copied().reduce(f64::min);
    let max_price = prices.iter().copied().reduce(f64::max);
    let avg_price = if prices.is_empty() {
        None
    } else {
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    };
    let best_available_price = members
        .iter()
        .filter(|m| m.availability != 0)
        .filter_map(|m| m.price)
        .reduce(f64::min);

    let shop_names: BTreeSet<String> = members
        .iter()
        .map(|m| m.merchant_name.clone().unwrap_or_default())
        .filter(|n| !n.is_empty())
        .collect();
    let available_shops: BTreeSet<&str> = members
        .iter()
        .filter(|m| m.availability != 0)
        .filter_map(|m| m.merchant_name.as_deref())
        .collect();

    let title = most_frequent(members.iter().map(|m| m.title.as_str()))
        .unwrap_or_default()
        .to_string();
    let description = most_frequent(members.iter().filter_map(|m| m.description.as_deref()))
        .map(str::to_string);
    let image_url = members
        .iter()
        .find_map(|m| m.image_url.as_deref().filter(|u| !u.is_empty()))
        .map(str::to_string);

    let brand_name = members.iter().find_map(|m| m.brand_name.clone());
    let category_name = members.iter().find_map(|m| m.category_name.clone());
    let last_updated = members
        .iter()
        .map(|m| m.updated_at.as_str())
        .max()
        .unwrap_or_default()
        .to_string();

    let price_range = match (min_price, max_price) {
        (Some(lo), Some(hi)) if lo < hi => format!("€{lo:.2} - €{hi:.2}"),
        (Some(lo), _) => format!("€{lo:.2}"),
        _ => String::new(),
    };

    ProductGroup {
        id: members.first().map_or(0, |m| m.id),
        title,
        description,
        image_url,
        min_price,
        max_price,
        avg_price,
        best_available_price,
        shop_count: shop_names.len() as u32,
        available_shops: available_shops.len() as u32,
        shop_names: shop_names.into_iter().collect(),
        availability: members.iter().any(|m| m.availability != 0),
        price_range,
        brand_name,
        category_name,
        last_updated,
        product_ids: members.iter().map(|m| m.id).collect(),
        relevance_score: 0,
    }
}

/// Most frequent value; ties break to the lexicographically smallest.
fn most_frequent<'a>(values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a_val, a_n), (b_val, b_n)| a_n.cmp(b_n).then(b_val.cmp(a_val)))
        .map(|(v, _)| v)
}

/* =========================
 * Ranking
 * ========================= */

/// Relevance score against the normalized query: phrase match, word-order
/// bonus, and position bonus, summed.
pub fn relevance_score(title: &str, query: &str) -> i64 {
    let phrase = query.trim().to_lowercase();
    if phrase.is_empty() {
        return 0;
    }
    let t = title.to_lowercase();
    let terms: Vec<&str> = phrase.split_whitespace().take(5).collect();

    let mut score = if t.contains(&phrase) {
        100
    } else if t.starts_with(&phrase) {
        80
    } else {
        20 * terms.iter().filter(|w| t.contains(*w)).count() as i64
    };

    score += if pair_in_order(&t, terms.first(), terms.get(1)) {
        30
    } else if pair_in_order(&t, terms.get(1), terms.get(2)) {
        20
    } else if pair_in_order(&t, terms.get(2), terms.get(3)) {
        10
    } else {
        0
    };

    score += if starts_with_term(&t, terms.first()) {
        15
    } else if starts_with_term(&t, terms.get(1)) {
        10
    } else if starts_with_term(&t, terms.get(2)) {
        5
    } else {
        0
    };

    score
}

fn pair_in_order(title: &str, a: Option<&&str>, b: Option<&&str>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    title
        .find(*a)
        .is_some_and(|i| title[i + a.len()..].contains(*b))
}

fn starts_with_term(title: &str, term: Option<&&str>) -> bool {
    term.is_some_and(|t| title.starts_with(*t))
}

/* =========================
 * Ordering
 * ========================= */

struct OrderKey {
    score: i64,
    availability_ratio: f64,
    available: bool,
    price: Option<f64>,
    shop_count: u32,
    updated: String,
}

fn group_order_key(g: &ProductGroup) -> OrderKey {
    OrderKey {
        score: g.relevance_score,
        availability_ratio: f64::from(g.available_shops) / f64::from(g.shop_count.max(1)),
        available: g.availability,
        price: g.min_price,
        shop_count: g.shop_count,
        updated: g.last_updated.clone(),
    }
}

fn listing_order_key(p: &Product, query: &str) -> OrderKey {
    OrderKey {
        score: relevance_score(&p.title, query),
        availability_ratio: if p.availability { 1.0 } else { 0.0 },
        available: p.availability,
        price: p.price,
        shop_count: 1,
        updated: p.updated_at.clone(),
    }
}

fn compare(a: &OrderKey, b: &OrderKey, sort: Sort) -> Ordering {
    match sort {
        Sort::Relevance => b
            .score
            .cmp(&a.score)
            .then_with(|| cmp_f64_desc(a.availability_ratio, b.availability_ratio))
            .then_with(|| cmp_price_asc(a.price, b.price))
            .then_with(|| b.shop_count.cmp(&a.shop_count)),
        Sort::PriceAsc => cmp_price_asc(a.price, b.price)
            .then_with(|| b.available.cmp(&a.available)),
        Sort::PriceDesc => cmp_price_asc(b.price, a.price)
            .then_with(|| b.available.cmp(&a.available)),
        Sort::Availability => cmp_f64_desc(a.availability_ratio, b.availability_ratio)
            .then_with(|| cmp_price_asc(a.price, b.price)),
        Sort::Newest => b
            .updated
            .cmp(&a.updated)
            .then_with(|| b.available.cmp(&a.available))
            .then_with(|| cmp_price_asc(a.price, b.price)),
    }
}

/// Ascending on price; missing prices sort last.
fn cmp_price_asc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn cmp_f64_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/* =========================
 * Category distribution & category search
 * ========================= */

pub async fn category_distribution(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> anyhow::Result<Vec<CategoryBucket>> {
    let pattern = format!("%{}%", query.trim().to_lowercase());
    let buckets = sqlx::query_as::<_, CategoryBucket>(
        r#"
        SELECT c.id AS category_id,
               c.name AS category_name,
               COUNT(p.id) AS count,
               (SELECT p2.image_url
                  FROM products p2
                 WHERE p2.category_id = c.id
                   AND p2.image_url IS NOT NULL
                   AND p2.image_url != ''
                   AND LOWER(p2.title) LIKE ?1
                 ORDER BY p2.id
                 LIMIT 1) AS representative_image
          FROM categories c
          JOIN products p ON p.category_id = c.id
         WHERE LOWER(p.title) LIKE ?1
         GROUP BY c.id, c.name
         ORDER BY COUNT(p.id) DESC
         LIMIT ?2
        "#,
    )
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(buckets)
}

#[derive(Serialize, sqlx::FromRow, Clone, Debug)]
pub struct CategoryMatch {
    pub id: i64,
    pub name: String,
    pub product_count: i64,
}

/// Category name search for `type=categories`. Degrades to empty on error.
pub async fn search_categories(pool: &SqlitePool, query: &str, limit: i64) -> Vec<CategoryMatch> {
    if query.trim().chars().count() < 2 {
        return Vec::new();
    }
    let pattern = format!("%{}%", query.trim().to_lowercase());
    match sqlx::query_as::<_, CategoryMatch>(
        r#"
        SELECT c.id, c.name, COUNT(p.id) AS product_count
          FROM categories c
          LEFT JOIN products p ON p.category_id = c.id
         WHERE c.normalized_name LIKE ?
         GROUP BY c.id, c.name
         ORDER BY COUNT(p.id) DESC
         LIMIT ?
        "#,
    )
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    {
        Ok(matches) => matches,
        Err(e) => {
            tracing::error!("category search failed: {e}");
            Vec::new()
        }
    }
}

/* =========================
 * Product lookup & comparison
 * ========================= */

pub async fn get_product(pool: &SqlitePool, id: i64) -> anyhow::Result<Option<Product>> {
    let sql = format!("SELECT {PRODUCT_COLS} {PRODUCT_JOINS} WHERE p.id = ?");
    let row = sqlx::query_as::<_, ProductRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Product::from))
}

pub async fn get_product_by_ean(pool: &SqlitePool, ean: &str) -> anyhow::Result<Option<Product>> {
    let sql = format!("SELECT {PRODUCT_COLS} {PRODUCT_JOINS} WHERE p.ean = ? ORDER BY p.id LIMIT 1");
    let row = sqlx::query_as::<_, ProductRow>(&sql)
        .bind(ean)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Product::from))
}

#[derive(Serialize, Clone, Debug)]
pub struct ComparisonEntry {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub availability: bool,
    pub ean: Option<String>,
    pub mpn: Option<String>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub shop_name: String,
    pub brand_name: Option<String>,
    pub category_name: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct ComparisonResponse {
    pub title: String,
    pub description: Option<String>,
    pub products: Vec<ComparisonEntry>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub best_price: Option<f64>,
    pub available_count: u32,
    pub total_shops: u32,
    pub total_count: usize,
}

/// Price comparison for one listing: the same product across shops, matched
/// by exact ean, then mpn, then exact title, deduplicated per shop.
pub async fn comparison(pool: &SqlitePool, id: i64) -> anyhow::Result<Option<ComparisonResponse>> {
    let sql = format!("SELECT {PRODUCT_COLS} {PRODUCT_JOINS} WHERE p.id = ?");
    let Some(base) = sqlx::query_as::<_, ProductRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
    else {
        return Ok(None);
    };

    // empty sentinels never match thanks to the != '' guards
    let ean = base.ean.as_deref().map(str::trim).unwrap_or_default();
    let mpn = base.mpn.as_deref().map(str::trim).unwrap_or_default();

    let sql = format!(
        r#"
        SELECT {PRODUCT_COLS} {PRODUCT_JOINS}
        WHERE p.id != ?1
          AND (
              (p.ean IS NOT NULL AND p.ean != '' AND p.ean = ?2)
           OR (p.mpn IS NOT NULL AND p.mpn != '' AND p.mpn = ?3)
           OR LOWER(p.title) = LOWER(?4)
          )
        ORDER BY
            CASE
                WHEN p.ean = ?2 AND p.ean != '' THEN 1
                WHEN p.mpn = ?3 AND p.mpn != '' THEN 2
                ELSE 3
            END,
            p.price ASC,
            p.availability DESC,
            p.updated_at DESC
        "#
    );
    let matches = sqlx::query_as::<_, ProductRow>(&sql)
        .bind(base.id)
        .bind(ean)
        .bind(mpn)
        .bind(&base.title)
        .fetch_all(pool)
        .await?;

    let mut entries = Vec::with_capacity(matches.len() + 1);
    let mut seen_shops: BTreeSet<String> = BTreeSet::new();

    for row in std::iter::once(base).chain(matches) {
        let shop = row.merchant_name.clone().unwrap_or_default();
        if !seen_shops.insert(shop.to_lowercase()) {
            continue;
        }
        entries.push(ComparisonEntry {
            id: row.id,
            title: row.title,
            description: row.description,
            price: row.price,
            availability: row.availability != 0,
            ean: row.ean,
            mpn: row.mpn,
            image_url: row.image_url,
            product_url: row.product_url,
            shop_name: shop,
            brand_name: row.brand_name,
            category_name: row.category_name,
        });
    }

    let prices: Vec<f64> = entries.iter().filter_map(|e| e.price).collect();
    let min_price = prices.iter().copied().reduce(f64::min);
    let max_price = prices.iter().copied().reduce(f64::max);

    Ok(Some(ComparisonResponse {
        title: entries[0].title.clone(),
        description: entries[0].description.clone(),
        min_price,
        max_price,
        best_price: min_price,
        available_count: entries.iter().filter(|e| e.availability).count() as u32,
        total_shops: entries.len() as u32,
        total_count: entries.len(),
        products: entries,
    }))
}

/* =========================
 * Facets
 * ========================= */

#[derive(Serialize, sqlx::FromRow, Clone, Debug)]
pub struct FacetCount {
    pub name: String,
    pub count: i64,
}

#[derive(Serialize, sqlx::FromRow, Clone, Debug)]
pub struct PriceStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Serialize, Debug)]
pub struct FacetsResponse {
    pub brands: Vec<FacetCount>,
    pub categories: Vec<FacetCount>,
    pub shops: Vec<FacetCount>,
    pub price_stats: Option<PriceStats>,
}

pub async fn facets(pool: &SqlitePool) -> anyhow::Result<FacetsResponse> {
    let brands = sqlx::query_as::<_, FacetCount>(
        r#"
        SELECT b.name, COUNT(p.id) AS count
          FROM brands b
          JOIN products p ON p.brand_id = b.id
         GROUP BY b.name
         ORDER BY COUNT(p.id) DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let categories = sqlx::query_as::<_, FacetCount>(
        r#"
        SELECT c.name, COUNT(p.id) AS count
          FROM categories c
          JOIN products p ON p.category_id = c.id
         GROUP BY c.name
         ORDER BY COUNT(p.id) DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let shops = sqlx::query_as::<_, FacetCount>(
        r#"
        SELECT m.name, COUNT(p.id) AS count
          FROM merchants m
          JOIN products p ON p.merchant_id = m.id
         GROUP BY m.name
         ORDER BY COUNT(p.id) DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let price_stats = sqlx::query_as::<_, PriceStats>(
        r#"
        SELECT MIN(price) AS min, MAX(price) AS max, AVG(price) AS avg
          FROM products
         WHERE price IS NOT NULL
        "#,
    )
    .fetch_optional(pool)
    .await
    .unwrap_or(None);

    Ok(FacetsResponse {
        brands,
        categories,
        shops,
        price_stats,
    })
}
