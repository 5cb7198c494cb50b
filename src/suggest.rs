use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::rewriter::correct_typo;

/// Upper bound on returned suggestions; callers may ask for fewer.
pub const MAX_SUGGESTIONS: i64 = 20;

/// Titles sampled for the optional fuzzy pass.
const FUZZY_SAMPLE: i64 = 200;

/// Autocomplete over titles, brand names and category names.
///
/// Ordering: typo correction first, then title matches, then brands, then
/// categories, then (optionally) a fuzzy pass. The result is deduplicated
/// case-insensitively and degrades to fewer entries on store errors, never
/// to a failure.
pub async fn suggest(pool: &SqlitePool, query: &str, limit: i64, fuzzy: bool) -> Vec<String> {
    let query = query.trim();
    if query.chars().count() < 2 {
        return Vec::new();
    }
    let limit = limit.clamp(1, MAX_SUGGESTIONS) as usize;

    let mut out: Vec<String> = Vec::with_capacity(limit);
    let mut seen: HashSet<String> = HashSet::new();

    if let Some(corrected) = correct_typo(query) {
        seen.insert(corrected.to_lowercase());
        out.push(corrected.to_string());
    }

    // one bounded query across all three sources, ranked title > brand > category
    let pattern = format!("%{}%", query.to_lowercase());
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT s, rank FROM (
            SELECT DISTINCT title AS s, 1 AS rank
              FROM products
             WHERE LOWER(title) LIKE ?1
            UNION ALL
            SELECT name, 2 FROM brands WHERE normalized_name LIKE ?1
            UNION ALL
            SELECT name, 3 FROM categories WHERE normalized_name LIKE ?1
        )
        ORDER BY rank, s
        LIMIT ?2
        "#,
    )
    .bind(&pattern)
    .bind((limit * 2) as i64)
    .fetch_all(pool)
    .await
    .unwrap_or_else(|e| {
        tracing::error!("suggestion query failed: {e}");
        Vec::new()
    });

    for (candidate, _) in rows {
        if out.len() >= limit {
            return out;
        }
        if seen.insert(candidate.to_lowercase()) {
            out.push(candidate);
        }
    }

    if fuzzy && out.len() < limit {
        fuzzy_pass(pool, query, limit, &mut out, &mut seen).await;
    }

    out
}

/// Token-wise similarity pass over a bounded sample of titles.
async fn fuzzy_pass(
    pool: &SqlitePool,
    query: &str,
    limit: usize,
    out: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    let titles: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT title FROM products ORDER BY title LIMIT ?")
            .bind(FUZZY_SAMPLE)
            .fetch_all(pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("fuzzy suggestion sample failed: {e}");
                Vec::new()
            });

    for title in titles {
        if out.len() >= limit {
            break;
        }
        if token_similarity(query, &title) >= 0.6 && seen.insert(title.to_lowercase()) {
            out.push(title);
        }
    }
}

/// Jaccard similarity over lowercase alphanumeric tokens.
fn token_similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

fn tokens(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
