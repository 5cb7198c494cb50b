use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::{
    error::AppResult,
    ingest,
    models::{AppState, SyncResult},
};

/// Manual ingestion trigger; runs a full refresh round and reports per
/// merchant.
pub async fn process_feeds(State(state): State<AppState>) -> Json<Vec<SyncResult>> {
    Json(ingest::process_all_feeds(&state).await)
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub shops: i64,
    pub products: i64,
    pub brands: i64,
    pub categories: i64,
    pub last_sync: Option<String>,
    pub sync_status: Option<String>,
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<StatsResponse>> {
    let count = |sql: &'static str| {
        let pool = state.pool.clone();
        async move { sqlx::query_scalar::<_, i64>(sql).fetch_one(&pool).await }
    };

    let shops = count("SELECT COUNT(*) FROM merchants").await;
    let products = count("SELECT COUNT(*) FROM products").await;
    let brands = count("SELECT COUNT(*) FROM brands").await;
    let categories = count("SELECT COUNT(*) FROM categories").await;

    let (shops, products, brands, categories) = match (shops, products, brands, categories) {
        (Ok(s), Ok(p), Ok(b), Ok(c)) => (s, p, b, c),
        (s, p, b, c) => {
            error!(?s, ?p, ?b, ?c, "stats counts failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
        }
    };

    let last: Option<(Option<String>, String)> = sqlx::query_as(
        r#"
        SELECT last_sync_at, sync_status
          FROM merchants
         ORDER BY last_sync_at IS NULL, last_sync_at DESC
         LIMIT 1
        "#,
    )
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        error!("stats sync lookup failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let (last_sync, sync_status) = match last {
        Some((at, status)) => (at, Some(status)),
        None => (None, None),
    };

    Ok(Json(StatsResponse {
        shops,
        products,
        brands,
        categories,
        last_sync,
        sync_status,
    }))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
