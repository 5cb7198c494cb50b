use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::error;

use crate::{
    error::AppResult,
    models::{AppState, Merchant, NewMerchant},
};

pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<Merchant>>> {
    let merchants: Vec<Merchant> = sqlx::query_as("SELECT * FROM merchants ORDER BY id")
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            error!("shops.list failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(merchants))
}

pub async fn create(
    State(state): State<AppState>,
    Json(new): Json<NewMerchant>,
) -> AppResult<(StatusCode, Json<Merchant>)> {
    if new.name.trim().is_empty() || new.feed_url.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST.into());
    }

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM merchants WHERE name = ?")
        .bind(new.name.trim())
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| {
            error!("shops.create lookup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    if existing.is_some() {
        return Err(StatusCode::CONFLICT.into());
    }

    let merchant: Merchant = sqlx::query_as(
        r#"
        INSERT INTO merchants (name, feed_url, created_at, updated_at)
        VALUES (?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        RETURNING *
        "#,
    )
    .bind(new.name.trim())
    .bind(new.feed_url.trim())
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        error!("shops.create failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((StatusCode::CREATED, Json(merchant)))
}

/// Deleting a shop cascades to its products.
pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<StatusCode> {
    let res = sqlx::query("DELETE FROM merchants WHERE id = ?")
        .bind(id)
        .execute(&state.pool)
        .await
        .map_err(|e| {
            error!("shops.delete failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if res.rows_affected() == 0 {
        return Err(StatusCode::NOT_FOUND.into());
    }
    Ok(StatusCode::NO_CONTENT)
}
