use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::error;

use crate::{
    error::AppResult,
    models::{AppState, Product},
    search,
};

pub async fn get(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<Product>> {
    match search::get_product(&state.pool, id).await {
        Ok(Some(product)) => Ok(Json(product)),
        Ok(None) => Err(StatusCode::NOT_FOUND.into()),
        Err(e) => {
            error!(?id, "product lookup failed: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into())
        }
    }
}

pub async fn by_ean(
    State(state): State<AppState>,
    Path(ean): Path<String>,
) -> AppResult<Json<Product>> {
    match search::get_product_by_ean(&state.pool, &ean).await {
        Ok(Some(product)) => Ok(Json(product)),
        Ok(None) => Err(StatusCode::NOT_FOUND.into()),
        Err(e) => {
            error!(ean, "product lookup by ean failed: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into())
        }
    }
}

pub async fn comparison(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<search::ComparisonResponse>> {
    match search::comparison(&state.pool, id).await {
        Ok(Some(comparison)) => Ok(Json(comparison)),
        Ok(None) => Err(StatusCode::NOT_FOUND.into()),
        Err(e) => {
            error!(?id, "product comparison failed: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into())
        }
    }
}
