use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::AppResult,
    models::AppState,
    search::{self, SearchFilters, SearchMode, Sort},
    suggest,
};

/* =========================
 * GET /search
 * ========================= */

#[derive(Deserialize, Debug, Default)]
pub struct SearchParams {
    pub q: Option<String>,
    pub title: Option<String>,
    pub brand: Option<String>,
    /// Comma-separated list.
    pub brands: Option<String>,
    pub category: Option<String>,
    /// Comma-separated list; blank entries are ignored.
    pub categories: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub availability: Option<bool>,
    pub ean: Option<String>,
    pub mpn: Option<String>,
    /// Comma-separated list of shop names.
    pub shops: Option<String>,
    pub sort: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    /// all (default, aggregated) | products (flat) | categories
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl SearchParams {
    fn filters(&self) -> SearchFilters {
        SearchFilters {
            // q doubles as the title filter when no explicit title is given
            title: self.title.clone().or_else(|| self.q.clone()),
            brand: self.brand.clone(),
            brands: split_list(self.brands.as_deref()),
            category: self.category.clone(),
            categories: split_list(self.categories.as_deref()),
            min_price: self.min_price,
            max_price: self.max_price,
            availability: self.availability,
            ean: self.ean.clone(),
            mpn: self.mpn.clone(),
            shops: split_list(self.shops.as_deref()),
            sort: Sort::parse(self.sort.as_deref()),
        }
    }
}

#[derive(Serialize)]
struct CategorySearchResponse {
    categories: Vec<search::CategoryMatch>,
    total: usize,
    page: u32,
    per_page: u32,
    search_type: &'static str,
}

pub async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);

    match params.kind.as_deref() {
        Some("categories") => {
            let q = params.q.clone().unwrap_or_default();
            let matches =
                search::search_categories(&state.pool, &q, i64::from(per_page)).await;
            Json(CategorySearchResponse {
                total: matches.len(),
                categories: matches,
                page,
                per_page,
                search_type: "categories",
            })
            .into_response()
        }
        kind => {
            let mode = if kind == Some("products") {
                SearchMode::Flat
            } else {
                SearchMode::Aggregated
            };
            let filters = params.filters();
            Json(search::search(&state, &filters, mode, page, per_page).await).into_response()
        }
    }
}

/* =========================
 * GET /suggestions
 * ========================= */

#[derive(Deserialize, Debug, Default)]
pub struct SuggestParams {
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub fuzzy: Option<bool>,
}

pub async fn suggestions(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Json<Vec<String>> {
    let q = params.q.unwrap_or_default();
    let limit = params.limit.unwrap_or(10);
    let fuzzy = params.fuzzy.unwrap_or(true);
    Json(suggest::suggest(&state.pool, &q, limit, fuzzy).await)
}

/* =========================
 * GET /facets
 * ========================= */

pub async fn facets(State(state): State<AppState>) -> AppResult<Json<search::FacetsResponse>> {
    Ok(Json(search::facets(&state.pool).await?))
}
