pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod models;
pub mod rewriter;
pub mod routes;
pub mod search;
pub mod suggest;

use crate::models::AppState;
use crate::routes::{admin, products, search as search_api, shops};

use axum::middleware::from_fn;
use axum::routing::{delete, get, post};
use axum::Router;

use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_app(state: AppState) -> Router {
    // Request-ID middleware comes first so everything downstream
    // has access to the x-request-id header.
    let request_id_layer = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id());

    Router::new()
        .route("/health", get(admin::health))
        .route("/search", get(search_api::search))
        .route("/suggestions", get(search_api::suggestions))
        .route("/facets", get(search_api::facets))
        .route("/product/{id}", get(products::get))
        .route("/product/{id}/comparison", get(products::comparison))
        .route("/product/ean/{ean}", get(products::by_ean))
        .route("/shops", get(shops::list).post(shops::create))
        .route("/shops/{id}", delete(shops::delete))
        .route("/admin/process-feeds", post(admin::process_feeds))
        .route("/admin/stats", get(admin::stats))
        .with_state(state)
        .layer(request_id_layer)
        .layer(from_fn(logging::access_log))
        .layer(cors_layer())
}
