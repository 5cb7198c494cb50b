use clap::Parser;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;

use agora::{
    build_app,
    config::Config,
    db::make_pool,
    ingest,
    llm::LlmClient,
    logging::init_logging,
    models::AppState,
    rewriter::QueryRewriter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Keep guard alive so the file logger flushes correctly
    let _log_guard = init_logging(&config);

    // Log all configuration (mask sensitive values)
    tracing::info!("=== Configuration ===");
    tracing::info!("Bind address: {}", config.bind);
    tracing::info!("Database path: {}", config.database_path);
    tracing::info!("Cache dir: {}", config.cache_dir.display());
    tracing::info!("Cache TTL: {}s", config.cache_ttl_secs);
    tracing::info!("Fetch timeout: {}s", config.fetch_timeout_secs);
    tracing::info!("Feed refresh interval: {}h", config.feed_refresh_hours);
    tracing::info!("Sync concurrency: {}", config.sync_concurrency);
    tracing::info!(
        "LLM API key: {}",
        if config.llm_api_key.as_ref().is_some_and(|k| !k.is_empty()) {
            "<set>"
        } else {
            "<not set>"
        }
    );
    tracing::info!("LLM model: {}", config.llm_model);
    tracing::info!("LLM API URL: {}", config.llm_api_url);
    tracing::info!("Log file: {}", config.log_file.display());
    tracing::info!("====================");

    let pool = make_pool(&config.database_path).await?;
    let http = reqwest::Client::new();

    let llm = config
        .llm_api_key
        .as_ref()
        .filter(|key| !key.trim().is_empty())
        .map(|key| {
            LlmClient::new(
                config.llm_api_url.clone(),
                key.clone(),
                config.llm_model.clone(),
            )
        });
    if llm.is_none() {
        tracing::info!("no LLM API key configured, query rewriting uses the pattern path only");
    }

    let state = AppState {
        pool,
        http: http.clone(),
        rewriter: Arc::new(QueryRewriter::new(llm, http)),
        sync_guard: Arc::new(tokio::sync::Mutex::new(HashSet::new())),
        config: config.clone(),
    };

    ingest::spawn_scheduler(state.clone());

    let app = build_app(state);

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!("listening on {}", config.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
