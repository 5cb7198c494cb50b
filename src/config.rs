use clap::Parser;
use std::{net::SocketAddr, path::PathBuf};

/// Agora server configuration
#[derive(Parser, Debug, Clone)]
#[command(
    name = "agora-server",
    version,
    about = "Product search and price comparison API server",
    long_about = None
)]
pub struct Config {
    /// Address to bind the HTTP server to
    #[arg(long, env = "AGORA_BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Path of the SQLite database file
    #[arg(long, env = "AGORA_DATABASE_PATH", default_value = "agora.sqlite")]
    pub database_path: String,

    /// Directory for cached feed bodies
    #[arg(long, env = "AGORA_CACHE_DIR", default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Seconds a cached feed body stays fresh
    #[arg(long, env = "AGORA_CACHE_TTL_SECS", default_value_t = 3600)]
    pub cache_ttl_secs: u64,

    /// Total timeout for one feed download, in seconds
    #[arg(long, env = "AGORA_FETCH_TIMEOUT_SECS", default_value_t = 300)]
    pub fetch_timeout_secs: u64,

    /// Hours between automatic feed refresh rounds
    #[arg(long, env = "AGORA_FEED_REFRESH_HOURS", default_value_t = 24)]
    pub feed_refresh_hours: u64,

    /// How many merchant syncs may run at once during a refresh round
    #[arg(long, env = "AGORA_SYNC_CONCURRENCY", default_value_t = 4)]
    pub sync_concurrency: usize,

    /// OpenAI-compatible chat completions base URL for the query rewriter
    #[arg(
        long,
        env = "AGORA_LLM_API_URL",
        default_value = "https://api.openai.com/v1"
    )]
    pub llm_api_url: String,

    /// API key for the query rewriter LLM; rewriting works without it
    #[arg(long, env = "AGORA_LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Model used by the query rewriter
    #[arg(long, env = "AGORA_LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Log file path
    #[arg(long, env = "AGORA_LOG_FILE", default_value = "agora.log")]
    pub log_file: PathBuf,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "AGORA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
