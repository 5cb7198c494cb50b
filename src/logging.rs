use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Install the global subscriber: ANSI stdout plus a daily-rolling plain
/// file. The returned guard must stay alive so the file writer flushes.
pub fn init_logging(config: &Config) -> WorkerGuard {
    let dir = config
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = config
        .log_file
        .file_name()
        .map_or_else(|| "agora.log".into(), |n| n.to_string_lossy().into_owned());

    let file_appender = tracing_appender::rolling::daily(dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    guard
}

/// One-line access log.
/// 2xx/3xx -> INFO
/// 4xx/5xx -> ERROR (so stdout shows red by default ANSI level colors)
pub async fn access_log(req: Request<Body>, next: Next) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let res = next.run(req).await;
    let status = res.status().as_u16();

    // Padding for a slightly nicer aligned look
    let msg = format!("{:<6} {:<40} {}", method, path, status);

    match status {
        400..=599 => tracing::error!("{}", msg),
        _ => tracing::info!("{}", msg),
    }

    res
}
