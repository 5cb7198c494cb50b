use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a feed body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Network,
    Cache,
}

/// HTTP feed fetcher with a disk-backed cache, one file per URL.
///
/// Concurrent fetchers for the same URL may both hit the network, but cache
/// files are written via temp + rename so a reader never sees a partial body.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
    ttl: Duration,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(
        client: reqwest::Client,
        cache_dir: PathBuf,
        ttl: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            client,
            cache_dir,
            ttl,
            timeout,
        })
    }

    /// Cache file for a URL: first 128 bits of its SHA-256, hex-encoded.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let mut name = String::with_capacity(36);
        for byte in &digest[..16] {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(".xml");
        self.cache_dir.join(name)
    }

    pub async fn get(&self, url: &str) -> anyhow::Result<(String, FetchSource)> {
        let path = self.cache_path(url);

        if let Some(body) = self.load_fresh(&path).await {
            tracing::info!(url, "serving feed body from cache");
            return Ok((body, FetchSource::Cache));
        }

        tracing::info!(url, "fetching feed body");
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            anyhow::bail!("feed fetch failed: HTTP {status} for {url}");
        }

        let body = resp.text().await?;
        tracing::info!(url, chars = body.len(), "fetched feed body");

        // Cache write failure must not fail the fetch
        if let Err(e) = self.store(&path, body.clone()).await {
            tracing::warn!(url, "failed to write feed cache: {e:#}");
        }

        Ok((body, FetchSource::Network))
    }

    async fn load_fresh(&self, path: &Path) -> Option<String> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let age = meta.modified().ok()?.elapsed().ok()?;
        if age > self.ttl {
            return None;
        }
        tokio::fs::read_to_string(path).await.ok()
    }

    async fn store(&self, path: &Path, body: String) -> anyhow::Result<()> {
        let dir = self.cache_dir.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(body.as_bytes())?;
            tmp.persist(&path)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}
