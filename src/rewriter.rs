use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::llm::LlmClient;

/// Hard ceiling for one rewriter LLM call.
const LLM_TIMEOUT: Duration = Duration::from_secs(2);

/* =========================
 * Static tables
 * ========================= */

// Common typo -> canonical query, whole-query matches only.
static TYPO_DICT: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("aple", "apple"),
        ("aplle", "apple"),
        ("appel", "apple"),
        ("samsun", "samsung"),
        ("samsng", "samsung"),
        ("iphne", "iphone"),
        ("iphon", "iphone"),
        ("smartphne", "smartphone"),
        ("smartphn", "smartphone"),
        ("laptp", "laptop"),
        ("lapto", "laptop"),
        ("headphnes", "headphones"),
        ("headphne", "headphone"),
        ("camra", "camera"),
        ("chargr", "charger"),
        ("keybord", "keyboard"),
        ("mous", "mouse"),
        ("speakr", "speaker"),
        ("microphne", "microphone"),
        ("blutooth", "bluetooth"),
    ])
});

static BRAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)\b(
            samsung|apple|iphone|ipad|macbook|sony|lg|panasonic|canon|nikon|
            nike|adidas|puma|reebok|
            panzerglass|otterbox|spigen|caseology|ringke|supcase|
            intel|amd|nvidia|asus|msi|gigabyte|evga|corsair|kingston
        )\b",
    )
    .unwrap()
});

static CATEGORY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)\b(
            smartphone|phone|mobile|tablet|laptop|computer|pc|desktop|
            tv|television|headphone|earphone|speaker|
            camera|gaming|console|accessory|case|cover|charger|cable|adapter
        )\b",
    )
    .unwrap()
});

/// Whole-query typo correction, shared with the suggestion service.
pub fn correct_typo(query: &str) -> Option<&'static str> {
    TYPO_DICT.get(query.trim().to_lowercase().as_str()).copied()
}

/* =========================
 * Rewriter
 * ========================= */

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct QueryComponents {
    pub brands: Vec<String>,
    pub categories: Vec<String>,
    pub product_terms: Vec<String>,
    pub attributes: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RewrittenQuery {
    pub original_query: String,
    pub corrected_query: String,
    pub components: QueryComponents,
    pub confidence: f64,
}

/// Turns a raw user query into a corrected query plus extracted intent.
/// Never fails: the worst case is the original query with empty components.
pub struct QueryRewriter {
    llm: Option<LlmClient>,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, RewrittenQuery>>,
}

impl QueryRewriter {
    pub fn new(llm: Option<LlmClient>, http: reqwest::Client) -> Self {
        Self {
            llm,
            http,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn rewrite(&self, raw: &str) -> RewrittenQuery {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return fallback(raw);
        }

        // Fast path: whole-query typo hit, components from the canonical.
        if let Some(canonical) = TYPO_DICT.get(normalized.as_str()) {
            tracing::debug!(from = raw, to = canonical, "typo dictionary correction");
            let mut rewritten = pattern_rewrite(canonical);
            rewritten.original_query = raw.to_string();
            rewritten.confidence = 0.9;
            return rewritten;
        }

        if self.llm.is_some() {
            if let Some(cached) = self.cache.read().await.get(&normalized) {
                return cached.clone();
            }
            if let Some(rewritten) = self.llm_rewrite(raw).await {
                self.cache
                    .write()
                    .await
                    .insert(normalized, rewritten.clone());
                return rewritten;
            }
        }

        pattern_rewrite(raw)
    }

    /// Best-effort LLM pass. Any failure (timeout, transport, bad JSON)
    /// returns None and the caller falls back to the pattern path.
    async fn llm_rewrite(&self, raw: &str) -> Option<RewrittenQuery> {
        let llm = self.llm.as_ref()?;

        let system = r#"You analyze e-commerce search queries.
Correct spelling mistakes and extract intent.

Return STRICT JSON:
{
  "corrected_query": "spelling corrected version",
  "components": {
    "brands": ["brand names found"],
    "categories": ["category names found"],
    "product_terms": ["product-specific terms"],
    "attributes": ["color, size, model, ..."]
  },
  "confidence": 0.95
}

Rules:
- Fix common typos ("aple" -> "apple", "samsun" -> "samsung").
- Never add commentary or extra fields."#;

        let user = format!("Query: {raw}");

        let call = llm.chat_json(&self.http, system, &user, 0.1, LLM_TIMEOUT, Some(300));
        let value = match tokio::time::timeout(LLM_TIMEOUT, call).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                tracing::warn!("LLM query rewrite failed: {e:#}");
                return None;
            }
            Err(_) => {
                tracing::warn!("LLM query rewrite timed out");
                return None;
            }
        };

        #[derive(Deserialize)]
        struct LlmOut {
            corrected_query: String,
            #[serde(default)]
            components: QueryComponents,
            #[serde(default)]
            confidence: Option<f64>,
        }

        let parsed: LlmOut = match serde_json::from_value(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("LLM rewrite JSON had unexpected shape: {e}");
                return None;
            }
        };

        Some(RewrittenQuery {
            original_query: raw.to_string(),
            corrected_query: parsed.corrected_query,
            components: parsed.components,
            confidence: parsed.confidence.unwrap_or(0.8),
        })
    }
}

/// Regex pattern path: always available, O(query length).
pub fn pattern_rewrite(raw: &str) -> RewrittenQuery {
    let lower = raw.trim().to_lowercase();

    let mut brands = Vec::new();
    for m in BRAND_RE.find_iter(&lower) {
        let hit = m.as_str().to_string();
        if !brands.contains(&hit) {
            brands.push(hit);
        }
    }

    let mut categories = Vec::new();
    for m in CATEGORY_RE.find_iter(&lower) {
        let hit = m.as_str().to_string();
        if !categories.contains(&hit) {
            categories.push(hit);
        }
    }

    let product_terms = lower
        .split_whitespace()
        .filter(|t| !brands.iter().any(|b| b == t) && !categories.iter().any(|c| c == t))
        .map(str::to_string)
        .collect();

    RewrittenQuery {
        original_query: raw.to_string(),
        corrected_query: raw.trim().to_string(),
        components: QueryComponents {
            brands,
            categories,
            product_terms,
            attributes: Vec::new(),
        },
        confidence: 0.7,
    }
}

fn fallback(raw: &str) -> RewrittenQuery {
    RewrittenQuery {
        original_query: raw.to_string(),
        corrected_query: raw.to_string(),
        components: QueryComponents::default(),
        confidence: 0.5,
    }
}
