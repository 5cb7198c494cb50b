use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    routing::get,
};
use serde_json::json;
use tower::ServiceExt;

use agora::{build_app, config::Config, models::AppState, rewriter::QueryRewriter};
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{SqlitePool, migrate::Migrator};
use std::collections::HashSet;
use std::future::IntoFuture;
use std::path::Path;
use std::sync::Arc;

struct TestCtx {
    _tmp: tempfile::TempDir,
    app: Router,
    pool: SqlitePool,
}

fn test_config(tmp: &Path) -> Config {
    Config::parse_from([
        "agora-server",
        "--database-path",
        tmp.join("test.sqlite").to_str().unwrap(),
        "--cache-dir",
        tmp.join("cache").to_str().unwrap(),
        "--log-file",
        tmp.join("test.log").to_str().unwrap(),
    ])
}

async fn make_ctx() -> anyhow::Result<TestCtx> {
    let tmp = tempfile::tempdir()?;
    let config = test_config(tmp.path());

    let opts = SqliteConnectOptions::new()
        .filename(tmp.path().join("test.sqlite"))
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Off);

    let pool = SqlitePool::connect_with(opts).await?;
    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(&pool).await?;

    let http = reqwest::Client::new();
    let state = AppState {
        pool: pool.clone(),
        http: http.clone(),
        // no LLM key in tests, for predictability
        rewriter: Arc::new(QueryRewriter::new(None, http)),
        sync_guard: Arc::new(tokio::sync::Mutex::new(HashSet::new())),
        config,
    };
    let app = build_app(state);
    Ok(TestCtx {
        _tmp: tmp,
        app,
        pool,
    })
}

async fn json_req(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| json!({"_raw": String::from_utf8_lossy(&bytes)}))
    };
    (status, body)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    json_req(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

/* =========================
 * Mock merchant feed server
 * ========================= */

struct MockFeeds {
    port: u16,
}

impl MockFeeds {
    /// Serve static XML bodies at the given paths.
    async fn start(feeds: Vec<(&'static str, String)>) -> Self {
        let mut router = Router::new();
        for (path, body) in feeds {
            let handler = move || {
                let body = body.clone();
                async move { body }
            };
            router = router.route(path, get(handler));
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock feed server");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(axum::serve(listener, router).into_future());

        Self { port }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }
}

fn shop_a_feed() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<store><products>
  <product>
    <title>Apple iPhone 15 128GB</title>
    <sku>A-IP15</sku>
    <ean>1110001110001</ean>
    <price_with_vat>899,00</price_with_vat>
    <instock>yes</instock>
    <manufacturer>Apple</manufacturer>
    <category>Electronics &gt; Smartphones</category>
    <image>https://shop-a.example/ip15.jpg</image>
    <link>https://shop-a.example/p/ip15</link>
  </product>
  <product>
    <title>Samsung Galaxy S24</title>
    <sku>A-S24</sku>
    <ean>2220002220002</ean>
    <price>450,00</price>
    <instock>yes</instock>
    <manufacturer>Samsung</manufacturer>
    <category>Electronics &gt; Smartphones</category>
  </product>
  <product>
    <title>Samsung LED TV 55</title>
    <sku>A-TV55</sku>
    <ean>3330003330003</ean>
    <price>450,00</price>
    <instock>no</instock>
    <manufacturer>Samsung</manufacturer>
    <category>Electronics &gt; TVs</category>
  </product>
  <product>
    <title>Samsung USB-C Charger 30W</title>
    <sku>A-CHG30</sku>
    <price>19,90</price>
    <instock>yes</instock>
    <manufacturer>Samsung</manufacturer>
    <category>Accessories</category>
  </product>
  <product>
    <description>No title here, must be dropped</description>
    <price>5,00</price>
  </product>
</products></store>"#
        .to_string()
}

fn shop_b_feed() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<store><products>
  <item>
    <title>Apple iPhone 15 128GB</title>
    <sku>B-IP15</sku>
    <ean>1110001110001</ean>
    <price>949,00</price>
    <instock>διαθέσιμο</instock>
    <manufacturer>Apple</manufacturer>
    <category>Electronics &gt; Smartphones</category>
  </item>
  <item>
    <title>Samsung Galaxy S24</title>
    <sku>B-S24</sku>
    <ean>2220002220002</ean>
    <price>470,00</price>
    <instock>no</instock>
    <manufacturer>Samsung</manufacturer>
    <category>Electronics &gt; Smartphones</category>
  </item>
</products></store>"#
        .to_string()
}

/// Register both mock shops and run one ingestion round.
async fn ingest_two_shops(ctx: &TestCtx) -> serde_json::Value {
    let feeds = MockFeeds::start(vec![("/a.xml", shop_a_feed()), ("/b.xml", shop_b_feed())]).await;

    for (name, path) in [("Shop A", "/a.xml"), ("Shop B", "/b.xml")] {
        let (status, _) = json_req(
            &ctx.app,
            Request::post("/shops")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"name": name, "feed_url": feeds.url(path)}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, results) = json_req(
        &ctx.app,
        Request::post("/admin/process-feeds")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    results
}

/* =========================
 * Tests
 * ========================= */

#[tokio::test]
async fn health_ok() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    let (status, body) = get_json(&ctx.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    Ok(())
}

#[tokio::test]
async fn shops_crud() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;

    let create = |name: &str| {
        Request::post("/shops")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"name": name, "feed_url": "https://example.com/feed.xml"}).to_string(),
            ))
            .unwrap()
    };

    let (status, shop) = json_req(&ctx.app, create("My Shop")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(shop["name"], json!("My Shop"));
    assert_eq!(shop["sync_status"], json!("pending"));
    let id = shop["id"].as_i64().unwrap();

    // duplicate name
    let (status, _) = json_req(&ctx.app, create("My Shop")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // blank name
    let (status, _) = json_req(&ctx.app, create("  ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, shops) = get_json(&ctx.app, "/shops").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shops.as_array().unwrap().len(), 1);

    let (status, _) = json_req(
        &ctx.app,
        Request::delete(format!("/shops/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = json_req(
        &ctx.app,
        Request::delete(format!("/shops/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn ingestion_reports_counts_and_drops_bad_records() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    let results = ingest_two_shops(&ctx).await;

    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);

    let a = &results[0];
    assert_eq!(a["error"], json!(null));
    assert_eq!(a["fetched"], json!(5));
    assert_eq!(a["parsed"], json!(4));
    assert_eq!(a["skipped"], json!(1));
    assert_eq!(a["inserted"], json!(4));

    let b = &results[1];
    assert_eq!(b["error"], json!(null));
    assert_eq!(b["parsed"], json!(2));

    let (_, stats) = get_json(&ctx.app, "/admin/stats").await;
    assert_eq!(stats["shops"], json!(2));
    assert_eq!(stats["products"], json!(6));
    assert_eq!(stats["brands"], json!(2));
    assert_eq!(stats["sync_status"], json!("ok"));
    Ok(())
}

#[tokio::test]
async fn ingest_twice_is_idempotent() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (_, before) = get_json(&ctx.app, "/admin/stats").await;

    let (status, results) = json_req(
        &ctx.app,
        Request::post("/admin/process-feeds")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    for r in results.as_array().unwrap() {
        assert_eq!(r["error"], json!(null));
        assert_eq!(r["inserted"], json!(0));
    }

    let (_, after) = get_json(&ctx.app, "/admin/stats").await;
    assert_eq!(before["products"], after["products"]);
    assert_eq!(before["brands"], after["brands"]);
    assert_eq!(before["categories"], after["categories"]);
    Ok(())
}

#[tokio::test]
async fn same_ean_aggregates_across_shops() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (status, body) = get_json(&ctx.app, "/search?q=iphone").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["search_type"], json!("aggregated"));
    assert_eq!(body["total"], json!(1));

    let group = &body["products"][0];
    assert_eq!(group["shop_count"], json!(2));
    assert_eq!(group["available_shops"], json!(2));
    assert_eq!(group["min_price"], json!(899.0));
    assert_eq!(group["max_price"], json!(949.0));
    assert_eq!(group["best_available_price"], json!(899.0));
    assert_eq!(
        group["shop_names"],
        json!(["Shop A", "Shop B"])
    );
    assert_eq!(group["product_ids"].as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn typo_query_is_corrected() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    // "aple" -> "apple" -> Apple brand products
    let (status, body) = get_json(&ctx.app, "/search?q=aple").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));
    assert!(
        body["products"][0]["title"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("apple")
    );
    Ok(())
}

#[tokio::test]
async fn flat_mode_returns_individual_listings() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (status, body) = get_json(&ctx.app, "/search?q=iphone&type=products").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["search_type"], json!("flat"));
    assert_eq!(body["total"], json!(2));
    Ok(())
}

#[tokio::test]
async fn filter_composition() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (status, body) = get_json(
        &ctx.app,
        "/search?q=phone&brands=Samsung&min_price=100&max_price=500&availability=true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // only Shop A's Galaxy S24 is Samsung, 100..=500 and available
    assert_eq!(body["total"], json!(1));
    let group = &body["products"][0];
    assert_eq!(group["title"], json!("Samsung Galaxy S24"));
    assert_eq!(group["shop_count"], json!(1));
    assert_eq!(group["min_price"], json!(450.0));
    Ok(())
}

#[tokio::test]
async fn price_sort_is_consistent_across_pages() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    // all Samsung products, cheapest first, two pages
    let (_, page1) = get_json(
        &ctx.app,
        "/search?q=samsung&sort=price_asc&page=1&per_page=2",
    )
    .await;
    let (_, page2) = get_json(
        &ctx.app,
        "/search?q=samsung&sort=price_asc&page=2&per_page=2",
    )
    .await;

    assert_eq!(page1["total"], json!(3));
    assert_eq!(page1["total_pages"], json!(2));

    let mut ids = Vec::new();
    let mut prices = Vec::new();
    for page in [&page1, &page2] {
        for group in page["products"].as_array().unwrap() {
            ids.push(group["id"].as_i64().unwrap());
            prices.push(group["min_price"].as_f64().unwrap());
        }
    }
    assert_eq!(ids.len(), 3);
    // no duplicates across pages
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    // non-decreasing prices
    assert!(prices.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(prices[0], 19.9);
    Ok(())
}

#[tokio::test]
async fn product_lookup_and_comparison() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (status, product) = get_json(&ctx.app, "/product/ean/1110001110001").await;
    assert_eq!(status, StatusCode::OK);
    let id = product["id"].as_i64().unwrap();

    let (status, single) = get_json(&ctx.app, &format!("/product/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(single["ean"], json!("1110001110001"));

    let (status, comparison) = get_json(&ctx.app, &format!("/product/{id}/comparison")).await;
    assert_eq!(status, StatusCode::OK);
    // one entry per shop carrying this EAN
    assert_eq!(comparison["total_shops"], json!(2));
    assert_eq!(comparison["min_price"], json!(899.0));
    assert_eq!(comparison["max_price"], json!(949.0));
    assert_eq!(comparison["best_price"], json!(899.0));
    let shops: Vec<&str> = comparison["products"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["shop_name"].as_str().unwrap())
        .collect();
    let unique: std::collections::HashSet<_> = shops.iter().collect();
    assert_eq!(unique.len(), shops.len());

    let (status, _) = get_json(&ctx.app, "/product/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn suggestions_correct_typos_and_dedupe() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (status, body) = get_json(&ctx.app, "/suggestions?q=aple").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0], json!("apple"));

    let (_, body) = get_json(&ctx.app, "/suggestions?q=apple").await;
    let entries: Vec<String> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_lowercase())
        .collect();
    // identical titles from both shops collapse to one entry
    let unique: std::collections::HashSet<_> = entries.iter().collect();
    assert_eq!(unique.len(), entries.len());
    assert!(entries.iter().any(|s| s.contains("iphone")));

    // too-short queries yield nothing
    let (_, body) = get_json(&ctx.app, "/suggestions?q=a").await;
    assert_eq!(body, json!([]));
    Ok(())
}

#[tokio::test]
async fn facets_cover_brands_categories_shops() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (status, body) = get_json(&ctx.app, "/facets").await;
    assert_eq!(status, StatusCode::OK);

    let brand_names: Vec<&str> = body["brands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert!(brand_names.contains(&"Apple"));
    assert!(brand_names.contains(&"Samsung"));

    let stats = &body["price_stats"];
    assert!(stats["min"].as_f64().unwrap() <= stats["avg"].as_f64().unwrap());
    assert!(stats["avg"].as_f64().unwrap() <= stats["max"].as_f64().unwrap());
    Ok(())
}

#[tokio::test]
async fn category_distribution_accompanies_searches() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (_, body) = get_json(&ctx.app, "/search?q=samsung").await;
    let buckets = body["category_distribution"].as_array().unwrap();
    assert!(!buckets.is_empty());
    assert!(buckets[0]["count"].as_i64().unwrap() >= 1);
    Ok(())
}

#[tokio::test]
async fn search_degrades_to_fallback_on_store_failure() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ctx.pool.close().await;

    let (status, body) = get_json(&ctx.app, "/search?q=tv&page=3&per_page=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["search_type"], json!("fallback"));
    assert_eq!(body["total"], json!(0));
    assert_eq!(body["page"], json!(3));
    assert_eq!(body["per_page"], json!(7));
    assert!(body["execution_time_ms"].as_f64().is_some());
    Ok(())
}

#[tokio::test]
async fn deleting_a_shop_cascades_to_products() -> anyhow::Result<()> {
    let ctx = make_ctx().await?;
    ingest_two_shops(&ctx).await;

    let (_, shops) = get_json(&ctx.app, "/shops").await;
    let shop_a_id = shops
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["name"] == json!("Shop A"))
        .unwrap()["id"]
        .as_i64()
        .unwrap();

    let (status, _) = json_req(
        &ctx.app,
        Request::delete(format!("/shops/{shop_a_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, stats) = get_json(&ctx.app, "/admin/stats").await;
    assert_eq!(stats["shops"], json!(1));
    assert_eq!(stats["products"], json!(2));
    Ok(())
}
