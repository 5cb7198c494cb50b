use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::BTreeMap;

/// One normalized product record from a merchant feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub title: String,
    pub description: Option<String>,
    pub ean: Option<String>,
    pub mpn: Option<String>,
    pub sku: Option<String>,
    /// Stable per-merchant identity used for upserts: sku, else ean, else
    /// mpn, else the normalized title.
    pub merchant_product_code: String,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_pct: Option<f64>,
    pub availability: bool,
    pub stock_qty: Option<i64>,
    pub image_url: Option<String>,
    pub additional_images: Vec<String>,
    pub product_url: Option<String>,
    pub brand: Option<String>,
    /// Leaf category name.
    pub category: Option<String>,
    pub category_path: Vec<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub specifications: BTreeMap<String, String>,
    pub search_text: String,
}

#[derive(Debug, Default)]
pub struct FeedParse {
    pub records: Vec<FeedRecord>,
    /// Records dropped for failing mandatory validation (missing title).
    pub skipped: u64,
}

/* =========================
 * Field candidate tables
 * ========================= */

// Ordered candidate tags per logical field; first non-empty wins.
const TITLE_TAGS: &[&str] = &["title", "name", "product_name"];
const DESCRIPTION_TAGS: &[&str] = &["description", "desc", "short_description"];
const EAN_TAGS: &[&str] = &["ean", "ean13", "barcode"];
const MPN_TAGS: &[&str] = &["mpn", "manufacturer_part_number", "part_number"];
const SKU_TAGS: &[&str] = &["sku", "product_code", "code"];
const PRICE_TAGS: &[&str] = &["price_with_vat", "price", "final_price", "selling_price"];
const ORIGINAL_PRICE_TAGS: &[&str] = &["original_price", "list_price"];
const AVAILABILITY_TAGS: &[&str] = &[
    "instock",
    "availability",
    "in_stock",
    "stock",
    "available",
    "status",
];
const STOCK_TAGS: &[&str] = &[
    "quantity",
    "stock_quantity",
    "stock_qty",
    "qty",
    "inventory",
    "stock_level",
];
const IMAGE_TAGS: &[&str] = &["image", "image_url", "main_image"];
const URL_TAGS: &[&str] = &["link", "url", "product_url"];
const BRAND_TAGS: &[&str] = &["manufacturer", "brand"];
const CATEGORY_TAGS: &[&str] = &["category", "categories"];
const COLOR_TAGS: &[&str] = &["color", "colour"];
const SIZE_TAGS: &[&str] = &["size", "dimensions"];

const ALL_MAPPED_TAGS: &[&[&str]] = &[
    TITLE_TAGS,
    DESCRIPTION_TAGS,
    EAN_TAGS,
    MPN_TAGS,
    SKU_TAGS,
    PRICE_TAGS,
    ORIGINAL_PRICE_TAGS,
    AVAILABILITY_TAGS,
    STOCK_TAGS,
    IMAGE_TAGS,
    URL_TAGS,
    BRAND_TAGS,
    CATEGORY_TAGS,
    COLOR_TAGS,
    SIZE_TAGS,
];

// Truthy availability tokens, localized variants included.
const TRUTHY_AVAILABILITY: &[&str] = &[
    "true",
    "1",
    "yes",
    "y",
    "available",
    "in stock",
    "διαθέσιμο",
    "disponible",
    "en stock",
    "auf lager",
    "disponibile",
];

/* =========================
 * Feed parsing
 * ========================= */

/// Parse a feed document into normalized records.
///
/// Accepts `<product>` or `<item>` elements anywhere under the root. Pure and
/// deterministic: same bytes in, same records out.
pub fn parse_feed(xml: &str) -> FeedParse {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = FeedParse::default();

    let mut in_item = false;
    // direct children of the current item, in document order
    let mut children: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, String)> = None;
    let mut depth_in_child = 0usize;

    loop {
        match reader.read_event() {
            Err(e) => {
                tracing::error!(
                    position = reader.buffer_position(),
                    "feed XML parse error: {e}"
                );
                break;
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name =
                    String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                if !in_item {
                    if name == "product" || name == "item" {
                        in_item = true;
                        children.clear();
                    }
                } else if current.is_none() {
                    current = Some((name, String::new()));
                    depth_in_child = 1;
                } else {
                    depth_in_child += 1;
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some((_, text)), Ok(decoded)) = (current.as_mut(), t.unescape()) {
                    push_text(text, decoded.trim());
                }
            }
            Ok(Event::CData(t)) => {
                if let Some((_, text)) = current.as_mut() {
                    let decoded = String::from_utf8_lossy(&t.into_inner()).into_owned();
                    push_text(text, decoded.trim());
                }
            }
            Ok(Event::End(_)) => {
                if let Some((name, text)) = current.take() {
                    if depth_in_child > 1 {
                        depth_in_child -= 1;
                        current = Some((name, text));
                    } else {
                        depth_in_child = 0;
                        children.push((name, text));
                    }
                } else if in_item {
                    in_item = false;
                    match build_record(&children) {
                        Some(record) => out.records.push(record),
                        None => out.skipped += 1,
                    }
                }
            }
            Ok(_) => {}
        }
    }

    out
}

fn push_text(acc: &mut String, fragment: &str) {
    if fragment.is_empty() {
        return;
    }
    if !acc.is_empty() {
        acc.push(' ');
    }
    acc.push_str(fragment);
}

/// First non-empty value among the candidate tags, in candidate order.
fn first_value(children: &[(String, String)], tags: &[&str]) -> Option<String> {
    for tag in tags {
        if let Some((_, text)) = children
            .iter()
            .find(|(name, text)| name == tag && !text.trim().is_empty())
        {
            return Some(text.trim().to_string());
        }
    }
    None
}

fn build_record(children: &[(String, String)]) -> Option<FeedRecord> {
    let Some(title) = first_value(children, TITLE_TAGS) else {
        tracing::warn!("feed record missing title, skipping");
        return None;
    };

    let description = first_value(children, DESCRIPTION_TAGS);
    let ean = first_value(children, EAN_TAGS);
    let mpn = first_value(children, MPN_TAGS);
    let sku = first_value(children, SKU_TAGS);

    let price = first_value(children, PRICE_TAGS).and_then(|raw| parse_price(&raw));
    let original_price =
        first_value(children, ORIGINAL_PRICE_TAGS).and_then(|raw| parse_price(&raw));
    let discount_pct = match (price, original_price) {
        (Some(p), Some(o)) if o > p => Some(((o - p) / o * 100.0 * 100.0).round() / 100.0),
        _ => None,
    };

    let mut stock_qty = first_value(children, STOCK_TAGS).and_then(|raw| parse_stock(&raw));
    let availability = match first_value(children, AVAILABILITY_TAGS) {
        Some(raw) => TRUTHY_AVAILABILITY.contains(&raw.to_lowercase().as_str()),
        None => stock_qty.is_some_and(|q| q > 0),
    };
    if stock_qty.is_none() && availability {
        stock_qty = Some(1);
    }

    let (image_url, additional_images) = first_value(children, IMAGE_TAGS)
        .map(|raw| split_image_urls(&raw))
        .unwrap_or((None, Vec::new()));

    let product_url = first_value(children, URL_TAGS);
    let brand = first_value(children, BRAND_TAGS);

    let category_path = first_value(children, CATEGORY_TAGS)
        .map(|raw| split_category_path(&raw))
        .unwrap_or_default();
    let category = category_path.last().cloned();

    let color = first_value(children, COLOR_TAGS);
    let size = first_value(children, SIZE_TAGS);

    // Whatever child tags remain unmapped become specifications, text as-is.
    let mut specifications = BTreeMap::new();
    for (name, text) in children {
        let text = text.trim();
        if text.is_empty() || is_mapped_tag(name) {
            continue;
        }
        specifications
            .entry(name.clone())
            .or_insert_with(|| text.to_string());
    }

    let search_text = build_search_text(
        &title,
        brand.as_deref(),
        category.as_deref(),
        ean.as_deref(),
        mpn.as_deref(),
        description.as_deref(),
    );

    let merchant_product_code = sku
        .clone()
        .or_else(|| ean.clone())
        .or_else(|| mpn.clone())
        .unwrap_or_else(|| normalize_key_text(&title));

    Some(FeedRecord {
        title,
        description,
        ean,
        mpn,
        sku,
        merchant_product_code,
        price,
        original_price,
        discount_pct,
        availability,
        stock_qty,
        image_url,
        additional_images,
        product_url,
        brand,
        category,
        category_path,
        color,
        size,
        specifications,
        search_text,
    })
}

fn is_mapped_tag(name: &str) -> bool {
    ALL_MAPPED_TAGS
        .iter()
        .any(|tags| tags.contains(&name))
}

/* =========================
 * Field derivation helpers
 * ========================= */

/// Strip everything but digits and separators, normalize the decimal
/// separator, parse as f64. Unparseable text yields None.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    cleaned.replace(',', ".").parse().ok()
}

/// Integer stock parse; "available"-like text coerces to 1.
fn parse_stock(raw: &str) -> Option<i64> {
    if let Ok(n) = raw.trim().parse::<i64>() {
        return (n >= 0).then_some(n);
    }
    let lower = raw.to_lowercase();
    const AVAILABLE_WORDS: &[&str] = &["available", "in stock", "διαθέσιμο", "disponible"];
    if AVAILABLE_WORDS.iter().any(|w| lower.contains(w)) {
        Some(1)
    } else {
        None
    }
}

/// Split a possibly separator-delimited image field; keep absolute URLs only.
fn split_image_urls(raw: &str) -> (Option<String>, Vec<String>) {
    let mut valid: Vec<String> = raw
        .split([',', ';', '|'])
        .map(str::trim)
        .filter(|u| !u.is_empty() && is_absolute_url(u))
        .map(str::to_string)
        .collect();

    if valid.is_empty() {
        (None, Vec::new())
    } else {
        let main = valid.remove(0);
        (Some(main), valid)
    }
}

fn is_absolute_url(raw: &str) -> bool {
    url::Url::parse(raw).is_ok_and(|u| u.has_host())
}

/// Split a path-like category string on the common separators.
fn split_category_path(raw: &str) -> Vec<String> {
    raw.split(['>', '/', '-', '|'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_search_text(
    title: &str,
    brand: Option<&str>,
    category: Option<&str>,
    ean: Option<&str>,
    mpn: Option<&str>,
    description: Option<&str>,
) -> String {
    let mut parts: Vec<&str> = vec![title];
    parts.extend(brand);
    parts.extend(category);
    parts.extend(ean);
    parts.extend(mpn);

    let desc_head: String = description
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    if !desc_head.is_empty() {
        return truncate_chars(&format!("{} {}", parts.join(" "), desc_head), 1000);
    }
    truncate_chars(&parts.join(" "), 1000)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Lowercase, drop punctuation, collapse whitespace runs to single spaces.
/// This is the title component of the cross-shop grouping key.
pub fn normalize_key_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for ch in s.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else if ch.is_whitespace() {
            pending_space = true;
        }
        // punctuation is dropped outright
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mywebstore>
  <products>
    <product>
      <title>Apple iPhone 15 Pro 128GB</title>
      <price_with_vat>1.099,00 €</price_with_vat>
      <original_price>1199,00</original_price>
      <instock>διαθέσιμο</instock>
      <ean>0195949037890</ean>
      <sku>IP15P-128</sku>
      <manufacturer>Apple</manufacturer>
      <category>Electronics &gt; Mobile Phones &gt; Smartphones</category>
      <image>https://shop.example/ip15.jpg, https://shop.example/ip15-2.jpg</image>
      <link>https://shop.example/p/ip15</link>
      <warranty>2 years</warranty>
    </product>
    <product>
      <price>10</price>
    </product>
    <item>
      <name>USB-C Cable</name>
      <price>9,90</price>
      <quantity>0</quantity>
    </item>
  </products>
</mywebstore>"#;

    #[test]
    fn parse_is_deterministic() {
        let a = parse_feed(FEED);
        let b = parse_feed(FEED);
        assert_eq!(a.records, b.records);
        assert_eq!(a.skipped, b.skipped);
    }

    #[test]
    fn records_without_title_are_dropped() {
        let parsed = parse_feed(FEED);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn fields_resolve_and_derive() {
        let parsed = parse_feed(FEED);
        let p = &parsed.records[0];

        assert_eq!(p.title, "Apple iPhone 15 Pro 128GB");
        assert_eq!(p.ean.as_deref(), Some("0195949037890"));
        assert_eq!(p.sku.as_deref(), Some("IP15P-128"));
        assert_eq!(p.merchant_product_code, "IP15P-128");
        assert_eq!(p.brand.as_deref(), Some("Apple"));
        assert!(p.availability);
        assert_eq!(p.stock_qty, Some(1)); // inferred from availability

        // "1.099,00" has two separators after normalization and fails to parse
        assert_eq!(p.price, None);
        assert_eq!(p.original_price, Some(1199.0));
        assert_eq!(p.discount_pct, None);

        assert_eq!(p.category.as_deref(), Some("Smartphones"));
        assert_eq!(
            p.category_path,
            vec!["Electronics", "Mobile Phones", "Smartphones"]
        );

        assert_eq!(p.image_url.as_deref(), Some("https://shop.example/ip15.jpg"));
        assert_eq!(p.additional_images, vec!["https://shop.example/ip15-2.jpg"]);

        assert_eq!(p.specifications.get("warranty").map(String::as_str), Some("2 years"));
        assert!(!p.specifications.contains_key("price_with_vat"));
    }

    #[test]
    fn item_elements_and_zero_stock() {
        let parsed = parse_feed(FEED);
        let cable = &parsed.records[1];
        assert_eq!(cable.title, "USB-C Cable");
        assert_eq!(cable.price, Some(9.9));
        assert_eq!(cable.stock_qty, Some(0));
        assert!(!cable.availability);
        // no sku/ean/mpn: identity falls back to the normalized title
        assert_eq!(cable.merchant_product_code, "usb c cable");
    }

    #[test]
    fn price_parsing_edge_cases() {
        assert_eq!(parse_price("€ 49.90"), Some(49.9));
        assert_eq!(parse_price("49,90 EUR"), Some(49.9));
        assert_eq!(parse_price("1299"), Some(1299.0));
        assert_eq!(parse_price("call us"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn discount_requires_higher_original() {
        let xml = r#"<root><product>
            <title>TV</title><price>80</price><original_price>100</original_price>
        </product></root>"#;
        let p = &parse_feed(xml).records[0];
        assert_eq!(p.discount_pct, Some(20.0));

        let xml = r#"<root><product>
            <title>TV</title><price>100</price><original_price>80</original_price>
        </product></root>"#;
        let p = &parse_feed(xml).records[0];
        assert_eq!(p.discount_pct, None);
    }

    #[test]
    fn textual_stock_coerces_to_one() {
        let xml = r#"<root><product>
            <title>Mouse</title><quantity>In Stock</quantity>
        </product></root>"#;
        let p = &parse_feed(xml).records[0];
        assert_eq!(p.stock_qty, Some(1));
        assert!(p.availability);
    }

    #[test]
    fn relative_image_urls_are_rejected() {
        let xml = r#"<root><product>
            <title>Mouse</title><image>/img/mouse.jpg; https://shop.example/mouse.jpg</image>
        </product></root>"#;
        let p = &parse_feed(xml).records[0];
        assert_eq!(p.image_url.as_deref(), Some("https://shop.example/mouse.jpg"));
        assert!(p.additional_images.is_empty());
    }

    #[test]
    fn search_text_is_capped() {
        let long_desc = "x".repeat(500);
        let xml = format!(
            "<root><product><title>{}</title><description>{}</description></product></root>",
            "t".repeat(900),
            long_desc
        );
        let p = &parse_feed(&xml).records[0];
        // 900 title chars + separator + description head, capped at 1000
        assert_eq!(p.search_text.chars().count(), 1000);
        assert!(p.search_text.ends_with(&"x".repeat(99)));
    }

    #[test]
    fn normalize_key_text_strips_punctuation() {
        assert_eq!(normalize_key_text("Apple iPhone-15 (Pro)!"), "apple iphone15 pro");
        assert_eq!(normalize_key_text("  Samsung   TV  "), "samsung tv");
    }
}
