//! Portal URL synthesizers and adapters for MercadoLibre and InfoCasas.
//!
//! Adapter operations never raise toward the pipeline: failures are logged,
//! optionally snapshotted, and degrade to empty/None results.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

use mirador_core::{
    canonicalize_url, parse_range, Condition, ListingAttributes, ListingDraft, Portal,
    ResultTotal, SearchFilters,
};
use mirador_storage::{HttpFetcher, SnapshotStore};

pub const CRATE_NAME: &str = "mirador-adapters";

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTML substrings that indicate a captcha or rate-limit interstitial.
const CAPTCHA_INDICATORS: &[&str] = &[
    "captcha",
    "robot",
    "verificaci",
    "blocked",
    "security",
    "too many requests",
    "rate limit",
    "forbidden",
];

/// Slug form used inside portal URL paths.
pub fn normalize_url_segment(text: &str) -> String {
    mirador_match::normalize(text).replace([' ', '_'], "-")
}

fn push_range_segment(
    segments: &mut Vec<String>,
    name: &str,
    min: Option<u64>,
    max: Option<u64>,
    unit: &str,
) {
    if min == Some(0) && max == Some(0) {
        segments.push(format!("_{name}_0{unit}-0{unit}"));
        return;
    }
    if min.is_some() || max.is_some() {
        let min_str = min.map(|v| v.to_string()).unwrap_or_else(|| "0".to_string());
        let max_str = max.map(|v| v.to_string()).unwrap_or_else(|| "0".to_string());
        segments.push(format!("_{name}_{min_str}{unit}-{max_str}{unit}"));
    }
}

/// MercadoLibre search URL. The segment order and filter-token spelling are
/// load-bearing; pagination and count extraction break on any deviation.
pub fn build_mercadolibre_url(filters: &SearchFilters) -> String {
    let base = "https://listado.mercadolibre.com.uy/inmuebles/";
    let mut path_parts: Vec<String> = Vec::new();
    let mut filter_segments: Vec<String> = Vec::new();

    if let Some(property_type) = filters.property_type {
        path_parts.push(property_type.plural_segment().to_string());
    }
    if let Some(operation) = filters.operation {
        path_parts.push(operation.path_word().to_string());
    }

    // Zero bedroom bounds carry no information in this grammar.
    let bedrooms_min = filters.bedrooms_min.filter(|n| *n > 0);
    let bedrooms_max = filters.bedrooms_max.filter(|n| *n > 0);
    match (bedrooms_min, bedrooms_max) {
        (Some(min), Some(max)) if min == max => path_parts.push(format!("{min}-dormitorios")),
        (Some(min), Some(max)) => path_parts.push(format!("{min}-a-{max}-dormitorios")),
        (Some(min), None) => path_parts.push(format!("{min}-o-mas-dormitorios")),
        _ => {}
    }

    if let Some(department) = &filters.department {
        path_parts.push(normalize_url_segment(department));
        if filters.department_is_capital() {
            if let Some(city) = &filters.city {
                path_parts.push(normalize_url_segment(city));
            }
        }
    }

    let currency_code = filters
        .currency
        .map(|c| c.code())
        .unwrap_or("USD");
    push_range_segment(
        &mut filter_segments,
        "PriceRange",
        filters.price_min,
        filters.price_max,
        currency_code,
    );
    push_range_segment(
        &mut filter_segments,
        "FULL*BATHROOMS",
        filters.baths_min.map(u64::from),
        filters.baths_max.map(u64::from),
        "",
    );

    if filters.furnished {
        filter_segments.push("_FURNISHED_242085".to_string());
    }
    if filters.terrace {
        filter_segments.push("_HAS*TERRACE_242085".to_string());
    }
    if filters.ac {
        filter_segments.push("_HAS*AIR*CONDITIONING_242085".to_string());
    }
    if filters.pool {
        filter_segments.push("_HAS*SWIMMING*POOL_242085".to_string());
    }
    if filters.garden {
        filter_segments.push("_HAS*GARDEN_242085".to_string());
    }
    if filters.elevator {
        filter_segments.push("_HAS*LIFT_242085".to_string());
    }

    filter_segments.push("_NoIndex_True".to_string());

    push_range_segment(
        &mut filter_segments,
        "PARKING*LOTS",
        filters.parking_min.map(u64::from),
        filters.parking_max.map(u64::from),
        "",
    );
    push_range_segment(
        &mut filter_segments,
        "PROPERTY*AGE",
        filters.age_min.map(u64::from),
        filters.age_max.map(u64::from),
        "",
    );
    push_range_segment(
        &mut filter_segments,
        "TOTAL*AREA",
        filters.total_area_min.map(u64::from),
        filters.total_area_max.map(u64::from),
        "",
    );
    push_range_segment(
        &mut filter_segments,
        "COVERED*AREA",
        filters.covered_area_min.map(u64::from),
        filters.covered_area_max.map(u64::from),
        "",
    );

    match filters.condition {
        Some(Condition::New) => filter_segments.push("_ITEM*CONDITION_2230284".to_string()),
        Some(Condition::Used) => filter_segments.push("_ITEM*CONDITION_2230581".to_string()),
        None => {}
    }

    let mut path_str = path_parts.join("/");
    if !path_str.is_empty() {
        path_str.push('/');
    }
    format!("{base}{path_str}{}", filter_segments.concat())
}

fn enumeration_phrase(min: u32, max: u32, singular: &str, plural: &str) -> String {
    if min == max {
        let word = if min == 1 { singular } else { plural };
        return format!("{min}-{word}");
    }
    let numbers: Vec<String> = (min..=max).map(|n| n.to_string()).collect();
    format!("{}-{}", numbers.join("-y-"), plural)
}

fn room_phrase(
    min: Option<u32>,
    max: Option<u32>,
    singular: &str,
    plural: &str,
    zero_word: Option<&str>,
) -> Option<String> {
    if min == Some(0) && max == Some(0) {
        return zero_word.map(str::to_string);
    }
    match (min, max) {
        (Some(min), Some(max)) if min <= max => Some(enumeration_phrase(min, max, singular, plural)),
        (Some(min), None) => Some(format!("{min}-o-mas-{plural}")),
        (None, Some(max)) if max >= 1 => Some(enumeration_phrase(1, max, singular, plural)),
        _ => None,
    }
}

/// InfoCasas search URL: one hierarchical path, optional `searchstring`
/// query with dash-joined normalized keywords.
pub fn build_infocasas_url(filters: &SearchFilters, keywords: &[String]) -> String {
    let base = "https://www.infocasas.com.uy";
    let mut segments: Vec<String> = Vec::new();

    if let Some(operation) = filters.operation {
        segments.push(operation.path_word().to_string());
    }
    if let Some(property_type) = filters.property_type {
        segments.push(property_type.plural_segment().to_string());
    }
    if let Some(department) = &filters.department {
        segments.push(normalize_url_segment(department));
        if filters.department_is_capital() {
            if let Some(city) = &filters.city {
                segments.push(normalize_url_segment(city));
            }
        }
    }

    if let Some(phrase) = room_phrase(
        filters.bedrooms_min,
        filters.bedrooms_max,
        "dormitorio",
        "dormitorios",
        Some("monoambiente"),
    ) {
        segments.push(phrase);
    }
    if let Some(phrase) = room_phrase(filters.baths_min, filters.baths_max, "bano", "banos", None) {
        segments.push(phrase);
    }

    let feature_phrases: [(bool, &str); 11] = [
        (filters.furnished, "amoblado"),
        (filters.terrace, "con-terraza"),
        (filters.ac, "con-aire-acondicionado"),
        (filters.pool, "con-piscina"),
        (filters.garden, "con-jardin"),
        (filters.elevator, "con-ascensor"),
        (filters.bbq, "con-parrillero"),
        (filters.wood_stove, "con-estufa-a-lena"),
        (filters.gym, "con-gimnasio"),
        (filters.laundry, "con-lavadero"),
        (filters.heating, "con-calefaccion"),
    ];
    for (enabled, phrase) in feature_phrases {
        if enabled {
            segments.push(phrase.to_string());
        }
    }

    if let Some(estate) = filters.estate {
        segments.push(estate.path_word().to_string());
    }
    if let Some(floor) = filters.floor {
        segments.push(floor.path_word().to_string());
    }

    let has_price = filters.price_min.is_some() || filters.price_max.is_some();
    if let Some(min) = filters.price_min {
        segments.push(format!("desde-{min}"));
    }
    if let Some(max) = filters.price_max {
        segments.push(format!("hasta-{max}"));
    }
    if has_price {
        let currency = filters.currency.map(|c| c.path_word()).unwrap_or("dolares");
        segments.push(currency.to_string());
    }

    if let Some(min) = filters.total_area_min {
        segments.push(format!("m2-desde-{min}"));
    }
    if let Some(max) = filters.total_area_max {
        segments.push(format!("m2-hasta-{max}"));
    }

    if let Some(age) = filters.publication_age {
        segments.push(age.path_word().to_string());
    }

    let mut out = format!("{base}/{}", segments.join("/"));
    if !keywords.is_empty() {
        let joined = keywords
            .iter()
            .map(|k| normalize_url_segment(k))
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if !joined.is_empty() {
            out.push_str("?searchstring=");
            out.push_str(&joined);
        }
    }
    out
}

/// MercadoLibre path filter mirroring the portal's robots rules.
pub fn mercadolibre_path_disallowed(listing_url: &str) -> bool {
    let path = match Url::parse(listing_url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => listing_url.to_string(),
    };
    if path.starts_with("/MLU-") {
        return false;
    }
    ["/jms/", "/adn/api"]
        .iter()
        .any(|banned| path.starts_with(banned))
}

/// Scans the first 2 KB of a rendered page for block indicators.
pub fn sniff_captcha(html: &str) -> Vec<&'static str> {
    let sample: String = html.chars().take(2000).collect::<String>().to_lowercase();
    CAPTCHA_INDICATORS
        .iter()
        .copied()
        .filter(|ind| sample.contains(ind))
        .collect()
}

fn count_digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\d.,]+").expect("static regex"))
}

fn results_phrase_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,3}(?:[.,]\d{3})+|\d+)\s*resultados?").expect("static regex")
    })
}

fn infocasas_total_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"de\s*(más\s*de\s*\d+|\d+(?:\.\d+)*)\s*resultado").expect("static regex")
    })
}

fn more_than_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"más\s*de\s*(\d+)").expect("static regex"))
}

fn parse_count_text(text: &str) -> Option<u64> {
    let raw = count_digits_regex().find(text)?.as_str();
    raw.replace(['.', ','], "").parse().ok()
}

fn selector(input: &str) -> Option<Selector> {
    Selector::parse(input).ok()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn select_first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .map(element_text)
        .find(|t| !t.is_empty())
}

/// Total extracted from a MercadoLibre results page, counter selectors
/// first, then a results phrase, then embedded JSON counters.
pub fn parse_mercadolibre_total(html: &str) -> Option<u64> {
    let document = Html::parse_document(html);
    const COUNTER_SELECTORS: &[&str] = &[
        ".ui-search-search-result__quantity-results",
        ".ui-search-results__quantity-results",
        ".ui-search-breadcrumb__title",
        ".ui-search-results-header__title",
        "[class*='quantity-results']",
        "[class*='results-quantity']",
    ];
    for css in COUNTER_SELECTORS {
        if let Some(text) = select_first_text(&document, css) {
            if let Some(total) = parse_count_text(&text) {
                return Some(total);
            }
        }
    }

    let full_text = document.root_element().text().collect::<Vec<_>>().join(" ");
    if let Some(caps) = results_phrase_regex().captures(&full_text) {
        if let Some(total) = parse_count_text(&caps[1]) {
            return Some(total);
        }
    }

    for pattern in [
        r#""quantity"\s*:\s*(\d+)"#,
        r#""total"\s*:\s*(\d+)"#,
        r#""numberOfItems"\s*:\s*(\d+)"#,
    ] {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(caps) = re.captures(html) {
                if let Ok(total) = caps[1].parse() {
                    return Some(total);
                }
            }
        }
    }
    None
}

/// Total from an InfoCasas results page; the portal caps large counts with
/// a "más de N" phrase which is kept as a sentinel.
pub fn parse_infocasas_total(html: &str) -> Option<ResultTotal> {
    let document = Html::parse_document(html);
    let text = select_first_text(&document, "div.search-result-display")?;
    let caps = infocasas_total_regex().captures(&text)?;
    let number_str = &caps[1];
    if let Some(more) = more_than_regex().captures(number_str) {
        return more[1].parse().ok().map(ResultTotal::MoreThan);
    }
    number_str.replace('.', "").parse().ok().map(ResultTotal::Exact)
}

/// Union of canonical listing URLs plus first-seen titles from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestedPage {
    pub urls: BTreeSet<String>,
    pub titles: BTreeMap<String, String>,
}

impl HarvestedPage {
    fn insert(&mut self, url: String, title: Option<String>) {
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            self.titles.entry(url.clone()).or_insert(title);
        }
        self.urls.insert(url);
    }
}

pub fn parse_mercadolibre_list_page(html: &str) -> HarvestedPage {
    let mut page = HarvestedPage::default();
    let document = Html::parse_document(html);
    let (Some(item_sel), Some(title_link_sel), Some(search_link_sel), Some(title_wrapper_sel)) = (
        selector("li.ui-search-layout__item"),
        selector("a.poly-component__title"),
        selector("a.ui-search-link"),
        selector("h2.poly-component__title-wrapper"),
    ) else {
        return page;
    };

    for item in document.select(&item_sel) {
        let link = item
            .select(&title_link_sel)
            .next()
            .or_else(|| item.select(&search_link_sel).next());
        let Some(link) = link else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let canonical = canonicalize_url(href);
        if mercadolibre_path_disallowed(&canonical) {
            continue;
        }
        let mut title = element_text(link);
        if title.is_empty() {
            if let Some(wrapper) = item.select(&title_wrapper_sel).next() {
                title = element_text(wrapper);
            }
        }
        page.insert(canonical, Some(title));
    }
    page
}

pub fn parse_infocasas_list_page(html: &str) -> HarvestedPage {
    let mut page = HarvestedPage::default();
    let document = Html::parse_document(html);
    let (Some(container_sel), Some(link_sel)) =
        (selector("div.lc-dataWrapper"), selector("a.lc-data"))
    else {
        return page;
    };

    for container in document.select(&container_sel) {
        let Some(link) = container.select(&link_sel).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else { continue };
        let absolute = if href.starts_with('/') {
            format!("{}{href}", Portal::InfoCasas.base_url())
        } else {
            href.to_string()
        };
        page.insert(canonicalize_url(&absolute), Some(element_text(link)));
    }
    page
}

fn typed_attributes_from_features(features: &BTreeMap<String, String>) -> ListingAttributes {
    let mut attributes = ListingAttributes {
        features: features.clone(),
        ..ListingAttributes::default()
    };
    attributes.property_type = features
        .get("tipo de casa")
        .or_else(|| features.get("tipo de inmueble"))
        .or_else(|| features.get("tipo de propiedad"))
        .cloned();
    attributes.condition = features.get("condición del ítem").cloned();

    let range = |key: &str| parse_range(features.get(key).map(String::as_str).unwrap_or(""));
    (attributes.bedrooms_min, attributes.bedrooms_max) = range("dormitorios");
    (attributes.baths_min, attributes.baths_max) = range("baños");
    (attributes.total_area_min, attributes.total_area_max) = range("superficie total");
    let covered = features
        .get("área privada")
        .or_else(|| features.get("superficie cubierta"))
        .map(String::as_str)
        .unwrap_or("");
    (attributes.covered_area_min, attributes.covered_area_max) = parse_range(covered);
    (attributes.parking_min, attributes.parking_max) = range("cocheras");

    if let Some(age_text) = features.get("antigüedad") {
        attributes.age = if age_text.to_lowercase().contains("a estrenar") {
            Some(0)
        } else {
            mirador_core::extract_numbers(age_text).first().copied()
        };
    }

    let is_yes = |key: &str| features.get(key).map(|v| v.to_lowercase() == "sí");
    attributes.furnished = is_yes("amoblado");
    attributes.allows_pets = is_yes("admite mascotas");
    attributes.pool = is_yes("piscina");
    attributes.terrace = is_yes("terraza");
    attributes.garden = is_yes("jardín");
    attributes
}

/// MercadoLibre detail page. Requires the product container; returns None
/// when the structure is missing.
pub fn parse_mercadolibre_detail(html: &str, listing_url: &str) -> Option<ListingDraft> {
    let document = Html::parse_document(html);
    let container = selector("div.ui-pdp-container")?;
    document.select(&container).next()?;

    let title = select_first_text(&document, "h1.ui-pdp-title");
    let description =
        select_first_text(&document, "p.ui-pdp-description__content").unwrap_or_default();

    let mut features: BTreeMap<String, String> = BTreeMap::new();
    if let (Some(row_sel), Some(th_sel), Some(td_sel)) = (
        selector("tr.andes-table__row"),
        selector("th"),
        selector("td"),
    ) {
        for row in document.select(&row_sel) {
            let key = row.select(&th_sel).next().map(element_text);
            let value = row.select(&td_sel).next().map(element_text);
            if let (Some(key), Some(value)) = (key, value) {
                if !key.is_empty() {
                    features.insert(key.to_lowercase(), value);
                }
            }
        }
    }
    if let (Some(spec_sel), Some(span_sel)) = (
        selector("div.ui-vpp-highlighted-specs__key-value"),
        selector("span"),
    ) {
        for spec in document.select(&spec_sel) {
            let spans: Vec<String> = spec.select(&span_sel).map(element_text).collect();
            if let [key, value] = spans.as_slice() {
                features.insert(key.replace(':', "").trim().to_lowercase(), value.clone());
            }
        }
    }

    let mut attributes = typed_attributes_from_features(&features);

    if let (Some(price_sel), Some(symbol_sel), Some(fraction_sel)) = (
        selector("div.ui-pdp-price__main-container"),
        selector("span.andes-money-amount__currency-symbol"),
        selector("span.andes-money-amount__fraction"),
    ) {
        if let Some(price_container) = document.select(&price_sel).next() {
            let symbol = price_container
                .select(&symbol_sel)
                .next()
                .map(element_text)
                .unwrap_or_default();
            attributes.price_currency = match symbol.as_str() {
                "U$S" => Some("USD".to_string()),
                "$" => Some("UYU".to_string()),
                "" => None,
                other => Some(other.to_string()),
            };
            if let Some(fraction) = price_container.select(&fraction_sel).next() {
                let digits: String = element_text(fraction)
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect();
                attributes.price_amount = digits.parse().ok();
            }
        }
    }

    Some(ListingDraft {
        url: canonicalize_url(listing_url),
        title,
        description,
        attributes,
    })
}

fn infocasas_price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\d,.]+)").expect("static regex"))
}

/// InfoCasas detail page. The title is the required structural element.
pub fn parse_infocasas_detail(html: &str, listing_url: &str) -> Option<ListingDraft> {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, "h1.property-title")
        .or_else(|| select_first_text(&document, "h2.lc-title"))?;

    let description =
        select_first_text(&document, "div.property-description").unwrap_or_default();

    let mut features: BTreeMap<String, String> = BTreeMap::new();
    if let (Some(row_sel), Some(key_sel), Some(value_sel)) = (
        selector("div.technical-sheet div.ant-row"),
        selector("div:first-child span.ant-typography"),
        selector("div:last-child strong"),
    ) {
        for row in document.select(&row_sel) {
            let key = row.select(&key_sel).next().map(element_text);
            let value = row.select(&value_sel).next().map(element_text);
            if let (Some(key), Some(value)) = (key, value) {
                let key = key.replace('•', "").trim().to_lowercase();
                if !key.is_empty() {
                    features.insert(key, value);
                }
            }
        }
    }
    if let Some(facility_sel) = selector("div.property-facilities span.ant-typography") {
        for facility in document.select(&facility_sel) {
            let name = element_text(facility).replace('•', "").trim().to_lowercase();
            if !name.is_empty() {
                features.entry(name).or_insert_with(|| "sí".to_string());
            }
        }
    }
    if let Some(location) = select_first_text(&document, "span.property-location-tag p") {
        features.insert("ubicación".to_string(), location);
    }
    if let Some(expenses) = select_first_text(&document, "span.commonExpenses") {
        features.insert("gastos comunes".to_string(), expenses);
    }

    let mut attributes = typed_attributes_from_features(&features);

    if let Some(price_text) = select_first_text(&document, "p.main-price") {
        let currency = if price_text.contains("U$S") {
            Some("USD")
        } else if price_text.contains('$') {
            Some("UYU")
        } else {
            None
        };
        attributes.price_currency = currency.map(str::to_string);
        if let Some(caps) = infocasas_price_regex().captures(&price_text) {
            attributes.price_amount = caps[1].replace([',', '.'], "").parse().ok();
        }
    }

    Some(ListingDraft {
        url: canonicalize_url(listing_url),
        title: Some(title),
        description,
        attributes,
    })
}

/// Headless-render client used when plain HTTP fetches come back blocked or
/// without the structure the parsers need.
#[async_trait]
pub trait RenderedFetcher: Send + Sync {
    async fn render(&self, url: &str) -> anyhow::Result<String>;
}

/// Client for a browserless-style `/content` endpoint.
#[derive(Debug, Clone)]
pub struct BrowserlessRenderer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessRenderer {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }
}

#[async_trait]
impl RenderedFetcher for BrowserlessRenderer {
    async fn render(&self, url: &str) -> anyhow::Result<String> {
        let mut endpoint = format!("{}/content", self.base_url.trim_end_matches('/'));
        if let Some(token) = &self.token {
            endpoint = format!("{endpoint}?token={token}");
        }
        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Shared fetch resources an adapter runs with.
#[derive(Clone)]
pub struct FetchStack {
    pub fetcher: Arc<HttpFetcher>,
    pub renderer: Option<Arc<dyn RenderedFetcher>>,
    pub snapshots: Option<SnapshotStore>,
}

impl FetchStack {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            fetcher,
            renderer: None,
            snapshots: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn RenderedFetcher>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    async fn fetch_html(&self, portal_tag: &str, url: &str) -> Option<String> {
        match self.fetcher.fetch_bytes(portal_tag, url).await {
            Ok(response) => Some(String::from_utf8_lossy(&response.body).into_owned()),
            Err(err) => {
                warn!(portal_tag, url, error = %err, "http fetch failed");
                None
            }
        }
    }

    async fn snapshot(&self, portal_tag: &str, html: &str) -> Option<String> {
        let store = self.snapshots.as_ref()?;
        match store.store_page(Utc::now(), portal_tag, html.as_bytes()).await {
            Ok(stored) => Some(stored.relative_path.display().to_string()),
            Err(err) => {
                warn!(portal_tag, error = %err, "snapshot store failed");
                None
            }
        }
    }
}

/// Outcome of a result-count probe. `total` is None when both the HTTP and
/// rendered strategies failed; `diagnostic`/`snapshot_path` explain why.
#[derive(Debug, Clone, Default)]
pub struct TotalOutcome {
    pub total: Option<ResultTotal>,
    pub diagnostic: Option<String>,
    pub snapshot_path: Option<String>,
}

impl TotalOutcome {
    fn found(total: ResultTotal) -> Self {
        Self {
            total: Some(total),
            ..Self::default()
        }
    }

    fn failed(diagnostic: impl Into<String>, snapshot_path: Option<String>) -> Self {
        Self {
            total: None,
            diagnostic: Some(diagnostic.into()),
            snapshot_path,
        }
    }
}

/// One portal's crawl surface. Implementations own their fetch stack; every
/// method takes plain URLs so fakes can be injected wholesale.
#[async_trait]
pub trait PortalAdapter: Send + Sync {
    fn portal(&self) -> Portal;
    fn entry_url(&self, filters: &SearchFilters, keywords: &[String]) -> String;
    fn page_url(&self, entry_url: &str, page_index: usize) -> String;
    async fn extract_total(&self, entry_url: &str) -> TotalOutcome;
    async fn harvest_list_page(&self, page_url: &str) -> HarvestedPage;
    async fn parse_detail(&self, listing_url: &str) -> Option<ListingDraft>;
}

pub struct MercadoLibreAdapter {
    stack: FetchStack,
}

impl MercadoLibreAdapter {
    pub fn new(stack: FetchStack) -> Self {
        Self { stack }
    }

    async fn rendered_total(&self, url: &str) -> TotalOutcome {
        let Some(renderer) = &self.stack.renderer else {
            return TotalOutcome::failed("result count not found", None);
        };
        let html = match renderer.render(url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(url, error = %err, "rendered fetch failed");
                return TotalOutcome::failed(format!("rendered fetch failed: {err}"), None);
            }
        };

        let indicators = sniff_captcha(&html);
        if !indicators.is_empty() {
            let snapshot = self.stack.snapshot("mercado_libre", &html).await;
            return TotalOutcome::failed(
                format!("captcha or block detected: {}", indicators.join(", ")),
                snapshot,
            );
        }

        match parse_mercadolibre_total(&html) {
            Some(total) => TotalOutcome::found(ResultTotal::Exact(total)),
            None => {
                let snapshot = self.stack.snapshot("mercado_libre", &html).await;
                TotalOutcome::failed("result count not found in rendered page", snapshot)
            }
        }
    }
}

#[async_trait]
impl PortalAdapter for MercadoLibreAdapter {
    fn portal(&self) -> Portal {
        Portal::MercadoLibre
    }

    fn entry_url(&self, filters: &SearchFilters, _keywords: &[String]) -> String {
        build_mercadolibre_url(filters)
    }

    fn page_url(&self, entry_url: &str, page_index: usize) -> String {
        if page_index == 0 {
            return entry_url.to_string();
        }
        let offset = 1 + Portal::MercadoLibre.page_size() * page_index;
        if entry_url.contains("_NoIndex_True") {
            format!("{entry_url}_Desde_{offset}")
        } else {
            format!("{entry_url}_Desde_{offset}_NoIndex_True")
        }
    }

    async fn extract_total(&self, entry_url: &str) -> TotalOutcome {
        let base = self.portal().base_url();
        if !self.stack.fetcher.probe(base, PREFLIGHT_TIMEOUT).await {
            return TotalOutcome::failed("portal unreachable", None);
        }

        let url = if entry_url.contains("_NoIndex_True") {
            entry_url.to_string()
        } else {
            format!("{entry_url}_NoIndex_True")
        };

        if let Some(html) = self.stack.fetch_html("mercado_libre", &url).await {
            if let Some(total) = parse_mercadolibre_total(&html) {
                return TotalOutcome::found(ResultTotal::Exact(total));
            }
        }
        self.rendered_total(&url).await
    }

    async fn harvest_list_page(&self, page_url: &str) -> HarvestedPage {
        match self.stack.fetch_html("mercado_libre", page_url).await {
            Some(html) => parse_mercadolibre_list_page(&html),
            None => HarvestedPage::default(),
        }
    }

    async fn parse_detail(&self, listing_url: &str) -> Option<ListingDraft> {
        if mercadolibre_path_disallowed(listing_url) {
            return None;
        }
        let html = self.stack.fetch_html("mercado_libre", listing_url).await?;
        match parse_mercadolibre_detail(&html, listing_url) {
            Some(draft) => Some(draft),
            None => {
                if let Some(renderer) = &self.stack.renderer {
                    if let Ok(rendered) = renderer.render(listing_url).await {
                        return parse_mercadolibre_detail(&rendered, listing_url);
                    }
                }
                None
            }
        }
    }
}

pub struct InfoCasasAdapter {
    stack: FetchStack,
}

impl InfoCasasAdapter {
    pub fn new(stack: FetchStack) -> Self {
        Self { stack }
    }
}

#[async_trait]
impl PortalAdapter for InfoCasasAdapter {
    fn portal(&self) -> Portal {
        Portal::InfoCasas
    }

    fn entry_url(&self, filters: &SearchFilters, keywords: &[String]) -> String {
        build_infocasas_url(filters, keywords)
    }

    fn page_url(&self, entry_url: &str, page_index: usize) -> String {
        if page_index == 0 {
            return entry_url.to_string();
        }
        let separator = if entry_url.contains('?') { '&' } else { '?' };
        format!("{entry_url}{separator}pagina={}", page_index + 1)
    }

    async fn extract_total(&self, entry_url: &str) -> TotalOutcome {
        let base = self.portal().base_url();
        if !self.stack.fetcher.probe(base, PREFLIGHT_TIMEOUT).await {
            return TotalOutcome::failed("portal unreachable", None);
        }

        if let Some(html) = self.stack.fetch_html("info_casas", entry_url).await {
            if let Some(total) = parse_infocasas_total(&html) {
                return TotalOutcome::found(total);
            }
            let indicators = sniff_captcha(&html);
            if !indicators.is_empty() {
                let snapshot = self.stack.snapshot("info_casas", &html).await;
                return TotalOutcome::failed(
                    format!("captcha or block detected: {}", indicators.join(", ")),
                    snapshot,
                );
            }
        }

        if let Some(renderer) = &self.stack.renderer {
            match renderer.render(entry_url).await {
                Ok(html) => {
                    if let Some(total) = parse_infocasas_total(&html) {
                        return TotalOutcome::found(total);
                    }
                    let snapshot = self.stack.snapshot("info_casas", &html).await;
                    return TotalOutcome::failed(
                        "result count not found in rendered page",
                        snapshot,
                    );
                }
                Err(err) => {
                    warn!(entry_url, error = %err, "rendered fetch failed");
                    return TotalOutcome::failed(format!("rendered fetch failed: {err}"), None);
                }
            }
        }
        TotalOutcome::failed("result count not found", None)
    }

    async fn harvest_list_page(&self, page_url: &str) -> HarvestedPage {
        match self.stack.fetch_html("info_casas", page_url).await {
            Some(html) => parse_infocasas_list_page(&html),
            None => HarvestedPage::default(),
        }
    }

    async fn parse_detail(&self, listing_url: &str) -> Option<ListingDraft> {
        let html = self.stack.fetch_html("info_casas", listing_url).await?;
        parse_infocasas_detail(&html, listing_url)
    }
}
