//! Core domain model for the Mirador listing-monitoring engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mirador-core";

/// Opaque handle for a logical search; UUID-shaped by convention.
pub type SearchHandle = Uuid;

/// The portals the engine knows how to crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Portal {
    MercadoLibre,
    InfoCasas,
}

impl Portal {
    pub fn name(&self) -> &'static str {
        match self {
            Portal::MercadoLibre => "MercadoLibre",
            Portal::InfoCasas => "InfoCasas",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Portal::MercadoLibre => "https://www.mercadolibre.com.uy",
            Portal::InfoCasas => "https://www.infocasas.com.uy",
        }
    }

    /// Listings per results page, a portal constant.
    pub fn page_size(&self) -> usize {
        match self {
            Portal::MercadoLibre => 48,
            Portal::InfoCasas => 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalSelection {
    MercadoLibre,
    InfoCasas,
    Both,
}

impl PortalSelection {
    pub fn portals(&self) -> &'static [Portal] {
        match self {
            PortalSelection::MercadoLibre => &[Portal::MercadoLibre],
            PortalSelection::InfoCasas => &[Portal::InfoCasas],
            PortalSelection::Both => &[Portal::MercadoLibre, Portal::InfoCasas],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sale,
    Rent,
}

impl Operation {
    /// Spanish path word used by both portal URL grammars.
    pub fn path_word(&self) -> &'static str {
        match self {
            Operation::Sale => "venta",
            Operation::Rent => "alquiler",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Commercial,
    Land,
    Office,
    Warehouse,
    KeyMoney,
    Other,
}

impl PropertyType {
    /// Plural path segment as the portals spell it.
    pub fn plural_segment(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "apartamentos",
            PropertyType::House => "casas",
            PropertyType::Commercial => "locales-comerciales",
            PropertyType::Land => "terrenos",
            PropertyType::Office => "oficinas",
            PropertyType::Warehouse => "depositos-galpones",
            PropertyType::KeyMoney => "llave-negocio",
            PropertyType::Other => "otros",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Uyu,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Uyu => "UYU",
        }
    }

    pub fn path_word(&self) -> &'static str {
        match self {
            Currency::Usd => "dolares",
            Currency::Uyu => "pesos",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    New,
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estate {
    InPozo,
    UnderConstruction,
    BrandNew,
    Used,
}

impl Estate {
    pub fn path_word(&self) -> &'static str {
        match self {
            Estate::InPozo => "en-pozo",
            Estate::UnderConstruction => "en-construccion",
            Estate::BrandNew => "a-estrenar",
            Estate::Used => "usados",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloorLevel {
    GroundFloor,
    Penthouse,
}

impl FloorLevel {
    pub fn path_word(&self) -> &'static str {
        match self {
            FloorLevel::GroundFloor => "planta-baja",
            FloorLevel::Penthouse => "penthouse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationAge {
    Today,
    Yesterday,
    Last7Days,
    Last15Days,
    Last30Days,
    Last45Days,
}

impl PublicationAge {
    pub fn path_word(&self) -> &'static str {
        match self {
            PublicationAge::Today => "publicados-hoy",
            PublicationAge::Yesterday => "publicados-ayer",
            PublicationAge::Last7Days => "publicados-hace-7-dias",
            PublicationAge::Last15Days => "publicados-hace-15-dias",
            PublicationAge::Last30Days => "publicados-hace-30-dias",
            PublicationAge::Last45Days => "publicados-hace-45-dias",
        }
    }
}

/// Closed filter schema shared by every URL synthesizer.
///
/// Any subset of fields may be absent; builders must yield a well-formed URL
/// for every combination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub operation: Option<Operation>,
    pub property_type: Option<PropertyType>,
    pub department: Option<String>,
    pub city: Option<String>,
    pub price_min: Option<u64>,
    pub price_max: Option<u64>,
    pub currency: Option<Currency>,
    pub bedrooms_min: Option<u32>,
    pub bedrooms_max: Option<u32>,
    pub baths_min: Option<u32>,
    pub baths_max: Option<u32>,
    pub total_area_min: Option<u32>,
    pub total_area_max: Option<u32>,
    pub covered_area_min: Option<u32>,
    pub covered_area_max: Option<u32>,
    pub parking_min: Option<u32>,
    pub parking_max: Option<u32>,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
    pub condition: Option<Condition>,
    pub furnished: bool,
    pub terrace: bool,
    pub ac: bool,
    pub pool: bool,
    pub garden: bool,
    pub elevator: bool,
    pub bbq: bool,
    pub wood_stove: bool,
    pub gym: bool,
    pub laundry: bool,
    pub heating: bool,
    pub estate: Option<Estate>,
    pub floor: Option<FloorLevel>,
    pub publication_age: Option<PublicationAge>,
}

impl SearchFilters {
    /// The capital department; the only one whose city segment is emitted.
    pub const CAPITAL_DEPARTMENT: &'static str = "Montevideo";

    pub fn department_is_capital(&self) -> bool {
        self.department
            .as_deref()
            .map(|d| d.eq_ignore_ascii_case(Self::CAPITAL_DEPARTMENT))
            .unwrap_or(false)
    }

    /// Deserializes from a JSON object, returning the filter set together
    /// with the keys that were not recognized (ignored, caller warns).
    pub fn from_json(value: &JsonValue) -> (Self, Vec<String>) {
        const KNOWN: &[&str] = &[
            "operation",
            "property_type",
            "department",
            "city",
            "price_min",
            "price_max",
            "currency",
            "bedrooms_min",
            "bedrooms_max",
            "baths_min",
            "baths_max",
            "total_area_min",
            "total_area_max",
            "covered_area_min",
            "covered_area_max",
            "parking_min",
            "parking_max",
            "age_min",
            "age_max",
            "condition",
            "furnished",
            "terrace",
            "ac",
            "pool",
            "garden",
            "elevator",
            "bbq",
            "wood_stove",
            "gym",
            "laundry",
            "heating",
            "estate",
            "floor",
            "publication_age",
        ];
        let unknown = value
            .as_object()
            .map(|map| {
                map.keys()
                    .filter(|k| !KNOWN.contains(&k.as_str()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let filters = serde_json::from_value(value.clone()).unwrap_or_default();
        (filters, unknown)
    }
}

/// Result total reported by a portal's first page.
///
/// Portals cap large counts with a "more than N" sentinel; it is kept
/// distinct instead of being coerced to a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResultTotal {
    Exact(u64),
    MoreThan(u64),
}

impl ResultTotal {
    /// Lower bound for page-count planning.
    pub fn lower_bound(&self) -> u64 {
        match self {
            ResultTotal::Exact(n) | ResultTotal::MoreThan(n) => *n,
        }
    }
}

impl fmt::Display for ResultTotal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultTotal::Exact(n) => write!(f, "{n}"),
            ResultTotal::MoreThan(n) => write!(f, "more than {n}"),
        }
    }
}

/// Typed attribute bag extracted from a detail page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingAttributes {
    /// Free-form spec-table rows, key already lower-cased by the adapter.
    pub features: BTreeMap<String, String>,
    pub property_type: Option<String>,
    pub condition: Option<String>,
    pub price_amount: Option<i64>,
    pub price_currency: Option<String>,
    pub bedrooms_min: Option<u32>,
    pub bedrooms_max: Option<u32>,
    pub baths_min: Option<u32>,
    pub baths_max: Option<u32>,
    pub total_area_min: Option<u32>,
    pub total_area_max: Option<u32>,
    pub covered_area_min: Option<u32>,
    pub covered_area_max: Option<u32>,
    pub parking_min: Option<u32>,
    pub parking_max: Option<u32>,
    pub age: Option<u32>,
    pub furnished: Option<bool>,
    pub allows_pets: Option<bool>,
    pub pool: Option<bool>,
    pub terrace: Option<bool>,
    pub garden: Option<bool>,
}

fn keep_nonempty_str(current: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming {
        if !value.trim().is_empty() {
            *current = Some(value.clone());
        }
    }
}

fn keep_some<T: Copy>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

impl ListingAttributes {
    /// Merge policy for repeated encounters: last non-empty wins per scalar,
    /// the features map is replaced wholesale when the incoming one is
    /// non-empty.
    pub fn merge_from(&mut self, incoming: &ListingAttributes) {
        if !incoming.features.is_empty() {
            self.features = incoming.features.clone();
        }
        keep_nonempty_str(&mut self.property_type, &incoming.property_type);
        keep_nonempty_str(&mut self.condition, &incoming.condition);
        keep_nonempty_str(&mut self.price_currency, &incoming.price_currency);
        keep_some(&mut self.price_amount, incoming.price_amount);
        keep_some(&mut self.bedrooms_min, incoming.bedrooms_min);
        keep_some(&mut self.bedrooms_max, incoming.bedrooms_max);
        keep_some(&mut self.baths_min, incoming.baths_min);
        keep_some(&mut self.baths_max, incoming.baths_max);
        keep_some(&mut self.total_area_min, incoming.total_area_min);
        keep_some(&mut self.total_area_max, incoming.total_area_max);
        keep_some(&mut self.covered_area_min, incoming.covered_area_min);
        keep_some(&mut self.covered_area_max, incoming.covered_area_max);
        keep_some(&mut self.parking_min, incoming.parking_min);
        keep_some(&mut self.parking_max, incoming.parking_max);
        keep_some(&mut self.age, incoming.age);
        keep_some(&mut self.furnished, incoming.furnished);
        keep_some(&mut self.allows_pets, incoming.allows_pets);
        keep_some(&mut self.pool, incoming.pool);
        keep_some(&mut self.terrace, incoming.terrace);
        keep_some(&mut self.garden, incoming.garden);
    }

    /// Feature values joined for keyword scanning ("key: value" lines).
    pub fn features_text(&self) -> String {
        self.features
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Detail-page handoff contract from adapters into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub url: String,
    pub title: Option<String>,
    pub description: String,
    pub attributes: ListingAttributes,
}

impl ListingDraft {
    /// Full searchable text for keyword evaluation.
    pub fn match_text(&self) -> String {
        format!(
            "{} {} {}",
            self.title.as_deref().unwrap_or_default(),
            self.description,
            self.attributes.features_text()
        )
    }
}

/// Canonical persisted listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub canonical_url: String,
    pub portal: Portal,
    pub title: Option<String>,
    pub description: String,
    pub attributes: ListingAttributes,
}

impl ListingRecord {
    pub fn match_text(&self) -> String {
        format!(
            "{} {} {}",
            self.title.as_deref().unwrap_or_default(),
            self.description,
            self.attributes.features_text()
        )
    }
}

/// Stored search definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub id: SearchHandle,
    pub name: Option<String>,
    pub original_text: String,
    pub filters: SearchFilters,
    pub is_saved: bool,
    pub created_at: DateTime<Utc>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// Shared keyword row; one per canonical (normalized) text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRecord {
    pub canonical_text: String,
    pub language: String,
    pub variants: Vec<String>,
}

/// Per-(search, listing) verdict with refresh bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResultRecord {
    pub search_id: SearchHandle,
    pub canonical_url: String,
    pub matches: bool,
    pub last_seen_at: DateTime<Utc>,
    pub seen_count: u32,
    pub metadata: JsonValue,
}

/// One entry of the final matched list streamed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedItem {
    pub title: Option<String>,
    pub url: String,
}

/// Matched items split by how they were resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    /// Resolved via a Phase 2 detail fetch this run.
    pub new: Vec<MatchedItem>,
    /// Re-evaluated from stored content without re-fetching.
    pub existing: Vec<MatchedItem>,
}

/// Progress record streamed to the sink; every field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_found: Option<ResultTotal>,
    /// Rough remaining seconds for the current phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_search_item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_items_found: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_publications: Option<Vec<MatchedItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_matched_properties: Option<MatchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_screenshot: Option<String>,
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self {
            current_search_item: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            final_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn total(total: ResultTotal) -> Self {
        Self {
            total_found: Some(total),
            ..Self::default()
        }
    }
}

/// Listing identity: the harvested URL with fragment and query stripped.
pub fn canonicalize_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment)
        .to_string()
}

/// All decimal runs in `text`, in order.
pub fn extract_numbers(text: &str) -> Vec<u32> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<u32>() {
                out.push(v);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<u32>() {
            out.push(v);
        }
    }
    out
}

/// Shared range parser for spec-table values.
///
/// `"monoambiente"` → `(0, 0)`; one number → `(n, n)`; two or more →
/// `(min, max)`; no numbers → `(None, None)`.
pub fn parse_range(text: &str) -> (Option<u32>, Option<u32>) {
    let lower = text.to_lowercase();
    if lower.contains("monoambiente") {
        return (Some(0), Some(0));
    }
    let numbers = extract_numbers(&lower);
    match numbers.as_slice() {
        [] => (None, None),
        [n] => (Some(*n), Some(*n)),
        many => {
            let min = many.iter().copied().min().unwrap_or(0);
            let max = many.iter().copied().max().unwrap_or(0);
            (Some(min), Some(max))
        }
    }
}
