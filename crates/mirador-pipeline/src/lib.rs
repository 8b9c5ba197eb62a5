//! Two-phase search orchestrator: harvest, dedup split, detail evaluation,
//! saved-search refresh and the periodic refresh scheduler.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use mirador_adapters::{HarvestedPage, PortalAdapter};
use mirador_core::{
    KeywordRecord, ListingDraft, ListingRecord, MatchSummary, MatchedItem, Portal,
    PortalSelection, ProgressEvent, ResultTotal, SearchFilters, SearchHandle, SearchRecord,
};
use mirador_match::{group_hit, normalize, split_raw_keywords, Lexicon, VariantGroup};
use mirador_storage::{CatalogStore, KeywordVerdict, SearchStats};

pub const CRATE_NAME: &str = "mirador-pipeline";

/// Seconds of estimated work per pending detail fetch.
const SECONDS_PER_DETAIL: u64 = 20;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_pages: usize,
    pub workers_phase1: usize,
    pub workers_phase2: usize,
    pub scheduler_enabled: bool,
    pub refresh_cron_1: String,
    pub refresh_cron_2: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages: 3,
            workers_phase1: 2,
            workers_phase2: 4,
            scheduler_enabled: false,
            refresh_cron_1: "0 6 * * *".to_string(),
            refresh_cron_2: "0 18 * * *".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let parse_usize = |key: &str, default: usize| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            max_pages: parse_usize("MIRADOR_MAX_PAGES", 3),
            workers_phase1: parse_usize("MIRADOR_WORKERS_PHASE1", 2),
            workers_phase2: parse_usize("MIRADOR_WORKERS_PHASE2", 4),
            scheduler_enabled: std::env::var("MIRADOR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron_1: std::env::var("MIRADOR_REFRESH_CRON_1")
                .unwrap_or_else(|_| "0 6 * * *".to_string()),
            refresh_cron_2: std::env::var("MIRADOR_REFRESH_CRON_2")
                .unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }
}

/// Event outlet. `emit` must not block and must not fail toward the caller.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

#[derive(Debug, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Forwards events into an unbounded channel; a dropped receiver is fine.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Debug, Default)]
struct BufferState {
    events: Vec<ProgressEvent>,
    matched: Option<Vec<MatchedItem>>,
    summary: Option<MatchSummary>,
}

/// Retains every event plus the latest matched-item payloads so completion
/// handlers can reuse them without re-matching.
#[derive(Debug, Default)]
pub struct BufferingSink {
    state: StdMutex<BufferState>,
}

impl BufferingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.state.lock().expect("sink mutex poisoned").events.clone()
    }

    pub fn captured_matched(&self) -> Option<Vec<MatchedItem>> {
        self.state.lock().expect("sink mutex poisoned").matched.clone()
    }

    pub fn captured_summary(&self) -> Option<MatchSummary> {
        self.state.lock().expect("sink mutex poisoned").summary.clone()
    }
}

impl ProgressSink for BufferingSink {
    fn emit(&self, event: &ProgressEvent) {
        let mut state = self.state.lock().expect("sink mutex poisoned");
        if let Some(matched) = &event.matched_publications {
            state.matched = Some(matched.clone());
        }
        if let Some(summary) = &event.all_matched_properties {
            state.summary = Some(summary.clone());
        }
        state.events.push(event.clone());
    }
}

/// Registry of active searches and their cooperative stop flags. Workers
/// only read flags; the coordinator owns them.
#[derive(Debug, Default)]
pub struct SearchCoordinator {
    active: StdMutex<HashMap<SearchHandle, Arc<AtomicBool>>>,
}

impl SearchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SearchHandle) -> Arc<AtomicBool> {
        let mut active = self.active.lock().expect("coordinator mutex poisoned");
        active
            .entry(handle)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn unregister(&self, handle: SearchHandle) {
        let mut active = self.active.lock().expect("coordinator mutex poisoned");
        active.remove(&handle);
    }

    pub fn is_stopped(&self, handle: SearchHandle) -> bool {
        let active = self.active.lock().expect("coordinator mutex poisoned");
        active
            .get(&handle)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Idempotent; a second stop for the same handle is a no-op.
    pub fn request_stop(&self, handle: SearchHandle) {
        let active = self.active.lock().expect("coordinator mutex poisoned");
        if let Some(flag) = active.get(&handle) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("coordinator mutex poisoned").len()
    }
}

/// Pre-pipeline admission control; enforced by callers, never by the
/// pipeline itself.
pub trait RateLimitGate: Send + Sync {
    fn check(&self, user: &str, action: &str, handle: Option<SearchHandle>) -> (bool, String);
}

#[derive(Debug, Default)]
pub struct AllowAllGate;

impl RateLimitGate for AllowAllGate {
    fn check(&self, _user: &str, _action: &str, _handle: Option<SearchHandle>) -> (bool, String) {
        (true, String::new())
    }
}

/// Sliding-window counter: at most `max_actions` per (user, action) pair
/// within `window`.
pub struct ActionWindowGate {
    max_actions: usize,
    window: Duration,
    seen: StdMutex<HashMap<(String, String), Vec<Instant>>>,
}

impl ActionWindowGate {
    pub fn new(max_actions: usize, window: Duration) -> Self {
        Self {
            max_actions,
            window,
            seen: StdMutex::new(HashMap::new()),
        }
    }
}

impl RateLimitGate for ActionWindowGate {
    fn check(&self, user: &str, action: &str, _handle: Option<SearchHandle>) -> (bool, String) {
        let mut seen = self.seen.lock().expect("gate mutex poisoned");
        let stamps = seen
            .entry((user.to_string(), action.to_string()))
            .or_default();
        let now = Instant::now();
        stamps.retain(|stamp| now.duration_since(*stamp) < self.window);
        if stamps.len() >= self.max_actions {
            return (
                false,
                format!(
                    "limit reached: at most {} {action} actions per window",
                    self.max_actions
                ),
            );
        }
        stamps.push(now);
        (true, String::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TranslatedQuery {
    pub filters: SearchFilters,
    pub keywords: Vec<String>,
    pub remaining_text: String,
}

/// Natural-language front door; failures degrade to manual filters.
pub trait QueryTranslator: Send + Sync {
    fn translate(&self, text: &str) -> Result<TranslatedQuery>;
}

/// Treats the whole text as keywords and leaves filters empty.
#[derive(Debug, Default)]
pub struct PassthroughTranslator;

impl QueryTranslator for PassthroughTranslator {
    fn translate(&self, text: &str) -> Result<TranslatedQuery> {
        Ok(TranslatedQuery {
            filters: SearchFilters::default(),
            keywords: split_raw_keywords(text),
            remaining_text: String::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub filters: SearchFilters,
    pub keywords: Vec<String>,
    pub max_pages: usize,
    pub workers_phase1: usize,
    pub workers_phase2: usize,
    pub search_handle: SearchHandle,
    pub portals: PortalSelection,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Listings satisfying every keyword group, sorted by canonical URL.
    pub matched: Vec<MatchedItem>,
    /// Everything harvested this run, sorted by canonical URL.
    pub all: Vec<MatchedItem>,
    pub summary: MatchSummary,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub success: bool,
    pub stats: Option<SearchStats>,
    pub error: Option<String>,
}

/// One logical search executed across the configured portals.
pub struct SearchPipeline {
    config: PipelineConfig,
    catalog: Arc<dyn CatalogStore>,
    adapters: Vec<Arc<dyn PortalAdapter>>,
    lexicon: Lexicon,
    coordinator: Arc<SearchCoordinator>,
    sink: Arc<dyn ProgressSink>,
}

impl SearchPipeline {
    pub fn new(
        config: PipelineConfig,
        catalog: Arc<dyn CatalogStore>,
        adapters: Vec<Arc<dyn PortalAdapter>>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            catalog,
            adapters,
            lexicon: Lexicon::default(),
            coordinator: Arc::new(SearchCoordinator::new()),
            sink,
        }
    }

    pub fn with_lexicon(mut self, lexicon: Lexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<SearchCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn coordinator(&self) -> &Arc<SearchCoordinator> {
        &self.coordinator
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    fn adapter_for(&self, portal: Portal) -> Option<Arc<dyn PortalAdapter>> {
        self.adapters.iter().find(|a| a.portal() == portal).cloned()
    }

    async fn ensure_search_row(&self, request: &SearchRequest) -> Result<()> {
        if self.catalog.get_search(request.search_handle).await?.is_some() {
            return Ok(());
        }
        self.catalog
            .create_search(&SearchRecord {
                id: request.search_handle,
                name: None,
                original_text: request.keywords.join(" "),
                filters: request.filters.clone(),
                is_saved: false,
                created_at: Utc::now(),
                last_refresh_at: None,
            })
            .await
    }

    /// Builds variant groups, persisting keyword rows and their link to the
    /// search so refreshes can reload them. Each request keyword is one
    /// logical keyword, multi-word phrases included; raw free text is split
    /// by the front door before it reaches the pipeline.
    async fn build_groups(&self, request: &SearchRequest) -> Result<Vec<VariantGroup>> {
        let mut words: Vec<String> = Vec::new();
        for keyword in &request.keywords {
            let word = normalize(keyword);
            if word.is_empty() || words.contains(&word) {
                continue;
            }
            words.push(word);
        }
        for word in &words {
            let record = KeywordRecord {
                canonical_text: word.clone(),
                language: "es".to_string(),
                variants: Vec::new(),
            };
            self.catalog.get_or_create_keyword(&record).await?;
            self.catalog
                .link_search_keyword(request.search_handle, &record.canonical_text)
                .await?;
        }

        let stored = self.catalog.keywords_for_search(request.search_handle).await?;
        Ok(stored
            .iter()
            .map(|record| VariantGroup::expand(&record.canonical_text, &record.variants, &self.lexicon))
            .filter(|group| !group.canonical.is_empty())
            .collect())
    }

    /// Strict conjunction over groups with the per-(keyword, listing)
    /// verdict cache; the first successful rule is the one recorded.
    async fn evaluate_listing(
        &self,
        groups: &[VariantGroup],
        text: &str,
        canonical_url: &str,
    ) -> bool {
        let text_norm = normalize(text);
        for group in groups {
            let cached = self
                .catalog
                .keyword_verdict(&group.canonical, canonical_url)
                .await
                .unwrap_or(None);
            let satisfied = match cached {
                Some(verdict) => verdict.matches,
                None => {
                    let hit = group_hit(&text_norm, group, &self.lexicon.morphology);
                    let verdict = KeywordVerdict {
                        matches: hit.is_some(),
                        matched_variant: hit.as_ref().map(|(variant, _)| variant.clone()),
                        rule: hit.as_ref().map(|(_, rule)| rule.as_str().to_string()),
                    };
                    if let Err(err) = self
                        .catalog
                        .record_keyword_verdict(&group.canonical, canonical_url, &verdict)
                        .await
                    {
                        warn!(error = %err, "recording keyword verdict failed");
                    }
                    verdict.matches
                }
            };
            if !satisfied {
                return false;
            }
        }
        true
    }

    async fn record_match(
        &self,
        request: &SearchRequest,
        portal: Portal,
        canonical_url: &str,
        matches: bool,
        phase: &str,
    ) {
        let metadata = serde_json::json!({
            "portal": portal.name(),
            "phase": phase,
        });
        if let Err(err) = self
            .catalog
            .upsert_match_result(request.search_handle, canonical_url, matches, Utc::now(), metadata)
            .await
        {
            warn!(canonical_url, error = %err, "match result upsert failed");
        }
    }

    async fn harvest_phase(
        &self,
        adapter: &Arc<dyn PortalAdapter>,
        entry_url: &str,
        page_count: usize,
        workers: usize,
        stop: &Arc<AtomicBool>,
    ) -> HarvestedPage {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut join_set: JoinSet<(usize, HarvestedPage)> = JoinSet::new();

        for page_index in 0..page_count {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let page_url = adapter.page_url(entry_url, page_index);
            let adapter = adapter.clone();
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                if stop.load(Ordering::Relaxed) {
                    return (page_index, HarvestedPage::default());
                }
                (page_index, adapter.harvest_list_page(&page_url).await)
            });
        }

        let mut pages: Vec<(usize, HarvestedPage)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((page_index, page)) => {
                    self.sink.emit(&ProgressEvent {
                        current_search_item: Some(format!(
                            "page {}: {} listings found",
                            page_index + 1,
                            page.urls.len()
                        )),
                        page_items_found: Some(page.urls.len()),
                        ..ProgressEvent::default()
                    });
                    pages.push((page_index, page));
                }
                Err(err) => warn!(error = %err, "harvest task failed"),
            }
        }

        // First-seen title wins, in page order, independent of completion order.
        pages.sort_by_key(|(index, _)| *index);
        let mut merged = HarvestedPage::default();
        for (_, page) in pages {
            for url in page.urls {
                let title = page.titles.get(&url).cloned();
                if let Some(title) = title.filter(|t| !t.is_empty()) {
                    merged.titles.entry(url.clone()).or_insert(title);
                }
                merged.urls.insert(url);
            }
        }
        merged
    }

    fn page_count(&self, total: Option<ResultTotal>, portal: Portal, max_pages: usize) -> usize {
        match total {
            Some(total) => {
                let size = portal.page_size() as u64;
                let needed = total.lower_bound().div_ceil(size).max(1) as usize;
                needed.min(max_pages)
            }
            None => max_pages,
        }
    }

    /// Runs one search. Never returns an error: portal and storage failures
    /// degrade to smaller results and warnings.
    pub async fn run_search(&self, request: SearchRequest) -> SearchOutcome {
        let stop = self.coordinator.register(request.search_handle);
        let outcome = self.run_search_inner(&request, &stop).await;
        self.coordinator.unregister(request.search_handle);
        outcome
    }

    async fn run_search_inner(
        &self,
        request: &SearchRequest,
        stop: &Arc<AtomicBool>,
    ) -> SearchOutcome {
        if let Err(err) = self.ensure_search_row(request).await {
            warn!(error = %err, "creating search row failed");
        }

        let groups = match self.build_groups(request).await {
            Ok(groups) => groups,
            Err(err) => {
                warn!(error = %err, "keyword setup failed, continuing without groups");
                Vec::new()
            }
        };
        let shortcut_mode = groups.is_empty();
        let keyword_texts: Vec<String> = groups.iter().map(|g| g.canonical.clone()).collect();

        // url -> (item, matched, newly fetched this run); first portal wins.
        let mut aggregate: BTreeMap<String, (MatchedItem, bool, bool)> = BTreeMap::new();
        let mut matched_feed: Vec<MatchedItem> = Vec::new();
        let mut stopped = false;

        'portals: for portal in request.portals.portals() {
            if stop.load(Ordering::Relaxed) {
                stopped = true;
                break;
            }
            let Some(adapter) = self.adapter_for(*portal) else {
                warn!(portal = portal.name(), "no adapter configured");
                continue;
            };

            let entry_url = adapter.entry_url(&request.filters, &keyword_texts);
            self.sink
                .emit(&ProgressEvent::status(format!("searching {}", portal.name())));

            let total_outcome = adapter.extract_total(&entry_url).await;
            if let Some(total) = total_outcome.total {
                self.sink.emit(&ProgressEvent::total(total));
            }
            if let Some(diagnostic) = &total_outcome.diagnostic {
                self.sink.emit(&ProgressEvent {
                    current_search_item: Some(format!("{}: {diagnostic}", portal.name())),
                    debug_screenshot: total_outcome.snapshot_path.clone(),
                    ..ProgressEvent::default()
                });
            }

            let page_count = self.page_count(total_outcome.total, *portal, request.max_pages);
            let harvested = self
                .harvest_phase(&adapter, &entry_url, page_count, request.workers_phase1, stop)
                .await;
            if stop.load(Ordering::Relaxed) {
                stopped = true;
                break;
            }

            let harvested_urls: Vec<String> = harvested.urls.iter().cloned().collect();
            let seen = self
                .catalog
                .known_urls(&harvested_urls)
                .await
                .unwrap_or_default();
            let new_urls: Vec<String> = harvested_urls
                .iter()
                .filter(|u| !seen.contains(*u))
                .cloned()
                .collect();

            let pending = if shortcut_mode { 0 } else { new_urls.len() };
            self.sink.emit(&ProgressEvent {
                estimated_time: Some(pending as u64 * SECONDS_PER_DETAIL),
                ..ProgressEvent::default()
            });

            // Seen listings: re-evaluate from stored content, no re-fetch.
            let seen_records = self
                .catalog
                .listings_by_urls(&seen.iter().cloned().collect::<Vec<_>>())
                .await
                .unwrap_or_default();
            let seen_by_url: BTreeMap<String, ListingRecord> = seen_records
                .into_iter()
                .map(|r| (r.canonical_url.clone(), r))
                .collect();

            for url in &seen {
                if stop.load(Ordering::Relaxed) {
                    stopped = true;
                    break 'portals;
                }
                let record = seen_by_url.get(url);
                let matches = if shortcut_mode {
                    true
                } else {
                    match record {
                        Some(record) => {
                            self.evaluate_listing(&groups, &record.match_text(), url).await
                        }
                        None => false,
                    }
                };
                self.record_match(request, *portal, url, matches, "seen").await;

                let title = harvested
                    .titles
                    .get(url)
                    .cloned()
                    .or_else(|| record.and_then(|r| r.title.clone()));
                let item = MatchedItem { title, url: url.clone() };
                self.sink.emit(&ProgressEvent::status(format!(
                    "re-evaluated stored listing: {}",
                    item.title.as_deref().unwrap_or(url)
                )));
                if matches {
                    matched_feed.push(item.clone());
                    self.sink.emit(&ProgressEvent {
                        matched_publications: Some(matched_feed.clone()),
                        ..ProgressEvent::default()
                    });
                }
                aggregate.entry(url.clone()).or_insert((item, matches, false));
            }

            if shortcut_mode {
                // No keywords: every harvested URL counts. New URLs still get
                // a minimal listing row so the catalog sees them next time.
                for url in &new_urls {
                    if stop.load(Ordering::Relaxed) {
                        stopped = true;
                        break 'portals;
                    }
                    let title = harvested.titles.get(url).cloned();
                    let record = ListingRecord {
                        canonical_url: url.clone(),
                        portal: *portal,
                        title: title.clone(),
                        description: String::new(),
                        attributes: Default::default(),
                    };
                    if let Err(err) = self.catalog.upsert_listing(&record).await {
                        warn!(url, error = %err, "listing upsert failed");
                    }
                    self.record_match(request, *portal, url, true, "shortcut").await;
                    let item = MatchedItem { title, url: url.clone() };
                    matched_feed.push(item.clone());
                    aggregate.entry(url.clone()).or_insert((item, true, true));
                }
                self.sink.emit(&ProgressEvent {
                    matched_publications: Some(matched_feed.clone()),
                    ..ProgressEvent::default()
                });
                continue;
            }

            // Phase 2: detail fetches for unseen URLs.
            let semaphore = Arc::new(Semaphore::new(request.workers_phase2.max(1)));
            let mut join_set: JoinSet<(String, Option<ListingDraft>)> = JoinSet::new();
            for url in &new_urls {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let adapter = adapter.clone();
                let semaphore = semaphore.clone();
                let stop = stop.clone();
                let url = url.clone();
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                    if stop.load(Ordering::Relaxed) {
                        return (url, None);
                    }
                    let draft = adapter.parse_detail(&url).await;
                    (url, draft)
                });
            }

            let total_pending = new_urls.len();
            let mut processed = 0usize;
            while let Some(joined) = join_set.join_next().await {
                let Ok((url, draft)) = joined else {
                    warn!("detail task failed");
                    continue;
                };
                processed += 1;
                let harvest_title = harvested.titles.get(&url).cloned();
                match draft {
                    Some(draft) => {
                        let title = draft.title.clone().or(harvest_title);
                        let record = ListingRecord {
                            canonical_url: url.clone(),
                            portal: *portal,
                            title: title.clone(),
                            description: draft.description.clone(),
                            attributes: draft.attributes.clone(),
                        };
                        if let Err(err) = self.catalog.upsert_listing(&record).await {
                            warn!(url, error = %err, "listing upsert failed");
                        }
                        let matches = self
                            .evaluate_listing(&groups, &draft.match_text(), &url)
                            .await;
                        self.record_match(request, *portal, &url, matches, "new").await;

                        let item = MatchedItem { title, url: url.clone() };
                        self.sink.emit(&ProgressEvent::status(format!(
                            "analyzed ({processed}/{total_pending}): {}",
                            item.title.as_deref().unwrap_or(&url)
                        )));
                        if matches {
                            matched_feed.push(item.clone());
                            self.sink.emit(&ProgressEvent {
                                matched_publications: Some(matched_feed.clone()),
                                ..ProgressEvent::default()
                            });
                        }
                        aggregate.entry(url.clone()).or_insert((item, matches, true));
                    }
                    None => {
                        self.sink.emit(&ProgressEvent::status(format!(
                            "analyzed ({processed}/{total_pending}): detail unavailable"
                        )));
                        let item = MatchedItem {
                            title: harvest_title,
                            url: url.clone(),
                        };
                        aggregate.entry(url.clone()).or_insert((item, false, true));
                    }
                }
            }

            if stop.load(Ordering::Relaxed) {
                stopped = true;
                break;
            }
        }

        let mut outcome = SearchOutcome {
            stopped,
            ..SearchOutcome::default()
        };
        for (item, matches, is_new) in aggregate.into_values() {
            if matches {
                outcome.matched.push(item.clone());
                if is_new {
                    outcome.summary.new.push(item.clone());
                } else {
                    outcome.summary.existing.push(item.clone());
                }
            }
            outcome.all.push(item);
        }

        if stopped {
            self.sink.emit(&ProgressEvent::terminal("stopped by user"));
        } else {
            self.sink.emit(&ProgressEvent {
                final_message: Some(format!(
                    "search finished: {} matching listings",
                    outcome.matched.len()
                )),
                all_matched_properties: Some(outcome.summary.clone()),
                matched_publications: Some(outcome.matched.clone()),
                ..ProgressEvent::default()
            });
        }
        outcome
    }

    /// Re-runs a stored search against both portals unconditionally.
    /// `last_refresh_at` only advances when the run was not cancelled.
    pub async fn refresh_search(&self, handle: SearchHandle) -> RefreshReport {
        let search = match self.catalog.get_search(handle).await {
            Ok(Some(search)) => search,
            Ok(None) => {
                return RefreshReport {
                    success: false,
                    stats: None,
                    error: Some(format!("unknown search {handle}")),
                }
            }
            Err(err) => {
                return RefreshReport {
                    success: false,
                    stats: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let keywords = self
            .catalog
            .keywords_for_search(handle)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.canonical_text)
            .collect();

        let outcome = self
            .run_search(SearchRequest {
                filters: search.filters.clone(),
                keywords,
                max_pages: self.config.max_pages,
                workers_phase1: self.config.workers_phase1,
                workers_phase2: self.config.workers_phase2,
                search_handle: handle,
                portals: PortalSelection::Both,
            })
            .await;

        if !outcome.stopped {
            if let Err(err) = self.catalog.touch_last_refresh(handle, Utc::now()).await {
                warn!(error = %err, "updating last_refresh_at failed");
            }
        }

        let stats = self.catalog.stats().await.ok();
        RefreshReport {
            success: true,
            stats,
            error: None,
        }
    }

    /// Refresh every saved search, sequentially.
    pub async fn refresh_all_saved(&self) -> Result<usize> {
        let saved = self.catalog.saved_searches().await.context("loading saved searches")?;
        let count = saved.len();
        for search in saved {
            let report = self.refresh_search(search.id).await;
            if let Some(error) = report.error {
                warn!(search_id = %search.id, error, "saved-search refresh failed");
            }
        }
        Ok(count)
    }
}

/// Builds the cron scheduler when enabled; both cron slots refresh every
/// saved search.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    pipeline: Arc<SearchPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.refresh_cron_1, &config.refresh_cron_2] {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.refresh_all_saved().await {
                    Ok(count) => info!(count, "scheduled refresh pass complete"),
                    Err(err) => warn!(error = %err, "scheduled refresh pass failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mirador_adapters::TotalOutcome;
    use mirador_core::{ListingAttributes, Portal};
    use mirador_storage::MemoryCatalog;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    struct FakeAdapter {
        portal: Portal,
        total: Option<ResultTotal>,
        pages: Vec<HarvestedPage>,
        details: BTreeMap<String, ListingDraft>,
        harvest_calls: AtomicUsize,
        detail_calls: AtomicUsize,
        trip_on_harvest: Option<Arc<AtomicBool>>,
    }

    impl FakeAdapter {
        fn new(portal: Portal) -> Self {
            Self {
                portal,
                total: None,
                pages: Vec::new(),
                details: BTreeMap::new(),
                harvest_calls: AtomicUsize::new(0),
                detail_calls: AtomicUsize::new(0),
                trip_on_harvest: None,
            }
        }
    }

    #[async_trait]
    impl PortalAdapter for FakeAdapter {
        fn portal(&self) -> Portal {
            self.portal
        }

        fn entry_url(&self, _filters: &SearchFilters, _keywords: &[String]) -> String {
            format!("fake://{}/entry", self.portal.name())
        }

        fn page_url(&self, entry_url: &str, page_index: usize) -> String {
            format!("{entry_url}/page/{page_index}")
        }

        async fn extract_total(&self, _entry_url: &str) -> TotalOutcome {
            TotalOutcome {
                total: self.total,
                diagnostic: None,
                snapshot_path: None,
            }
        }

        async fn harvest_list_page(&self, _page_url: &str) -> HarvestedPage {
            let call = self.harvest_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(flag) = &self.trip_on_harvest {
                flag.store(true, Ordering::Relaxed);
            }
            self.pages.get(call).cloned().unwrap_or_default()
        }

        async fn parse_detail(&self, listing_url: &str) -> Option<ListingDraft> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.details.get(listing_url).cloned()
        }
    }

    fn page_with(urls: &[(&str, &str)]) -> HarvestedPage {
        let mut page = HarvestedPage::default();
        for (url, title) in urls {
            page.urls.insert(url.to_string());
            if !title.is_empty() {
                page.titles.insert(url.to_string(), title.to_string());
            }
        }
        page
    }

    fn draft(url: &str, title: &str, description: &str) -> ListingDraft {
        ListingDraft {
            url: url.to_string(),
            title: Some(title.to_string()),
            description: description.to_string(),
            attributes: ListingAttributes::default(),
        }
    }

    fn request(handle: SearchHandle, keywords: &[&str], portals: PortalSelection) -> SearchRequest {
        SearchRequest {
            filters: SearchFilters::default(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            max_pages: 3,
            workers_phase1: 1,
            workers_phase2: 2,
            search_handle: handle,
            portals,
        }
    }

    fn pipeline_with(
        catalog: Arc<MemoryCatalog>,
        adapters: Vec<Arc<dyn PortalAdapter>>,
        sink: Arc<BufferingSink>,
    ) -> SearchPipeline {
        SearchPipeline::new(PipelineConfig::default(), catalog, adapters, sink)
    }

    async fn seed_listing(catalog: &MemoryCatalog, url: &str, title: &str, description: &str) {
        catalog
            .upsert_listing(&ListingRecord {
                canonical_url: url.to_string(),
                portal: Portal::MercadoLibre,
                title: Some(title.to_string()),
                description: description.to_string(),
                attributes: ListingAttributes::default(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shortcut_mode_skips_detail_phase_but_persists_new_urls() {
        let catalog = Arc::new(MemoryCatalog::new());
        // Ten of the forty-eight harvested URLs are already known.
        let mut entries: Vec<(String, String)> = Vec::new();
        for i in 0..48 {
            entries.push((format!("https://x.uy/MLU-{i:03}"), format!("Listing {i}")));
        }
        for (url, title) in entries.iter().take(10) {
            seed_listing(&catalog, url, title, "stored description").await;
        }

        let mut adapter = FakeAdapter::new(Portal::MercadoLibre);
        adapter.total = Some(ResultTotal::Exact(48));
        let borrowed: Vec<(&str, &str)> = entries
            .iter()
            .map(|(u, t)| (u.as_str(), t.as_str()))
            .collect();
        adapter.pages = vec![page_with(&borrowed)];
        let adapter = Arc::new(adapter);

        let sink = Arc::new(BufferingSink::new());
        let pipeline = pipeline_with(
            catalog.clone(),
            vec![adapter.clone()],
            sink.clone(),
        );

        let outcome = pipeline
            .run_search(request(Uuid::new_v4(), &[], PortalSelection::MercadoLibre))
            .await;

        assert!(!outcome.stopped);
        assert_eq!(outcome.all.len(), 48);
        assert_eq!(outcome.matched.len(), 48);
        assert_eq!(adapter.detail_calls.load(Ordering::SeqCst), 0);
        // One harvest page: total 48 at page size 48.
        assert_eq!(adapter.harvest_calls.load(Ordering::SeqCst), 1);

        let stats = catalog.stats().await.unwrap();
        assert_eq!(stats.listings, 48);
        assert_eq!(stats.match_results, 48);
        assert_eq!(stats.positive_match_results, 48);
        // Matched list is sorted by canonical URL.
        let urls: Vec<&str> = outcome.matched.iter().map(|m| m.url.as_str()).collect();
        let mut sorted = urls.clone();
        sorted.sort();
        assert_eq!(urls, sorted);
    }

    #[tokio::test]
    async fn keyword_conjunction_filters_detail_results() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut adapter = FakeAdapter::new(Portal::MercadoLibre);
        adapter.total = Some(ResultTotal::Exact(2));
        adapter.pages = vec![page_with(&[
            ("https://x.uy/MLU-1", "Apto uno"),
            ("https://x.uy/MLU-2", "Apto dos"),
        ])];
        adapter.details.insert(
            "https://x.uy/MLU-1".into(),
            draft("https://x.uy/MLU-1", "Apto uno", "Tiene terraza al frente"),
        );
        adapter.details.insert(
            "https://x.uy/MLU-2".into(),
            draft(
                "https://x.uy/MLU-2",
                "Apto dos",
                "Terraza lavadero y garaje doble",
            ),
        );
        let adapter = Arc::new(adapter);

        let handle = Uuid::new_v4();
        let sink = Arc::new(BufferingSink::new());
        let pipeline = pipeline_with(catalog.clone(), vec![adapter.clone()], sink.clone());
        let outcome = pipeline
            .run_search(request(
                handle,
                &["terraza", "garaje"],
                PortalSelection::MercadoLibre,
            ))
            .await;

        // AND across groups: the listing with only "terraza" is excluded.
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].url, "https://x.uy/MLU-2");
        assert_eq!(outcome.all.len(), 2);
        assert_eq!(adapter.detail_calls.load(Ordering::SeqCst), 2);

        let results = catalog.match_results_for_search(handle).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.matches).count(), 1);
    }

    #[tokio::test]
    async fn stop_flag_halts_harvest_between_pages() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut adapter = FakeAdapter::new(Portal::MercadoLibre);
        // Unknown total: pipeline would visit max_pages pages.
        adapter.total = None;
        adapter.pages = vec![
            page_with(&[("https://x.uy/MLU-1", "uno")]),
            page_with(&[("https://x.uy/MLU-2", "dos")]),
            page_with(&[("https://x.uy/MLU-3", "tres")]),
        ];
        let handle = Uuid::new_v4();

        let sink = Arc::new(BufferingSink::new());
        let coordinator = Arc::new(SearchCoordinator::new());
        adapter.trip_on_harvest = Some(coordinator.register(handle));
        let adapter = Arc::new(adapter);

        let pipeline = pipeline_with(catalog.clone(), vec![adapter.clone()], sink.clone())
            .with_coordinator(coordinator.clone());
        let outcome = pipeline
            .run_search(request(handle, &["terraza"], PortalSelection::MercadoLibre))
            .await;

        assert!(outcome.stopped);
        // The first harvest trips the flag; later page tasks bail before
        // touching the adapter, and Phase 2 never starts.
        assert_eq!(adapter.harvest_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.detail_calls.load(Ordering::SeqCst), 0);
        let final_messages: Vec<String> = sink
            .events()
            .iter()
            .filter_map(|e| e.final_message.clone())
            .collect();
        assert_eq!(final_messages, vec!["stopped by user".to_string()]);
        // Registration is cleaned up afterwards.
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn stop_requests_are_idempotent() {
        let coordinator = SearchCoordinator::new();
        let handle = Uuid::new_v4();
        coordinator.register(handle);
        assert!(!coordinator.is_stopped(handle));
        coordinator.request_stop(handle);
        coordinator.request_stop(handle);
        assert!(coordinator.is_stopped(handle));
        // Unknown handles are never reported stopped.
        assert!(!coordinator.is_stopped(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn refresh_reevaluates_stored_content_without_refetch() {
        let catalog = Arc::new(MemoryCatalog::new());
        let handle = Uuid::new_v4();
        let url = "https://x.uy/MLU-9";
        seed_listing(&catalog, url, "Apto con terraza", "Gran terraza al sur").await;
        catalog
            .create_search(&SearchRecord {
                id: handle,
                name: Some("saved".into()),
                original_text: "terraza".into(),
                filters: SearchFilters::default(),
                is_saved: true,
                created_at: Utc::now(),
                last_refresh_at: None,
            })
            .await
            .unwrap();
        catalog
            .get_or_create_keyword(&KeywordRecord {
                canonical_text: "terraza".into(),
                language: "es".into(),
                variants: Vec::new(),
            })
            .await
            .unwrap();
        catalog.link_search_keyword(handle, "terraza").await.unwrap();

        let mut ml = FakeAdapter::new(Portal::MercadoLibre);
        ml.total = Some(ResultTotal::Exact(1));
        // One page per refresh pass.
        ml.pages = vec![
            page_with(&[(url, "Apto con terraza")]),
            page_with(&[(url, "Apto con terraza")]),
        ];
        let ml = Arc::new(ml);
        let mut ic = FakeAdapter::new(Portal::InfoCasas);
        ic.total = Some(ResultTotal::Exact(0));
        let ic = Arc::new(ic);

        let sink = Arc::new(BufferingSink::new());
        let pipeline = pipeline_with(catalog.clone(), vec![ml.clone(), ic.clone()], sink.clone());

        let first = pipeline.refresh_search(handle).await;
        assert!(first.success);
        let second = pipeline.refresh_search(handle).await;
        assert!(second.success);

        // Stored listing was never re-fetched; both portals were visited.
        assert_eq!(ml.detail_calls.load(Ordering::SeqCst), 0);
        assert!(ic.harvest_calls.load(Ordering::SeqCst) >= 1);

        let results = catalog.match_results_for_search(handle).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].matches);
        assert_eq!(results[0].seen_count, 2);

        let search = catalog.get_search(handle).await.unwrap().unwrap();
        assert!(search.last_refresh_at.is_some());
        assert_eq!(second.stats.unwrap().positive_match_results, 1);
    }

    #[tokio::test]
    async fn buffering_sink_captures_partial_payloads() {
        let sink = BufferingSink::new();
        sink.emit(&ProgressEvent::status("working"));
        sink.emit(&ProgressEvent {
            matched_publications: Some(vec![MatchedItem {
                title: Some("t".into()),
                url: "https://x.uy/MLU-1".into(),
            }]),
            ..ProgressEvent::default()
        });
        assert_eq!(sink.events().len(), 2);
        let captured = sink.captured_matched().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].url, "https://x.uy/MLU-1");
    }

    #[tokio::test]
    async fn scheduler_is_built_only_when_enabled() {
        let catalog = Arc::new(MemoryCatalog::new());
        let sink = Arc::new(BufferingSink::new());
        let disabled = PipelineConfig::default();
        let pipeline = Arc::new(pipeline_with(catalog.clone(), Vec::new(), sink.clone()));
        assert!(maybe_build_scheduler(&disabled, pipeline.clone())
            .await
            .unwrap()
            .is_none());

        let enabled = PipelineConfig {
            scheduler_enabled: true,
            ..PipelineConfig::default()
        };
        assert!(maybe_build_scheduler(&enabled, pipeline)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn page_planning_uses_total_as_lower_bound() {
        let catalog = Arc::new(MemoryCatalog::new());
        let sink = Arc::new(BufferingSink::new());
        let pipeline = pipeline_with(catalog, Vec::new(), sink);
        // 100 results at 48 per page need 3 pages, capped at max_pages.
        assert_eq!(
            pipeline.page_count(Some(ResultTotal::Exact(100)), Portal::MercadoLibre, 5),
            3
        );
        assert_eq!(
            pipeline.page_count(Some(ResultTotal::MoreThan(400)), Portal::InfoCasas, 3),
            3
        );
        assert_eq!(pipeline.page_count(None, Portal::MercadoLibre, 4), 4);
        // A zero total still probes the first page.
        assert_eq!(
            pipeline.page_count(Some(ResultTotal::Exact(0)), Portal::InfoCasas, 3),
            1
        );
    }

    #[tokio::test]
    async fn multi_word_keywords_match_as_one_phrase() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut adapter = FakeAdapter::new(Portal::MercadoLibre);
        adapter.total = Some(ResultTotal::Exact(2));
        adapter.pages = vec![page_with(&[
            ("https://x.uy/MLU-1", "Apto uno"),
            ("https://x.uy/MLU-2", "Apto dos"),
        ])];
        adapter.details.insert(
            "https://x.uy/MLU-1".into(),
            draft(
                "https://x.uy/MLU-1",
                "Apto uno",
                "Edificio pet friendly con terraza",
            ),
        );
        adapter.details.insert(
            "https://x.uy/MLU-2".into(),
            draft(
                "https://x.uy/MLU-2",
                "Apto dos",
                "Cerca de un pet shop, ambiente friendly",
            ),
        );
        let adapter = Arc::new(adapter);

        let handle = Uuid::new_v4();
        let sink = Arc::new(BufferingSink::new());
        let pipeline = pipeline_with(catalog.clone(), vec![adapter.clone()], sink);
        let outcome = pipeline
            .run_search(request(handle, &["pet friendly"], PortalSelection::MercadoLibre))
            .await;

        // One phrase group matched as a plain substring, not two AND groups.
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].url, "https://x.uy/MLU-1");
        let stored = catalog.keywords_for_search(handle).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].canonical_text, "pet friendly");
    }

    #[tokio::test]
    async fn short_list_keywords_are_kept() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut adapter = FakeAdapter::new(Portal::MercadoLibre);
        adapter.total = Some(ResultTotal::Exact(2));
        adapter.pages = vec![page_with(&[
            ("https://x.uy/MLU-1", "Apto uno"),
            ("https://x.uy/MLU-2", "Apto dos"),
        ])];
        adapter.details.insert(
            "https://x.uy/MLU-1".into(),
            draft("https://x.uy/MLU-1", "Apto uno", "Terraza y ac frio-calor"),
        );
        adapter.details.insert(
            "https://x.uy/MLU-2".into(),
            draft("https://x.uy/MLU-2", "Apto dos", "Terraza amplia"),
        );
        let adapter = Arc::new(adapter);

        let handle = Uuid::new_v4();
        let sink = Arc::new(BufferingSink::new());
        let pipeline = pipeline_with(catalog.clone(), vec![adapter.clone()], sink);
        let outcome = pipeline
            .run_search(request(handle, &["ac", "terraza"], PortalSelection::MercadoLibre))
            .await;

        // "ac" stays a group of its own; the run must not fall into
        // shortcut mode with an emptied group list.
        assert_eq!(adapter.detail_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].url, "https://x.uy/MLU-1");
    }

    #[test]
    fn window_gate_denies_after_quota() {
        let gate = ActionWindowGate::new(2, Duration::from_secs(60));
        assert!(gate.check("cli", "refresh", None).0);
        assert!(gate.check("cli", "refresh", None).0);
        let (allowed, message) = gate.check("cli", "refresh", None);
        assert!(!allowed);
        assert!(!message.is_empty());
        // Other actions keep their own window.
        assert!(gate.check("cli", "save", None).0);
        assert!(AllowAllGate.check("cli", "refresh", None).0);
    }

    #[test]
    fn window_gate_frees_slots_after_the_window() {
        let gate = ActionWindowGate::new(1, Duration::from_millis(20));
        assert!(gate.check("cli", "save", None).0);
        assert!(!gate.check("cli", "save", None).0);
        std::thread::sleep(Duration::from_millis(40));
        assert!(gate.check("cli", "save", None).0);
    }

    #[test]
    fn passthrough_translator_splits_keywords() {
        let translated = PassthroughTranslator
            .translate("Apto con terraza para la familia")
            .unwrap();
        assert_eq!(
            translated.keywords,
            vec!["apto".to_string(), "terraza".into(), "familia".into()]
        );
        assert!(translated.remaining_text.is_empty());
    }
}
