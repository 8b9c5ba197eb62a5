use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mirador_adapters::{
    BrowserlessRenderer, FetchStack, InfoCasasAdapter, MercadoLibreAdapter, PortalAdapter,
};
use mirador_core::{
    Operation, PortalSelection, ProgressEvent, PropertyType, SearchFilters, SearchRecord,
};
use mirador_match::{split_raw_keywords, Lexicon};
use mirador_pipeline::{
    maybe_build_scheduler, ActionWindowGate, AllowAllGate, PipelineConfig, ProgressSink,
    RateLimitGate, SearchPipeline, SearchRequest,
};
use mirador_storage::{
    CatalogStore, HttpClientConfig, HttpFetcher, MemoryCatalog, PgCatalog, SnapshotStore,
    StorageConfig,
};

#[derive(Debug, Parser)]
#[command(name = "mirador-cli")]
#[command(about = "Mirador property-listing monitor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PortalArg {
    Mercadolibre,
    Infocasas,
    Both,
}

impl PortalArg {
    fn selection(self) -> PortalSelection {
        match self {
            PortalArg::Mercadolibre => PortalSelection::MercadoLibre,
            PortalArg::Infocasas => PortalSelection::InfoCasas,
            PortalArg::Both => PortalSelection::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    Sale,
    Rent,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PropertyTypeArg {
    Apartment,
    House,
    Commercial,
    Land,
    Office,
    Warehouse,
    KeyMoney,
    Other,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a one-off search against the portals.
    Search {
        /// Filter set as a JSON object; unknown keys are ignored with a warning.
        #[arg(long)]
        filters: Option<String>,
        /// Keywords every matching listing must contain. Comma-separated
        /// values are whole keywords (multi-word phrases allowed); a single
        /// space-separated value is treated as free text and split.
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        #[arg(long, value_enum)]
        operation: Option<OperationArg>,
        #[arg(long = "type", value_enum)]
        property_type: Option<PropertyTypeArg>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        price_min: Option<u64>,
        #[arg(long)]
        price_max: Option<u64>,
        #[arg(long, value_enum, default_value = "both")]
        portal: PortalArg,
        #[arg(long)]
        max_pages: Option<usize>,
        /// Keep the search for scheduled refreshes.
        #[arg(long)]
        save: bool,
        #[arg(long)]
        name: Option<String>,
    },
    /// Re-run a saved search, or all of them with --all.
    Refresh {
        id: Option<Uuid>,
        #[arg(long)]
        all: bool,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Print catalog counters.
    Stats,
}

/// Prints the streamed progress the way a log reader expects it.
struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn emit(&self, event: &ProgressEvent) {
        if let Some(total) = event.total_found {
            println!("total: {total}");
        }
        if let Some(seconds) = event.estimated_time {
            println!("estimated time: {seconds}s");
        }
        if let Some(item) = &event.current_search_item {
            println!("{item}");
        }
        if let Some(message) = &event.final_message {
            println!("{message}");
        }
    }
}

async fn build_catalog(storage: &StorageConfig) -> Result<Arc<dyn CatalogStore>> {
    match &storage.database_url {
        Some(url) => Ok(Arc::new(PgCatalog::connect(url).await?)),
        None => {
            warn!("no database configured, using the in-memory catalog");
            Ok(Arc::new(MemoryCatalog::new()))
        }
    }
}

fn build_adapters(storage: &StorageConfig) -> Result<Vec<Arc<dyn PortalAdapter>>> {
    let http_config = HttpClientConfig {
        user_agent: std::env::var("MIRADOR_USER_AGENT").ok().filter(|v| !v.is_empty()),
        token_bucket: storage.token_bucket(),
        ..HttpClientConfig::default()
    };
    let fetcher = Arc::new(HttpFetcher::new(http_config)?);

    let mut stack =
        FetchStack::new(fetcher).with_snapshots(SnapshotStore::new(storage.snapshot_dir.clone()));
    if let Ok(base_url) = std::env::var("MIRADOR_BROWSERLESS_URL") {
        if !base_url.trim().is_empty() {
            let token = std::env::var("MIRADOR_BROWSERLESS_TOKEN").ok().filter(|v| !v.is_empty());
            stack = stack.with_renderer(Arc::new(BrowserlessRenderer::new(base_url, token)?));
        }
    }

    Ok(vec![
        Arc::new(MercadoLibreAdapter::new(stack.clone())),
        Arc::new(InfoCasasAdapter::new(stack)),
    ])
}

/// Save and refresh actions pass through a rate gate; unlimited unless the
/// daily cap is configured.
fn build_gate() -> Arc<dyn RateLimitGate> {
    match std::env::var("MIRADOR_MAX_ACTIONS_PER_DAY")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        Some(max) => Arc::new(ActionWindowGate::new(max, Duration::from_secs(86_400))),
        None => Arc::new(AllowAllGate),
    }
}

fn load_lexicon() -> Result<Lexicon> {
    match std::env::var("MIRADOR_LEXICON_FILE") {
        Ok(path) if !path.trim().is_empty() => Lexicon::from_yaml_file(&PathBuf::from(path)),
        _ => Ok(Lexicon::default()),
    }
}

async fn build_pipeline(sink: Arc<dyn ProgressSink>) -> Result<(Arc<SearchPipeline>, PipelineConfig)> {
    let config = PipelineConfig::from_env();
    let storage = StorageConfig::from_env();
    let catalog = build_catalog(&storage).await?;
    let adapters = build_adapters(&storage)?;
    let pipeline = SearchPipeline::new(config.clone(), catalog, adapters, sink)
        .with_lexicon(load_lexicon()?);
    Ok((Arc::new(pipeline), config))
}

fn parse_filters(raw: Option<&str>) -> Result<SearchFilters> {
    let Some(raw) = raw else {
        return Ok(SearchFilters::default());
    };
    let value: serde_json::Value = serde_json::from_str(raw).context("parsing --filters JSON")?;
    let (filters, unknown) = SearchFilters::from_json(&value);
    for key in unknown {
        warn!(key, "ignoring unknown filter key");
    }
    Ok(filters)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mirador=info".parse()?))
        .init();

    let cli = Cli::parse();
    let sink: Arc<dyn ProgressSink> = Arc::new(StdoutSink);
    let (pipeline, config) = build_pipeline(sink).await?;
    let gate = build_gate();

    match cli.command {
        Commands::Search {
            filters,
            keywords,
            operation,
            property_type,
            department,
            city,
            price_min,
            price_max,
            portal,
            max_pages,
            save,
            name,
        } => {
            let mut filters = parse_filters(filters.as_deref())?;
            // Direct flags win over the JSON blob.
            if let Some(operation) = operation {
                filters.operation = Some(match operation {
                    OperationArg::Sale => Operation::Sale,
                    OperationArg::Rent => Operation::Rent,
                });
            }
            if let Some(property_type) = property_type {
                filters.property_type = Some(match property_type {
                    PropertyTypeArg::Apartment => PropertyType::Apartment,
                    PropertyTypeArg::House => PropertyType::House,
                    PropertyTypeArg::Commercial => PropertyType::Commercial,
                    PropertyTypeArg::Land => PropertyType::Land,
                    PropertyTypeArg::Office => PropertyType::Office,
                    PropertyTypeArg::Warehouse => PropertyType::Warehouse,
                    PropertyTypeArg::KeyMoney => PropertyType::KeyMoney,
                    PropertyTypeArg::Other => PropertyType::Other,
                });
            }
            if department.is_some() {
                filters.department = department;
            }
            if city.is_some() {
                filters.city = city;
            }
            if price_min.is_some() {
                filters.price_min = price_min;
            }
            if price_max.is_some() {
                filters.price_max = price_max;
            }
            // A lone space-separated value is free text; comma-separated
            // values are one logical keyword each.
            let keywords = if keywords.len() == 1 && keywords[0].contains(char::is_whitespace) {
                split_raw_keywords(&keywords[0])
            } else {
                keywords
            };
            let handle = Uuid::new_v4();

            // Pre-create the row when it carries a name or the saved bit,
            // otherwise the pipeline creates a plain one.
            if save || name.is_some() {
                let (allowed, message) = gate.check("cli", "save", Some(handle));
                if !allowed {
                    println!("{message}");
                    return Ok(());
                }
                pipeline
                    .catalog()
                    .create_search(&SearchRecord {
                        id: handle,
                        name,
                        original_text: keywords.join(" "),
                        filters: filters.clone(),
                        is_saved: save,
                        created_at: Utc::now(),
                        last_refresh_at: None,
                    })
                    .await?;
            }

            let outcome = pipeline
                .run_search(SearchRequest {
                    filters,
                    keywords,
                    max_pages: max_pages.unwrap_or(config.max_pages),
                    workers_phase1: config.workers_phase1,
                    workers_phase2: config.workers_phase2,
                    search_handle: handle,
                    portals: portal.selection(),
                })
                .await;

            println!(
                "search {handle}: {} matched of {} harvested ({} new, {} re-evaluated){}",
                outcome.matched.len(),
                outcome.all.len(),
                outcome.summary.new.len(),
                outcome.summary.existing.len(),
                if outcome.stopped { ", stopped early" } else { "" }
            );
            for item in &outcome.matched {
                println!("  {} {}", item.url, item.title.as_deref().unwrap_or(""));
            }
        }
        Commands::Refresh { id, all } => {
            let (allowed, message) = gate.check("cli", "refresh", id);
            if !allowed {
                println!("{message}");
                return Ok(());
            }
            if all {
                let count = pipeline.refresh_all_saved().await?;
                println!("refreshed {count} saved searches");
            } else {
                let id = id.context("pass a search id or --all")?;
                let report = pipeline.refresh_search(id).await;
                match report.error {
                    Some(error) => println!("refresh failed: {error}"),
                    None => println!("refresh complete"),
                }
                if let Some(stats) = report.stats {
                    println!(
                        "catalog: {} listings, {} match results",
                        stats.listings, stats.match_results
                    );
                }
            }
        }
        Commands::Schedule => {
            match maybe_build_scheduler(&config, pipeline).await? {
                Some(mut scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    println!(
                        "scheduler running ({} / {}), ctrl-c to exit",
                        config.refresh_cron_1, config.refresh_cron_2
                    );
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    scheduler.shutdown().await.context("stopping scheduler")?;
                }
                None => {
                    println!("scheduler disabled; set MIRADOR_SCHEDULER_ENABLED=1");
                }
            }
        }
        Commands::Stats => {
            let stats = pipeline.catalog().stats().await?;
            println!("searches: {} ({} saved)", stats.searches, stats.saved_searches);
            println!("keywords: {}", stats.keywords);
            println!("listings: {}", stats.listings);
            println!(
                "match results: {} ({} positive)",
                stats.match_results, stats.positive_match_results
            );
        }
    }

    Ok(())
}
