//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use biothreat_core::{
    CancelFlag, CycleCoordinator, CycleProgress, ManualEntry, OpenRouterClient,
};
use biothreat_fetcher::HttpFetcher;
use biothreat_shared::{
    AppConfig, CycleRun, CycleStage, FetchConfig, ForecastError, MappingView, PipelinePolicy,
    SourceKind, ThreatLevelCuts, init_config, load_config, load_config_from, validate_api_key,
};
use biothreat_storage::Storage;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Biothreat: forecast AI-enabled biosecurity threats from the literature.
#[derive(Parser)]
#[command(
    name = "biothreat",
    version,
    about = "Ingest publications, extract AI capabilities, and score them against biosecurity threats.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.biothreat/biothreat.toml).
    #[arg(long, global = true, env = "BIOTHREAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `storage.database_path`.
    #[arg(long, global = true, env = "BIOTHREAT_DB")]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run or inspect forecasting cycles.
    Cycle {
        #[command(subcommand)]
        action: CycleAction,
    },

    /// Read scored capability/threat mappings.
    Mappings {
        #[command(subcommand)]
        action: MappingsAction,
    },

    /// Threat catalog management and reports.
    Threats {
        #[command(subcommand)]
        action: ThreatsAction,
    },

    /// Source registry management.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Load the default sources or threat catalog.
    Seed {
        #[command(subcommand)]
        target: SeedTarget,
    },

    /// Add documents outside of a fetch.
    Ingest {
        #[command(subcommand)]
        action: IngestAction,
    },

    /// Stored document queries.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum CycleAction {
    /// Run one fetch, extract, map cycle.
    Run {
        /// Only consider entries published after this time (RFC 3339),
        /// overriding per-source watermarks.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Run cycles on a schedule until Ctrl-C.
    Watch {
        /// Minutes between cycle starts (defaults to `cycle.schedule_interval_mins`).
        #[arg(long)]
        interval_mins: Option<u64>,
    },
    /// Show recent cycle runs.
    History {
        #[arg(long, default_value = "10")]
        limit: u32,
    },
}

#[derive(Subcommand)]
pub(crate) enum MappingsAction {
    /// Latest active mappings at or above a score.
    Latest {
        /// Minimum feasibility score (defaults to `pipeline.relevance_floor`).
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Active mappings for one threat category.
    Category {
        /// Threat category name.
        name: String,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum ThreatsAction {
    /// List the threat catalog.
    List,
    /// Per-category mapping counts, scores and trend.
    Overview {
        /// Size of the recent window (the prior window has the same size).
        #[arg(long, default_value = "30")]
        window_days: u32,
    },
    /// Import a `[[threats]]` TOML file, updating existing names in place.
    Import { file: PathBuf },
}

#[derive(Subcommand)]
pub(crate) enum SourcesAction {
    /// List registered sources.
    List,
    /// Register a new source.
    Add {
        #[arg(long)]
        name: String,
        /// feed, search or static.
        #[arg(long)]
        kind: SourceKind,
        /// Feed URL, search query, or JSON listing URL.
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value = "uncategorized")]
        category: String,
    },
    /// Include a source in future cycles.
    Enable { name: String },
    /// Exclude a source from future cycles.
    Disable { name: String },
}

#[derive(Subcommand)]
pub(crate) enum SeedTarget {
    /// Default publication sources.
    Sources,
    /// Default threat taxonomy.
    Threats,
}

#[derive(Subcommand)]
pub(crate) enum IngestAction {
    /// Store a document typed in by hand; it is extracted on the next cycle.
    Manual {
        #[arg(long)]
        title: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        authors: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum DocumentsAction {
    /// Full-text search over stored titles and bodies.
    Search {
        query: String,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "biothreat=info",
        1 => "biothreat=debug",
        _ => "biothreat=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Resolved config plus the database location.
struct Context {
    config: AppConfig,
    db_path: PathBuf,
}

impl Context {
    fn resolve(config_path: Option<&Path>, db: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let db_path = db.unwrap_or_else(|| PathBuf::from(&config.storage.database_path));
        Ok(Self { config, db_path })
    }

    async fn storage(&self) -> Result<Storage> {
        Ok(Storage::open(&self.db_path).await?)
    }

    async fn readonly_storage(&self) -> Result<Storage> {
        Ok(Storage::open_readonly(&self.db_path).await?)
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()).await,
        };
    }

    let ctx = Context::resolve(cli.config.as_deref(), cli.db)?;
    match cli.command {
        Command::Cycle { action } => match action {
            CycleAction::Run { since } => cmd_cycle_run(&ctx, since).await,
            CycleAction::Watch { interval_mins } => cmd_cycle_watch(&ctx, interval_mins).await,
            CycleAction::History { limit } => cmd_cycle_history(&ctx, limit).await,
        },
        Command::Mappings { action } => match action {
            MappingsAction::Latest {
                min_score,
                limit,
                json,
            } => cmd_mappings_latest(&ctx, min_score, limit, json).await,
            MappingsAction::Category {
                name,
                min_score,
                json,
            } => cmd_mappings_category(&ctx, &name, min_score, json).await,
        },
        Command::Threats { action } => match action {
            ThreatsAction::List => cmd_threats_list(&ctx).await,
            ThreatsAction::Overview { window_days } => cmd_threats_overview(&ctx, window_days).await,
            ThreatsAction::Import { file } => cmd_threats_import(&ctx, &file).await,
        },
        Command::Sources { action } => match action {
            SourcesAction::List => cmd_sources_list(&ctx).await,
            SourcesAction::Add {
                name,
                kind,
                endpoint,
                category,
            } => cmd_sources_add(&ctx, &name, kind, &endpoint, &category).await,
            SourcesAction::Enable { name } => cmd_sources_toggle(&ctx, &name, true).await,
            SourcesAction::Disable { name } => cmd_sources_toggle(&ctx, &name, false).await,
        },
        Command::Seed { target } => cmd_seed(&ctx, target).await,
        Command::Ingest {
            action:
                IngestAction::Manual {
                    title,
                    text,
                    url,
                    authors,
                },
        } => {
            cmd_ingest_manual(
                &ctx,
                ManualEntry {
                    title,
                    text,
                    url,
                    authors,
                },
            )
            .await
        }
        Command::Documents {
            action: DocumentsAction::Search { query, limit },
        } => cmd_documents_search(&ctx, &query, limit).await,
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

async fn build_coordinator(ctx: &Context) -> Result<CycleCoordinator> {
    // Validate API key before doing anything
    let api_key = validate_api_key(&ctx.config)?;
    let client = OpenRouterClient::from_config(&ctx.config, api_key)?;
    let fetcher = HttpFetcher::new(FetchConfig::from(&ctx.config))?;
    let storage = ctx.storage().await?;

    Ok(CycleCoordinator::new(
        Arc::new(storage),
        Arc::new(fetcher),
        Arc::new(client),
        PipelinePolicy::from(&ctx.config),
    ))
}

/// Raise `cancel` on Ctrl-C; in-flight work finishes and the run ends partial.
fn cancel_on_ctrl_c(cancel: &CancelFlag) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Cancelling after in-flight work finishes...");
            cancel.cancel();
        }
    });
}

async fn cmd_cycle_run(ctx: &Context, since: Option<DateTime<Utc>>) -> Result<()> {
    let coordinator = build_coordinator(ctx).await?;
    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(&cancel);

    info!(?since, "starting cycle");
    let reporter = CliProgress::new();
    let run = coordinator.run_cycle(since, &cancel, &reporter).await?;
    print_run_summary(&run);
    Ok(())
}

async fn cmd_cycle_watch(ctx: &Context, interval_mins: Option<u64>) -> Result<()> {
    let minutes = interval_mins.unwrap_or(ctx.config.cycle.schedule_interval_mins);
    if minutes == 0 {
        return Err(eyre!("interval must be at least one minute"));
    }
    let interval = Duration::from_secs(minutes * 60);
    let coordinator = build_coordinator(ctx).await?;
    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(&cancel);

    println!("Running a cycle every {minutes} min. Press Ctrl-C to stop.");
    loop {
        let reporter = CliProgress::new();
        match coordinator.run_cycle(None, &cancel, &reporter).await {
            Ok(run) => print_run_summary(&run),
            Err(ForecastError::CycleInProgress { run_id }) => {
                reporter.spinner.finish_and_clear();
                warn!(%run_id, "another cycle is running, skipping this tick");
            }
            Err(e) => return Err(e.into()),
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    println!("Stopped.");
    Ok(())
}

async fn cmd_cycle_history(ctx: &Context, limit: u32) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let runs = storage.cycle_history(limit).await?;
    if runs.is_empty() {
        println!("No cycles have run yet.");
        return Ok(());
    }

    println!(
        "  {:<36}  {:<16}  {:<14}  {:>5}  {:>5}  {:>5}  {:>5}",
        "RUN", "STARTED", "STATUS", "DOCS", "CAPS", "MAPS", "FAIL"
    );
    for run in &runs {
        let o = &run.outcome;
        println!(
            "  {:<36}  {:<16}  {:<14}  {:>5}  {:>5}  {:>5}  {:>5}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.status.as_str(),
            o.documents_new,
            o.capabilities_added,
            o.mappings_added,
            o.source_failures() + o.extraction_failures + o.mapping_failures,
        );
        if let Some(err) = &run.error {
            println!("      error: {err}");
        }
    }
    Ok(())
}

fn print_run_summary(run: &CycleRun) {
    let o = &run.outcome;
    println!();
    println!("  Cycle {}", run.id);
    println!("  Status:       {}", run.status);
    for source in &o.sources {
        match &source.error {
            None => println!(
                "    ok    {} ({} fetched, {} new)",
                source.source_name, source.fetched, source.new_documents
            ),
            Some(err) => println!("    FAIL  {}: {err}", source.source_name),
        }
    }
    println!("  Documents:    {} fetched, {} new", o.documents_fetched, o.documents_new);
    println!(
        "  Extraction:   {} documents, {} capabilities, {} failed",
        o.documents_extracted, o.capabilities_added, o.extraction_failures
    );
    println!(
        "  Mapping:      {} pairs, {} mapped, {} below floor, {} failed",
        o.pairs_evaluated, o.mappings_added, o.pairs_below_floor, o.mapping_failures
    );
    if o.cancelled {
        println!("  Cancelled before completion.");
    }
    if let Some(err) = &run.error {
        println!("  Error:        {err}");
    }
    if let Some(done) = run.completed_at {
        let secs = (done - run.started_at).num_milliseconds() as f64 / 1000.0;
        println!("  Time:         {secs:.1}s");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

fn stage_label(stage: CycleStage) -> &'static str {
    match stage {
        CycleStage::Fetching => "Fetching sources",
        CycleStage::Extracting => "Extracting capabilities",
        CycleStage::Mapping => "Scoring against threats",
        CycleStage::Finalizing => "Finalizing",
        _ => "Working",
    }
}

impl CycleProgress for CliProgress {
    fn stage(&self, stage: CycleStage) {
        self.spinner.set_message(stage_label(stage));
    }

    fn item_done(&self, stage: CycleStage, current: usize, total: usize) {
        self.spinner
            .set_message(format!("{} [{current}/{total}]", stage_label(stage)));
    }

    fn done(&self, _run: &CycleRun) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

fn print_mappings(mappings: &[MappingView], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(mappings)?);
        return Ok(());
    }
    if mappings.is_empty() {
        println!("No mappings match.");
        return Ok(());
    }
    for m in mappings {
        println!("  [{:.2}] {}", m.feasibility_score, m.category_name);
        println!("         capability: {}", m.capability_statement);
        println!(
            "         from: {} ({})",
            m.document_title, m.source_name
        );
        if let Some(url) = &m.document_url {
            println!("         {url}");
        }
        if !m.rationale.is_empty() {
            println!("         why: {}", m.rationale);
        }
        println!("         scored {}", m.scored_at.format("%Y-%m-%d %H:%M"));
        println!();
    }
    Ok(())
}

async fn cmd_mappings_latest(
    ctx: &Context,
    min_score: Option<f64>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let min = min_score.unwrap_or(ctx.config.pipeline.relevance_floor);
    let mappings = storage.latest_mappings(min, limit).await?;
    print_mappings(&mappings, json)
}

async fn cmd_mappings_category(
    ctx: &Context,
    name: &str,
    min_score: Option<f64>,
    json: bool,
) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    if storage.get_threat_category_by_name(name).await?.is_none() {
        return Err(eyre!("no threat category named '{name}'"));
    }
    let min = min_score.unwrap_or(ctx.config.pipeline.relevance_floor);
    let mappings = storage.mappings_by_category(name, min).await?;
    print_mappings(&mappings, json)
}

async fn cmd_threats_list(ctx: &Context) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let categories = storage.list_threat_categories().await?;
    if categories.is_empty() {
        println!("Threat catalog is empty. Run `biothreat seed threats`.");
        return Ok(());
    }
    for c in &categories {
        println!("  {}", c.name);
        println!("    group:    {}", c.group);
        if let Some(timeline) = &c.timeline_estimate {
            println!("    timeline: {timeline}");
        }
        for criterion in &c.criteria {
            println!("    - {criterion}");
        }
    }
    Ok(())
}

async fn cmd_threats_overview(ctx: &Context, window_days: u32) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let cuts = ThreatLevelCuts::from(&ctx.config);
    let overview = storage.threat_overview(window_days, &cuts).await?;
    println!(
        "  {:<56}  {:<8}  {:>5}  {:>5}  {:>5}  {:<18}",
        "THREAT", "LEVEL", "MAPS", "MAX", "MEAN", "TREND"
    );
    for t in &overview {
        let fmt_score = |s: Option<f64>| s.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".into());
        println!(
            "  {:<56}  {:<8}  {:>5}  {:>5}  {:>5}  {:<18}",
            t.category_name,
            t.threat_level.as_str(),
            t.mapping_count,
            fmt_score(t.max_score),
            fmt_score(t.mean_score),
            format!("{} ({}/{})", t.trend.as_str(), t.recent_count, t.prior_count),
        );
    }
    Ok(())
}

async fn cmd_threats_import(ctx: &Context, file: &Path) -> Result<()> {
    let storage = ctx.storage().await?;
    let report = biothreat_core::import_threats(&storage, file).await?;
    println!(
        "Imported {}: {} new, {} updated, {} unchanged",
        file.display(),
        report.inserted,
        report.updated,
        report.unchanged
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

async fn cmd_sources_list(ctx: &Context) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let sources = storage.list_sources().await?;
    if sources.is_empty() {
        println!("No sources registered. Run `biothreat seed sources`.");
        return Ok(());
    }
    for s in &sources {
        let last = s
            .last_fetched_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "  [{}] {} ({}, {})",
            if s.active { "on " } else { "off" },
            s.name,
            s.kind,
            s.category
        );
        println!("        {}  last fetched: {last}", s.endpoint);
    }
    Ok(())
}

async fn cmd_sources_add(
    ctx: &Context,
    name: &str,
    kind: SourceKind,
    endpoint: &str,
    category: &str,
) -> Result<()> {
    let storage = ctx.storage().await?;
    let source = biothreat_core::register_source(&storage, name, kind, endpoint, category).await?;
    println!("Registered source '{}' ({})", source.name, source.id);
    Ok(())
}

async fn cmd_sources_toggle(ctx: &Context, name: &str, active: bool) -> Result<()> {
    let storage = ctx.storage().await?;
    if !storage.set_source_active(name, active).await? {
        return Err(eyre!("no source named '{name}'"));
    }
    println!(
        "Source '{name}' {}",
        if active { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn cmd_seed(ctx: &Context, target: SeedTarget) -> Result<()> {
    let storage = ctx.storage().await?;
    let (what, report) = match target {
        SeedTarget::Sources => ("sources", biothreat_core::seed_sources(&storage).await?),
        SeedTarget::Threats => ("threat categories", biothreat_core::seed_threats(&storage).await?),
    };
    println!(
        "Seeded {} new {what} ({} already present)",
        report.added, report.skipped
    );
    Ok(())
}

async fn cmd_ingest_manual(ctx: &Context, entry: ManualEntry) -> Result<()> {
    let storage = ctx.storage().await?;
    let (doc, inserted) = biothreat_core::ingest_manual(&storage, entry).await?;
    if inserted {
        println!("Stored document {}; it will be extracted on the next cycle.", doc.id);
    } else {
        println!("Document already stored as {}.", doc.id);
    }
    Ok(())
}

async fn cmd_documents_search(ctx: &Context, query: &str, limit: u32) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let hits = storage.search_documents(query, limit).await?;
    if hits.is_empty() {
        println!("No documents match '{query}'.");
        return Ok(());
    }
    for hit in &hits {
        println!("  {}  ({})", hit.title, hit.source_name);
        if let Some(url) = &hit.url {
            println!("    {url}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config: AppConfig = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
