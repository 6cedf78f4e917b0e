//! CLI command definitions, routing, and tracing setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use enricher_core::{
    BudgetTracker, CandidateSelector, Orchestrator, RateLimiter, RecheckCache, RunProgress,
    RunReport, SELECTION_THROTTLE_KEY, WorkQueue, accept_mapping, accepted_fingerprint,
    fingerprint,
};
use enricher_mapping::{FieldCatalog, validate};
use enricher_shared::{
    AppConfig, Clock, Deadline, FieldDef, FieldId, FieldValue, RecordId, RunConfig, SchemaId,
    Subject, SystemClock, api_key, config_dir, expand_home, init_config, load_config,
    load_config_from, validate_config,
};
use enricher_storage::Storage;
use enricher_transport::{HttpOptions, HttpTransport};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Enricher: fill record fields from a rate- and quota-limited classification service.
#[derive(Parser)]
#[command(
    name = "enricher",
    version,
    about = "Enrich records from a rate- and quota-limited classification service.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.enricher/enricher.toml).
    #[arg(long, global = true, env = "ENRICHER_CONFIG")]
    pub config: Option<PathBuf>,

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
    /// Run one bounded enrichment pass. Schedule this periodically.
    Run {
        /// Seconds this run may take (defaults to [schedule] time_budget_secs).
        #[arg(long)]
        time_budget: Option<u64>,

        /// Only drain the queue; skip the selection pass.
        #[arg(long)]
        skip_select: bool,
    },

    /// Find records needing enrichment and queue them.
    Select,

    /// Queue records by id.
    Enqueue {
        /// Record ids.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Show queued records.
    Queue,

    /// Show budget counters.
    Budgets {
        /// Pull authoritative counts from the status endpoint first.
        #[arg(long)]
        refresh: bool,
    },

    /// Validate or accept the mapping source.
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },

    /// Delete recheck cache entries past the prune horizon.
    Prune,

    /// Manage the bundled record store.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Show recent runs.
    Runs {
        /// Number of runs to show.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Mapping subcommands.
#[derive(Subcommand)]
pub(crate) enum MappingAction {
    /// Check the configured mapping against the field catalog.
    Validate,
    /// Validate and, if clean, make it the mapping runs use.
    Accept,
}

/// Catalog subcommands.
#[derive(Subcommand)]
pub(crate) enum CatalogAction {
    /// Load fields and records from a JSON file.
    Load {
        /// Path to the JSON file.
        file: PathBuf,
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
        0 => "enricher=info",
        1 => "enricher=debug",
        _ => "enricher=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config {
        action: ConfigAction::Init,
    } = cli.command
    {
        return cmd_config_init();
    }

    let ctx = Context::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run {
            time_budget,
            skip_select,
        } => cmd_run(&ctx, time_budget, skip_select).await,
        Command::Select => cmd_select(&ctx).await,
        Command::Enqueue { ids } => cmd_enqueue(&ctx, &ids).await,
        Command::Queue => cmd_queue(&ctx).await,
        Command::Budgets { refresh } => cmd_budgets(&ctx, refresh).await,
        Command::Mapping { action } => cmd_mapping(&ctx, action).await,
        Command::Prune => cmd_prune(&ctx).await,
        Command::Catalog {
            action: CatalogAction::Load { file },
        } => cmd_catalog_load(&ctx, &file).await,
        Command::Runs { limit } => cmd_runs(&ctx, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&ctx),
        },
    }
}

/// Loaded config plus the directory relative mapping paths resolve against.
struct Context {
    config: AppConfig,
    base_dir: Option<PathBuf>,
}

impl Context {
    fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self {
                config: load_config_from(path)?,
                base_dir: path.parent().map(Path::to_path_buf),
            }),
            None => Ok(Self {
                config: load_config()?,
                base_dir: config_dir().ok(),
            }),
        }
    }

    async fn storage(&self) -> Result<Arc<Storage>> {
        let path = expand_home(&self.config.defaults.database);
        Ok(Arc::new(Storage::open(&path).await?))
    }

    /// Open the database without migrating or writing (status commands).
    async fn storage_readonly(&self) -> Result<Storage> {
        let path = expand_home(&self.config.defaults.database);
        if !path.exists() {
            return Err(eyre!("no database at '{}' yet", path.display()));
        }
        Ok(Storage::open_readonly(&path).await?)
    }

    fn run_config(&self) -> RunConfig {
        RunConfig::from(&self.config)
    }

    fn mapping_text(&self) -> Result<String> {
        Ok(self.config.mapping.load_text(self.base_dir.as_deref())?)
    }
}

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn http_transport(config: &AppConfig) -> Result<HttpTransport> {
    let key = match api_key(config) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "calling the service without an API key");
            None
        }
    };
    Ok(HttpTransport::new(HttpOptions::from_config(&config.service, key)?)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(ctx: &Context, time_budget: Option<u64>, skip_select: bool) -> Result<()> {
    let clock = system_clock();
    let mut run_config = ctx.run_config();
    if let Some(secs) = time_budget {
        run_config.time_budget = Duration::from_secs(secs);
        run_config.check_claim_lease()?;
    }
    // The window opens at invocation, not after setup.
    let deadline = Deadline::after(clock.as_ref(), run_config.time_budget);

    validate_config(&ctx.config)?;
    let mapping_text = ctx.mapping_text()?;
    let storage = ctx.storage().await?;
    let transport = http_transport(&ctx.config)?;
    let status = transport.status_source();

    let mut orchestrator = Orchestrator::new(
        storage.clone(),
        storage,
        Arc::new(transport),
        clock,
        run_config,
        mapping_text,
    );
    if let Some(status) = status {
        orchestrator = orchestrator.with_status_source(Arc::new(status));
    }
    if skip_select {
        orchestrator = orchestrator.skip_selection();
    }

    info!(ends_at = %deadline.ends_at(), "starting enrichment run");
    let progress = CliProgress::new()?;
    let report = match orchestrator.run(deadline, &progress).await {
        Ok(report) => report,
        Err(e) => {
            progress.abandon();
            return Err(e.into());
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("  Run {} finished: {}", report.run_id, report.stop_reason);
    if let Some(selected) = report.selected {
        println!(
            "  Selected: {} found, {} newly queued",
            selected.found, selected.enqueued
        );
    }
    println!("  Records:  {}", report.records_processed);
    println!(
        "  Subjects: {} checked, {} failed",
        report.subjects_checked, report.subjects_failed
    );
    println!(
        "  Writes:   {} applied, {} rejected",
        report.writes_applied, report.writes_rejected
    );
    println!("  Time:     {:.1}s", report.elapsed_ms as f64 / 1000.0);
    println!();
}

async fn cmd_select(ctx: &Context) -> Result<()> {
    let storage = ctx.storage().await?;
    let clock = system_clock();
    let run_config = ctx.run_config();

    let queue = WorkQueue::new(storage.clone(), clock.clone(), run_config.claim_lease);
    let pacer = RateLimiter::new(
        storage.clone(),
        clock,
        SELECTION_THROTTLE_KEY,
        run_config.selection_interval,
    );
    let selector = CandidateSelector::new(storage, queue, run_config.selection, pacer);

    let outcome = selector.select().await?;
    println!(
        "Found {} candidate(s), {} newly queued.",
        outcome.found, outcome.enqueued
    );
    Ok(())
}

async fn cmd_enqueue(ctx: &Context, ids: &[String]) -> Result<()> {
    let storage = ctx.storage().await?;
    let queue = WorkQueue::new(storage, system_clock(), ctx.run_config().claim_lease);

    let mut added = 0;
    for id in ids {
        if queue.enqueue(&RecordId::from(id.as_str())).await? {
            added += 1;
        }
    }
    println!(
        "Queued {added} record(s); {} already queued.",
        ids.len() - added
    );
    Ok(())
}

async fn cmd_queue(ctx: &Context) -> Result<()> {
    let storage = Arc::new(ctx.storage_readonly().await?);
    let queue = WorkQueue::new(storage, system_clock(), ctx.run_config().claim_lease);

    let entries = queue.entries().await?;
    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for entry in &entries {
        let claim = entry
            .claimed_by
            .as_deref()
            .map(|run| format!("  (claimed by {run})"))
            .unwrap_or_default();
        println!(
            "  {:<24} {}{claim}",
            entry.record_id,
            entry.enqueued_at.to_rfc3339()
        );
    }
    println!("{} record(s) queued.", entries.len());
    Ok(())
}

async fn cmd_budgets(ctx: &Context, refresh: bool) -> Result<()> {
    let storage = ctx.storage().await?;
    let clock = system_clock();
    let tracker = BudgetTracker::new(storage, clock.clone(), ctx.config.budgets.clone());
    tracker.ensure().await?;

    if refresh {
        let transport = http_transport(&ctx.config)?;
        let status = transport
            .status_source()
            .ok_or_else(|| eyre!("[service] status_endpoint is not set"))?;
        for budget in ctx.config.budgets.iter().filter(|b| b.capacity > 0) {
            if tracker.refresh(&budget.name, &status).await?.is_none() {
                println!("  {}: refresh failed, keeping stored count", budget.name);
            }
        }
    }

    let rows = tracker.snapshot().await?;
    if rows.is_empty() {
        println!("No budgets configured.");
        return Ok(());
    }
    let now_ms = clock.now().timestamp_millis();
    for row in rows {
        if row.is_unlimited() {
            println!("  {:<20} unlimited", row.name);
        } else {
            println!(
                "  {:<20} {}/{}",
                row.name,
                row.remaining_at(now_ms),
                row.capacity
            );
        }
    }
    Ok(())
}

async fn cmd_mapping(ctx: &Context, action: MappingAction) -> Result<()> {
    let storage = ctx.storage().await?;
    let catalog = FieldCatalog::new(storage.list_fields().await?);
    let text = ctx.mapping_text()?;

    match action {
        MappingAction::Validate => {
            let mapping = match validate(&text, &catalog, &ctx.config.categories) {
                Ok(mapping) => mapping,
                Err(errors) => {
                    for error in &errors {
                        println!("  {error}");
                    }
                    return Err(eyre!("mapping has {} problem(s)", errors.len()));
                }
            };
            println!("Mapping is valid: {} block(s).", mapping.blocks().len());
            match accepted_fingerprint(&storage).await? {
                Some(accepted) if accepted == fingerprint(&text) => {
                    println!("It is the accepted mapping.");
                }
                Some(_) => {
                    println!("It differs from the accepted mapping; run `enricher mapping accept`.");
                }
                None => println!("No mapping has been accepted yet."),
            }
        }
        MappingAction::Accept => {
            let mapping =
                accept_mapping(&storage, &text, &catalog, &ctx.config.categories).await?;
            println!(
                "Mapping accepted: {} block(s), fingerprint {}.",
                mapping.blocks().len(),
                fingerprint(&text)
            );
        }
    }
    Ok(())
}

async fn cmd_prune(ctx: &Context) -> Result<()> {
    let storage = ctx.storage().await?;
    let run_config = ctx.run_config();
    let cache = RecheckCache::new(
        storage.clone(),
        system_clock(),
        run_config.recheck_interval,
        run_config.max_retries,
        run_config.prune_multiplier,
    );

    let pruned = cache.prune().await?;
    let left = storage.count_checked_subjects().await?;
    println!("Pruned {pruned} entr(ies); {left} subject(s) still tracked.");
    Ok(())
}

/// `catalog load` input.
#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    fields: Vec<FieldDef>,
    #[serde(default)]
    records: Vec<RecordSeed>,
}

#[derive(Deserialize)]
struct RecordSeed {
    id: RecordId,
    schema: SchemaId,
    #[serde(default)]
    values: HashMap<FieldId, FieldValue>,
}

async fn cmd_catalog_load(ctx: &Context, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let catalog: CatalogFile = serde_json::from_str(&content)
        .map_err(|e| eyre!("invalid catalog file '{}': {e}", file.display()))?;

    let storage = ctx.storage().await?;
    for field in &catalog.fields {
        storage.upsert_field(field).await?;
    }
    for record in &catalog.records {
        storage.insert_record(&record.id, &record.schema).await?;
        for (field, value) in &record.values {
            storage.set_value(&record.id, field, value).await?;
        }
    }

    info!(
        fields = catalog.fields.len(),
        records = catalog.records.len(),
        "catalog loaded"
    );
    println!(
        "Loaded {} field(s) and {} record(s).",
        catalog.fields.len(),
        catalog.records.len()
    );
    Ok(())
}

async fn cmd_runs(ctx: &Context, limit: u32) -> Result<()> {
    let storage = ctx.storage_readonly().await?;
    let runs = storage.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for (id, started_at, stats) in runs {
        println!("  {id}  {started_at}");
        match stats {
            Some(stats) => println!("    {stats}"),
            None => println!("    (unfinished)"),
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(ctx: &Context) -> Result<()> {
    let toml_str = toml::to_string_pretty(&ctx.config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Result<Self> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Ok(Self { spinner })
    }

    fn abandon(&self) {
        self.spinner.finish_and_clear();
    }
}

impl RunProgress for CliProgress {
    fn started(&self, queued: usize) {
        self.spinner.set_message(format!("{queued} record(s) queued"));
    }

    fn record_started(&self, record: &RecordId, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Record [{current}/{total}] {record}"));
    }

    fn subject_done(&self, subject: &Subject, ok: bool) {
        if ok {
            self.spinner.set_message(format!("Checked {subject}"));
        } else {
            self.spinner.println(format!("  failed: {subject}"));
        }
    }

    fn finished(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
