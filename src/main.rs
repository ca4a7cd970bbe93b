use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use asset_migrate::config::{AppConfig, ConfigOverrides, DEFAULT_CONFIG_FILE, StoreKind};
use asset_migrate::context::MigrationContext;
use asset_migrate::core::orchestrator::remaining_after;
use asset_migrate::core::progress::{format_bytes, format_duration};
use asset_migrate::core::{
    Manifest, MigrationSummary, Orchestrator, RunReport, discover_all, verify_manifest,
};
use asset_migrate::error::{ExitStatus, MigrateError};
use asset_migrate::logging::{self, LogConfig};
use asset_migrate::store;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

const MAX_LISTED_FAILURES: usize = 10;

#[derive(Parser)]
#[command(name = "asset-migrate", version)]
#[command(about = "Migrate local media assets to a remote object store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./asset-migrate.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit diagnostic logs as JSON on stderr
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload discovered assets to the bucket
    Migrate(MigrateArgs),
    /// Check a saved manifest against the bucket
    Verify(ManifestArgs),
    /// Print the summary of a saved manifest
    Summary(ManifestArgs),
    /// Write a starter configuration file
    InitConfig {
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct MigrateArgs {
    /// Walk through the whole run without uploading anything
    #[arg(long)]
    dry_run: bool,

    /// Source directories, comma separated
    #[arg(long, value_delimiter = ',')]
    source: Vec<PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Upload even when the bucket already holds identical content
    #[arg(long)]
    no_skip_existing: bool,

    #[arg(long)]
    bucket: Option<String>,

    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Where to write the manifest
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Continue from a previous manifest, skipping what it already delivered
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,
}

#[derive(Args)]
struct ManifestArgs {
    /// Manifest to read (defaults to the configured manifest path)
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            let status = e
                .downcast_ref::<MigrateError>()
                .map(MigrateError::exit_status)
                .unwrap_or(ExitStatus::Fatal);
            tracing::error!(error = %format!("{e:#}"), "Migration aborted");
            eprintln!("error: {e:#}");
            status.into()
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let mut overrides = ConfigOverrides {
        verbose: cli.verbose.then_some(true),
        json_logs: cli.json_logs.then_some(true),
        ..Default::default()
    };

    match cli.command {
        Commands::Migrate(args) => {
            overrides.bucket = args.bucket.clone();
            overrides.store = args.store;
            overrides.sources = (!args.source.is_empty()).then(|| args.source.clone());
            overrides.concurrency = args.concurrency;
            overrides.max_retries = args.max_retries;
            overrides.skip_existing = args.no_skip_existing.then_some(false);
            overrides.dry_run = args.dry_run.then_some(true);
            overrides.manifest_path = args.manifest.clone();

            let app = load_config(cli.config.as_deref(), &overrides)?;
            run_migrate(app, args).await
        }
        Commands::Verify(args) => {
            let app = load_config(cli.config.as_deref(), &overrides)?;
            run_verify(app, args).await
        }
        Commands::Summary(args) => {
            let app = load_config(cli.config.as_deref(), &overrides)?;
            run_summary(app, args).await
        }
        Commands::InitConfig { path, force } => {
            logging::init(LogConfig {
                json: cli.json_logs,
                verbose: cli.verbose,
            });
            run_init_config(path, force)
        }
    }
}

fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<AppConfig> {
    let app = AppConfig::load(path, overrides).map_err(MigrateError::from)?;
    logging::init(LogConfig {
        json: app.json_logs,
        verbose: app.verbose,
    });
    Ok(app)
}

async fn run_migrate(app: AppConfig, args: MigrateArgs) -> Result<ExitStatus> {
    let human = args.format == OutputFormat::Human;
    let ctx = MigrationContext::from_app_config(&app)?.with_progress_bar(human);

    if human {
        print_banner(&app);
    }

    let assets = discover_all(&app.sources, &app.public_dir)
        .await
        .map_err(MigrateError::from)?;

    let assets = match &args.resume {
        Some(previous_path) => {
            let previous = Manifest::load(previous_path)
                .await
                .map_err(MigrateError::from)?;
            let (remaining, done) = remaining_after(&previous, assets);
            info!(
                previous = %previous.migration_id(),
                already_done = done,
                remaining = remaining.len(),
                "Resuming migration"
            );
            if same_file(previous_path, &ctx.manifest_path) {
                let archive = archive_path(&ctx.manifest_path, &previous);
                previous.save(&archive).await.map_err(MigrateError::from)?;
                info!(archive = %archive.display(), "Archived previous manifest");
            }
            remaining
        }
        None => assets,
    };

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining uploads");
            cancel.cancel();
        }
    });

    let log_path = app.log_path.clone();
    let report = Orchestrator::new(ctx).run(app.sources.clone(), assets).await?;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report.manifest)?);
        }
        OutputFormat::Human => print_report(&report, &log_path),
    }

    Ok(report.exit_status())
}

async fn run_verify(mut app: AppConfig, args: ManifestArgs) -> Result<ExitStatus> {
    let path = args.manifest.unwrap_or_else(|| app.manifest_path.clone());
    let manifest = Manifest::load(&path).await.map_err(MigrateError::from)?;

    if app.bucket.is_none() {
        app.bucket = Some(manifest.target_bucket().to_string());
    }
    let store = store::build_store(&app).map_err(MigrateError::from)?;

    let result = verify_manifest(&manifest, store, app.concurrency)
        .await
        .map_err(MigrateError::from)?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Human => {
            println!("Verification of {} ({:?})", result.migration_id, result.status);
            println!("  Verified:    {}", result.verified_count);
            println!("  Mismatched:  {}", result.mismatch_count);
            println!("  Missing:     {}", result.missing_count);
            for d in result.discrepancies.iter().take(MAX_LISTED_FAILURES) {
                println!("  - {}: {}", d.remote_key, d.description);
            }
            if result.discrepancies.len() > MAX_LISTED_FAILURES {
                println!(
                    "  ... and {} more",
                    result.discrepancies.len() - MAX_LISTED_FAILURES
                );
            }
        }
    }

    Ok(if result.passed() {
        ExitStatus::Success
    } else {
        ExitStatus::PartialFailure
    })
}

async fn run_summary(app: AppConfig, args: ManifestArgs) -> Result<ExitStatus> {
    let path = args.manifest.unwrap_or_else(|| app.manifest_path.clone());
    let manifest = Manifest::load(&path).await.map_err(MigrateError::from)?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(manifest.summary())?),
        OutputFormat::Human => {
            println!(
                "Migration {} to bucket {}",
                manifest.migration_id(),
                manifest.target_bucket()
            );
            if !manifest.is_finalized() {
                println!("  (run did not finish; counts are from the last checkpoint)");
            }
            print_summary(manifest.summary());
            print_failures(&manifest, &app.log_path);
        }
    }

    Ok(ExitStatus::from_summary(manifest.summary()))
}

fn run_init_config(path: Option<PathBuf>, force: bool) -> Result<ExitStatus> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        eprintln!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
        return Ok(ExitStatus::ConfigError);
    }

    let starter = AppConfig {
        bucket: Some("my-media-bucket".to_string()),
        endpoint: Some("https://storage.example.com".to_string()),
        ..Default::default()
    };
    let body = starter.to_toml().context("Failed to serialize config")?;
    let text = format!(
        "# asset-migrate configuration\n\
         # MIGRATE_* environment variables and command-line flags override these values.\n\
         # Set access_token through MIGRATE_ACCESS_TOKEN rather than in this file.\n\n{body}"
    );
    std::fs::write(&path, text)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote {}", path.display());
    Ok(ExitStatus::Success)
}

fn print_banner(app: &AppConfig) {
    println!("Asset migration");
    println!("  Bucket:       {}", app.bucket.as_deref().unwrap_or("(unset)"));
    println!("  Store:        {:?}", app.store);
    if let Some(endpoint) = &app.endpoint {
        println!("  Endpoint:     {endpoint}");
    }
    println!("  Token:        {}", app.masked_token());
    println!(
        "  Sources:      {}",
        app.sources
            .iter()
            .map(|s| s.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Concurrency:  {}", app.concurrency);
    println!("  Max retries:  {}", app.max_retries);
    if app.dry_run {
        println!("  DRY RUN: nothing will be uploaded");
    }
    println!();
}

fn print_report(report: &RunReport, log_path: &Path) {
    println!();
    if report.fatal.is_some() {
        println!("Migration aborted");
    } else if report.cancelled {
        println!("Migration cancelled");
    } else {
        println!("Migration complete");
    }
    print_summary(report.manifest.summary());
    print_failures(&report.manifest, log_path);
    if let Some(e) = &report.fatal {
        println!("\nFatal: {e}");
    }
}

fn print_summary(summary: &MigrationSummary) {
    let duration = std::time::Duration::from_millis(summary.duration_ms);
    println!("  Total:        {}", summary.total_files);
    println!("  Uploaded:     {}", summary.success_count);
    println!("  Skipped:      {}", summary.skipped_count);
    println!("  Failed:       {}", summary.failed_count);
    println!("  Data:         {}", format_bytes(summary.total_bytes_uploaded));
    println!("  Duration:     {}", format_duration(duration));
    println!(
        "  Throughput:   {}/s",
        format_bytes(summary.average_speed_bytes_per_sec as u64)
    );
}

fn print_failures(manifest: &Manifest, log_path: &Path) {
    let failed = manifest.failed_records();
    if failed.is_empty() {
        return;
    }
    println!("\nFailed uploads:");
    for record in failed.iter().take(MAX_LISTED_FAILURES) {
        println!(
            "  - {}: {}",
            record.id,
            record.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    if failed.len() > MAX_LISTED_FAILURES {
        println!(
            "  ... and {} more (see {})",
            failed.len() - MAX_LISTED_FAILURES,
            log_path.display()
        );
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn archive_path(manifest_path: &Path, previous: &Manifest) -> PathBuf {
    manifest_path.with_file_name(format!("manifest-{}.json", previous.migration_id()))
}
