//! Tally CLI - reports over compliance job output.
//!
//! ```text
//! tally report -s s3://audit-bucket/policies -p ec2-tag-compliance -t ec2 --days 7 > report.csv
//! tally formats
//! ```
//!
//! The CSV goes to stdout; logs go to stderr.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tally_core::cache::{cache_from_config, CacheConfig, CacheStore, NullCache};
use tally_core::fetch::DEFAULT_FETCH_WORKERS;
use tally_core::format::FormatterRegistry;
use tally_core::metrics::ReportMetrics;
use tally_core::report::{PolicyDescriptor, ReportPipeline};
use tally_core::source::{ObjectStore, OutputLocation};

#[derive(Debug, Parser)]
#[command(name = "tally", author, version, about, long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a CSV report of a policy's matched resources
    Report(ReportArgs),
    /// List the resource types a report can be generated for
    Formats,
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Output root the policy wrote to: s3://bucket/prefix or a directory
    #[arg(short = 's', long = "output-dir")]
    output_dir: String,

    /// Policy name; its output lives beneath the output root
    #[arg(short, long)]
    policy: String,

    /// Resource type of the policy, e.g. ec2
    #[arg(short = 't', long = "resource-type")]
    resource_type: String,

    /// Report on batches from the last N days
    #[arg(long, default_value_t = 1, conflicts_with = "start")]
    days: i64,

    /// Report on batches since this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    start: Option<NaiveDate>,

    /// Also dump the raw records as JSON to this file (`-` for stderr)
    #[arg(long)]
    raw: Option<String>,

    /// Concurrent batch fetches
    #[arg(long, default_value_t = DEFAULT_FETCH_WORKERS)]
    workers: usize,

    /// AWS region for the object store
    #[arg(long, env = "AWS_DEFAULT_REGION")]
    region: Option<String>,

    /// Cache file for fetched records
    #[arg(long, env = "TALLY_CACHE")]
    cache: Option<String>,

    /// Minutes a cache file stays fresh; 0 disables the cache
    #[arg(long, env = "TALLY_CACHE_PERIOD", default_value_t = 15)]
    cache_period: u64,
}

impl ReportArgs {
    fn start_date(&self) -> DateTime<Utc> {
        match self.start {
            Some(date) => date.and_time(chrono::NaiveTime::MIN).and_utc(),
            None => Utc::now() - Duration::days(self.days),
        }
    }
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Formats => list_formats(),
        Commands::Report(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(report(args))
        }
    }
}

/// Logs to stderr so stdout carries only the report
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

fn list_formats() -> Result<()> {
    let registry = FormatterRegistry::with_defaults();
    let mut stdout = io::stdout().lock();
    for resource_type in registry.resource_types() {
        let formatter = registry.get(resource_type)?;
        writeln!(stdout, "{}\t{}", resource_type, formatter.headers().join(","))?;
    }
    Ok(())
}

async fn report(args: ReportArgs) -> Result<()> {
    let root = OutputLocation::parse(&args.output_dir)?;
    let policy = PolicyDescriptor::new(&args.policy, &args.resource_type, root.for_policy(&args.policy));
    let start_date = args.start_date();

    let cache = open_cache(&CacheConfig {
        path: args.cache.clone(),
        period_minutes: args.cache_period,
    })?;

    let metrics = Arc::new(ReportMetrics::new());
    let mut pipeline = ReportPipeline::new(FormatterRegistry::with_defaults())
        .with_workers(args.workers)
        .with_metrics(metrics.clone())
        .with_cache(cache);

    if policy.output.is_remote() {
        pipeline = pipeline.with_object_store(object_store(args.region.clone()).await?);
    }

    let mut raw_file: Option<Box<dyn Write>> = match args.raw.as_deref() {
        None => None,
        Some("-") => Some(Box::new(io::stderr())),
        Some(path) => Some(Box::new(
            File::create(path).with_context(|| format!("Failed to create {}", path))?,
        )),
    };

    let mut stdout = io::stdout().lock();
    let summary = pipeline
        .generate_report(
            &policy,
            start_date,
            &mut stdout,
            raw_file.as_mut().map(|w| w as &mut dyn Write),
        )
        .await
        .with_context(|| format!("Report for policy {} failed", policy.name))?;

    let latency = metrics.batch_fetch_latency.percentiles();
    info!(
        run_id = %summary.run_id,
        rows = summary.rows,
        records = summary.records,
        batches = summary.batches,
        from_cache = summary.from_cache,
        fetch_p50_ms = ?latency.p50_ms,
        fetch_p99_ms = ?latency.p99_ms,
        "Report complete"
    );
    Ok(())
}

/// Load the configured cache; an unreadable manifest only disables caching
fn open_cache(config: &CacheConfig) -> Result<Box<dyn CacheStore>> {
    let mut cache = cache_from_config(Some(config));
    if let Err(e) = cache.load() {
        if !e.is_cache_error() {
            return Err(e).context("Failed to load cache");
        }
        warn!(error = %e, "Ignoring unusable cache");
        cache = Box::new(NullCache::default());
    }
    Ok(cache)
}

#[cfg(feature = "s3")]
async fn object_store(region: Option<String>) -> Result<Arc<dyn ObjectStore>> {
    let store = tally_core::source::s3::S3ObjectStore::from_env(region).await;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "s3"))]
async fn object_store(region: Option<String>) -> Result<Arc<dyn ObjectStore>> {
    anyhow::bail!(
        "s3 output locations need a build with the `s3` feature (region: {})",
        region.as_deref().unwrap_or("default")
    )
}
