use std::sync::Arc;

use anyhow::{bail, Result};
use aqsync_core::{MonitorKey, SourceKind};
use aqsync_sync::{ApiSyncRequest, PassSummary, SyncConfig, SyncPipeline};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "aqsync")]
#[command(about = "Incremental AirNow / AQS synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One AirNow hourly-file pass up to the current hour.
    Sync,
    /// One AQS API pass over a date range.
    Backfill(ApiArgs),
    /// AirNow and AQS passes side by side.
    SyncAll(ApiArgs),
    /// Create staging tables and indexes.
    Migrate,
    /// Print the resume point of every configured stream.
    Watermark,
    /// Run AirNow passes on the configured cron until Ctrl-C.
    Schedule,
}

#[derive(Debug, Args)]
struct ApiArgs {
    /// First local date, defaults to AQSYNC_DEFAULT_START.
    #[arg(long)]
    begin: Option<NaiveDate>,
    /// Last local date (inclusive), defaults to today.
    #[arg(long)]
    end: Option<NaiveDate>,
    /// AQSID to request; repeatable. Defaults to the watch-list.
    #[arg(long = "site")]
    sites: Vec<String>,
    /// Parameter code to request; repeatable. Defaults to the watch-list.
    #[arg(long = "param")]
    params: Vec<String>,
    /// Start at the stream watermark's day when it is later than --begin.
    #[arg(long)]
    resume: bool,
}

impl ApiArgs {
    fn into_request(self, config: &SyncConfig) -> Result<ApiSyncRequest> {
        let begin = self.begin.unwrap_or(config.default_start);
        let end = self.end.unwrap_or_else(|| Utc::now().date_naive());
        if begin > end {
            bail!("--begin {begin} is after --end {end}");
        }
        let mut request = ApiSyncRequest::new(begin, end);
        request.sites = self.sites.into_iter().map(MonitorKey::new).collect();
        request.parameters = self.params;
        request.resume = self.resume;
        Ok(request)
    }
}

fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (file_layer, guard) = match std::env::var_os("AQSYNC_LOG_DIR") {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "aqsync.log"));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn print_summary(summary: &PassSummary) {
    let watermark = summary
        .watermark_after
        .map(|w| w.to_string())
        .unwrap_or_else(|| "none".to_string());
    println!(
        "{} pass complete: run_id={} units={} skipped={} failed={} inserted={} watermark={} refreshed={}",
        summary.stream,
        summary.run_id,
        summary.units_discovered,
        summary.units_skipped,
        summary.failures.len(),
        summary.records_inserted,
        watermark,
        summary.refreshed
    );
    if let Some(path) = &summary.report_path {
        println!("report: {}", path.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => print_summary(&aqsync_sync::run_sync_once_from_env().await?),
        Commands::Backfill(args) => {
            let request = args.into_request(&config)?;
            let pipeline = SyncPipeline::connect(config).await?;
            print_summary(&pipeline.run_backfill(request).await?);
        }
        Commands::SyncAll(args) => {
            let request = args.into_request(&config)?;
            let pipeline = SyncPipeline::connect(config).await?;
            let (airnow, aqs) = pipeline.run_all(request).await;
            let mut failed = false;
            for result in [airnow, aqs] {
                match result {
                    Ok(summary) => print_summary(&summary),
                    Err(err) => {
                        eprintln!("{err}");
                        failed = true;
                    }
                }
            }
            if failed {
                bail!("at least one stream did not complete");
            }
        }
        Commands::Migrate => {
            let pipeline = SyncPipeline::connect(config).await?;
            pipeline.migrate().await?;
            println!("staging tables ready");
        }
        Commands::Watermark => {
            let pipeline = SyncPipeline::connect(config).await?;
            for source in [SourceKind::AirNow, SourceKind::Aqs] {
                if pipeline.subscribe(source).is_none() {
                    println!("{source}: disabled");
                    continue;
                }
                match pipeline.watermark(source).await? {
                    Some(w) => println!("{source}: {w}"),
                    None => println!("{source}: no data yet"),
                }
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set AQSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await?;
            info!(cron = %pipeline.config().airnow_sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
            sched.shutdown().await?;
        }
    }

    Ok(())
}
