use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use converter::{
    config::ConverterConfig,
    job::{JobReport, JobRequest},
    resource::ResourceMonitor,
    commands::{self, CommandFile},
    workspace, FFmpegManager, HostController, InboxIngest, LedgerLock, MediaTools, QuotaLedger, SystemMonitor,
};
use humansize::{format_size, BINARY};
use log::{error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};

/// Circular clip to vertical reel converter daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the inbox and convert clips as they arrive (default)
    Serve,
    /// Convert one clip for an account and print the report as JSON
    Convert {
        #[arg(long)]
        account: String,
        #[arg(long)]
        input: PathBuf,
        /// Copy the finished reel here as well
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Credit purchased premium packs to an account; queued if the daemon is running
    Grant {
        #[arg(long)]
        account: String,
        #[arg(long, default_value_t = 1)]
        packs: u32,
    },
    /// Print host load, workspace and ledger statistics
    Stats,
    /// Remove leftover job workspaces from the temp dir (refused while the daemon runs)
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only raises the default level
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose && std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    let cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Convert { account, input, output } => convert(cfg, account, input, output).await,
        Command::Grant { account, packs } => grant(&cfg, &account, packs),
        Command::Stats => stats(&cfg).await,
        Command::Cleanup => cleanup(&cfg),
    }
}

/// Startup checks shared by every command that runs jobs. The controller holds
/// the ledger lock for as long as it lives.
async fn start_controller(cfg: ConverterConfig) -> Result<HostController> {
    FFmpegManager::new(&cfg)
        .check_available()
        .await
        .context("FFmpeg is not usable")?;

    HostController::with_host(cfg)
}

async fn serve(cfg: ConverterConfig) -> Result<()> {
    info!("Reels daemon starting");
    info!("Configuration loaded:");
    info!("  Inbox: {}", cfg.inbox_dir.display());
    info!("  Output: {}", cfg.output_dir.display());
    info!("  Ledger: {}", cfg.ledger_path.display());
    info!("  Canvas: {}x{} ({:?}, {:?})", cfg.canvas_width, cfg.canvas_height, cfg.layout, cfg.fill_axis);
    info!("  Worker slots: {}", cfg.worker_pool_size);
    info!("  Limits: {:.0}s, {} in, {} out",
          cfg.max_duration_seconds,
          format_size(cfg.max_input_size_bytes, BINARY),
          format_size(cfg.max_output_size_bytes, BINARY));
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    std::fs::create_dir_all(&cfg.inbox_dir)
        .with_context(|| format!("Failed to create inbox directory: {}", cfg.inbox_dir.display()))?;

    let controller = start_controller(cfg).await?;

    // Safe only now that this process owns the ledger
    let cleaned = workspace::cleanup_temp_dir(&controller.config().temp_dir)
        .context("Failed to cleanup leftover workspaces on startup")?;
    if cleaned > 0 {
        info!("✅ Startup cleanup removed {} leftover temp file(s)", cleaned);
    }

    let ingest = InboxIngest::new(controller);

    ingest
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, finishing in-flight jobs"),
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
        })
        .await?;

    info!("Reels daemon stopped");
    Ok(())
}

async fn convert(cfg: ConverterConfig, account: String, input: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let size = std::fs::metadata(&input)
        .with_context(|| format!("Failed to stat input: {}", input.display()))?
        .len();
    let controller = start_controller(cfg).await?;

    let meta = controller.tools().probe(&input).await?;
    let duration = meta
        .duration_secs()
        .with_context(|| format!("Input has no readable duration: {}", input.display()))?;

    let handle = controller
        .submit(JobRequest::new(account, input, duration, size))
        .map_err(|rejection| anyhow::anyhow!("{}: {}", rejection.category(), rejection))?;
    let report = handle.wait().await?;
    println!("{}", serde_json::to_string_pretty(&report_json(&report))?);

    match &report.outcome {
        Ok(artifact) => {
            if let Some(dest) = output {
                copy_out(&artifact.path, &dest)?;
            }
            Ok(())
        }
        Err(failure) => bail!("{}: {}", failure.category(), failure),
    }
}

fn copy_out(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    info!("Copied reel to {}", to.display());
    Ok(())
}

fn report_json(report: &JobReport) -> serde_json::Value {
    let mut value = serde_json::json!({
        "job_id": report.job_id,
        "account_id": report.account_id,
        "status": report.status,
        "attempts": report.attempt_count,
        "profile": report.profile_used,
        "elapsed": format_duration(report.elapsed),
    });
    if let Some(e) = &report.ledger_error {
        value["ledger_error"] = serde_json::json!(e);
    }
    match &report.outcome {
        Ok(artifact) => value["output"] = serde_json::json!(artifact),
        Err(failure) => {
            value["error"] = serde_json::json!({
                "category": failure.category(),
                "message": failure.to_string(),
            })
        }
    }
    value
}

fn grant(cfg: &ConverterConfig, account: &str, packs: u32) -> Result<()> {
    let Some(_lock) = LedgerLock::try_acquire(&cfg.ledger_path)? else {
        let path = commands::queue_command(&cfg.command_dir(), &CommandFile::grant(account, packs))?;
        println!(
            "Daemon owns the ledger; queued {} pack(s) for account {} as {}",
            packs,
            account,
            path.display()
        );
        return Ok(());
    };

    let mut ledger = QuotaLedger::load(&cfg.ledger_path)?;
    let units = packs as u64 * cfg.premium_unit_grant_size as u64;
    let updated = ledger.grant_premium(account, units)?;
    println!(
        "Account {}: premium balance {} ({} pack(s) x {} unit(s) added)",
        updated.id, updated.premium_balance, packs, cfg.premium_unit_grant_size
    );
    Ok(())
}

fn cleanup(cfg: &ConverterConfig) -> Result<()> {
    let Some(_lock) = LedgerLock::try_acquire(&cfg.ledger_path)? else {
        bail!("Daemon is running; its workspaces are cleaned on its next start");
    };
    let deleted = workspace::cleanup_temp_dir(&cfg.temp_dir)?;
    println!("Removed {} file(s) from {}", deleted, cfg.temp_dir.display());
    Ok(())
}

async fn stats(cfg: &ConverterConfig) -> Result<()> {
    let interval = cfg.sample_interval_ms;
    let snapshot = tokio::task::spawn_blocking(move || SystemMonitor::new(interval).sample()).await?;
    let ledger = QuotaLedger::load(&cfg.ledger_path)?;
    let temp_entries = workspace::count_temp_entries(&cfg.temp_dir);
    let premium: u64 = ledger.accounts().map(|a| a.premium_balance).sum();

    println!("CPU:            {:.1}%", snapshot.cpu_percent);
    println!("Memory:         {:.1}%", snapshot.mem_percent);
    println!("Worker slots:   {}", cfg.worker_pool_size);
    println!("Temp entries:   {} in {}", temp_entries, cfg.temp_dir.display());
    println!("Accounts:       {} ({} premium unit(s) outstanding)", ledger.len(), premium);
    println!(
        "Degrade above:  cpu {:.0}% / mem {:.0}%",
        cfg.cpu_degrade_threshold_percent, cfg.mem_degrade_threshold_percent
    );
    if temp_entries > 0 {
        warn!("{} leftover workspace(s); run `reelsd cleanup` while the daemon is stopped", temp_entries);
    }
    Ok(())
}

/// Helper function to format duration for logging
fn format_duration(d: chrono::Duration) -> String {
    let minutes = d.num_minutes();
    let seconds = d.num_seconds() % 60;
    let millis = d.num_milliseconds() % 1000;
    format!("{}m {}.{:03}s", minutes, seconds, millis)
}
