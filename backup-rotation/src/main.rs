//! backup-rotation - Main entry point
//!
//! Runs one backup per invocation; schedule it with cron or a systemd timer.

use anyhow::Result;
use backup_rotation::config::Config;
use backup_rotation::daemon::{DestinationLock, ShutdownCoordinator};
use backup_rotation::executor::{BackupExecutor, RsyncInvoker};
use backup_rotation::notify::{subject, ConfiguredNotifier, Notifier};
use backup_rotation::rotation::{BackupCatalog, PurgeEngine, RetentionPlanner};
use backup_rotation::utils;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Also append log output to this file
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Command-line settings that win over the config file and environment.
#[derive(clap::Args, Debug)]
struct Overrides {
    /// Path to back up (rsync patterns allowed)
    #[arg(long, global = true)]
    src: Option<String>,

    /// Directory holding the backups
    #[arg(long, global = true)]
    dest: Option<PathBuf>,

    /// Comma separated rsync exclude patterns
    #[arg(long, value_delimiter = ',', global = true)]
    exclude: Vec<String>,

    /// Remote source host: server, username@server or username@server:port
    #[arg(long, global = true)]
    ssh: Option<String>,

    /// Full backup generations to keep (at least 2)
    #[arg(long, global = true)]
    max_full: Option<u32>,

    /// Incremental backups before a new full backup is started
    #[arg(long, global = true)]
    max_inc: Option<u32>,

    /// Backups allowed per day
    #[arg(long, global = true)]
    max_daily_backups: Option<u32>,

    /// Start a new full backup on the first day of each month
    #[arg(long, global = true)]
    monthly_full: bool,

    /// Low disk space warning threshold (MB)
    #[arg(long, global = true)]
    low: Option<u64>,

    /// Fail instead of creating a missing destination
    #[arg(long, global = true)]
    disable_create_dest: bool,

    /// Command run before the backup (e.g. create an LVM snapshot)
    #[arg(long, global = true)]
    pre_script: Option<String>,

    /// Command run after the backup (e.g. remove the LVM snapshot)
    #[arg(long, global = true)]
    post_script: Option<String>,

    /// Mail-style notification command (`<cmd> -s <subject> <to>...`)
    #[arg(long, global = true)]
    notify_command: Option<String>,

    /// Comma separated notification recipients
    #[arg(long, value_delimiter = ',', global = true)]
    notify_to: Vec<String>,

    /// rsync binary
    #[arg(long, value_name = "PATH", global = true)]
    rsync: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(src) = self.src {
            config.backup.source = Some(src);
        }
        if let Some(dest) = self.dest {
            config.backup.dest = Some(dest);
        }
        if !self.exclude.is_empty() {
            config.backup.exclude = self.exclude;
        }
        if let Some(ssh) = self.ssh {
            config.backup.ssh = Some(ssh);
        }
        if let Some(max_full) = self.max_full {
            config.retention.max_full = max_full;
        }
        if let Some(max_inc) = self.max_inc {
            config.retention.max_incremental = max_inc;
        }
        if let Some(max_daily) = self.max_daily_backups {
            config.retention.max_daily_backups = max_daily;
        }
        if self.monthly_full {
            config.retention.monthly_full = true;
        }
        if let Some(low) = self.low {
            config.disk.low_space_mb = low;
        }
        if self.disable_create_dest {
            config.backup.create_dest = false;
        }
        if let Some(script) = self.pre_script {
            config.hooks.pre_script = Some(script);
        }
        if let Some(script) = self.post_script {
            config.hooks.post_script = Some(script);
        }
        if let Some(command) = self.notify_command {
            config.notify.command = Some(command);
        }
        if !self.notify_to.is_empty() {
            config.notify.recipients = self.notify_to;
        }
        if let Some(rsync) = self.rsync {
            config.sync.rsync_path = rsync;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the next backup, then purge old generations (default)
    Run {
        /// Save the effective configuration here after a successful run
        #[arg(long, value_name = "FILE")]
        save_config: Option<PathBuf>,
    },
    /// Show the next backup and its link base without touching disk
    Plan {
        #[arg(long)]
        json: bool,
    },
    /// List the backups in the destination
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove generations beyond the retention limit
    Purge,
    /// Delete one generation and renumber the ones after it
    RemoveGeneration {
        /// Full backup number of the generation
        id: u32,
    },
    /// Send a test notification
    TestNotify,
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    args.overrides.apply(&mut config);
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(file) = args.log_file {
        config.log.file = Some(file);
    }

    // Initialize logging
    utils::logger::init(&config.log.level, config.log.file.as_deref())?;

    info!("Starting backup-rotation v{}", env!("CARGO_PKG_VERSION"));

    let command = args.command.unwrap_or(Command::Run { save_config: None });
    if let Err(e) = dispatch(command, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Run { save_config } => run_backup(config, save_config).await,
        Command::Plan { json } => {
            config.validate_policy()?;
            let catalog = BackupCatalog::new(config.dest()?);
            let plan = RetentionPlanner::new(config.retention)?.plan(&catalog, Utc::now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Next backup: {}", plan.name());
                match &plan.link_base {
                    Some(base) => println!("Link base:   {}", base.display()),
                    None => println!("Link base:   none (full backup)"),
                }
            }
            Ok(())
        }
        Command::List { json } => {
            let snapshot = BackupCatalog::new(config.dest()?).snapshot()?;
            if json {
                println!("{}", serde_json::to_string_pretty(snapshot.entries())?);
            } else {
                for entry in snapshot.entries() {
                    println!(
                        "{:<44} {:<4} full {:>3} incr {:>3} {:?}",
                        entry.name,
                        if entry.is_full() { "FULL" } else { "INCR" },
                        entry.address.full_id,
                        entry.address.incremental_id.unwrap_or(0),
                        entry.state
                    );
                }
            }
            Ok(())
        }
        Command::Purge => {
            config.validate_policy()?;
            let dest = config.dest()?;
            let _lock = DestinationLock::acquire(dest)?;
            let report = PurgeEngine::new(BackupCatalog::new(dest)).purge(config.retention.max_full)?;
            info!(
                generations = ?report.generations,
                removed = report.removed.len(),
                "Purge complete"
            );
            Ok(())
        }
        Command::RemoveGeneration { id } => {
            let dest = config.dest()?;
            let _lock = DestinationLock::acquire(dest)?;
            let engine = PurgeEngine::new(BackupCatalog::new(dest));
            let removed = engine.remove_generation(id)?;
            let renamed = engine.renumber_after_generation_removal(id)?;
            info!(
                generation = id,
                removed = removed.len(),
                renamed = renamed.len(),
                "Generation removed"
            );
            Ok(())
        }
        Command::TestNotify => {
            config.validate_policy()?;
            let notifier = ConfiguredNotifier::from_config(&config.notify);
            let source = config.backup.source.as_deref().unwrap_or("-");
            notifier
                .notify(
                    &subject(source, "Backup Email Test"),
                    "TESTING BACKUP EMAIL SEND\n\n\n",
                )
                .await?;
            info!("Test notification sent");
            Ok(())
        }
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_backup(config: Config, save_config: Option<PathBuf>) -> Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen();

    let executor = BackupExecutor::new(
        config.clone(),
        RsyncInvoker::new(config.sync.rsync_path.clone()),
        ConfiguredNotifier::from_config(&config.notify),
    )
    .with_cancel(shutdown.token());

    let result = executor.run().await;

    // Stop the signal listener.
    shutdown.token().cancel();
    let _ = listener.await;

    let backup = result?;
    info!(
        backup = %backup.name,
        files = backup.footprint.files,
        purged = ?backup.purged.generations,
        "Backup finished in {}",
        backup_rotation::executor::status_log::format_elapsed(backup.elapsed)
    );

    if let Some(path) = save_config {
        config.save(&path)?;
    }
    Ok(())
}
