/*!
dbvault CLI - Command-line interface for the dbvault backup and recovery engine.

This CLI takes, lists, verifies and restores database backups, and is meant to
be driven by operators and schedulers (cron, systemd timers) alike.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use dbvault_core::{
    create_engine_from_config, observability, verify_artifact, BackupOptions, BackupRecord,
    DatabaseConfig, GzipCompressor, RecoveryEngine, RecoveryOptions, RecoveryReport, Scheduler,
    VaultConfig, VaultError, VerificationExpectations,
};
use dbvault_core::storage::sqlite::SqliteAccess;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

type Engine = RecoveryEngine<SqliteAccess, GzipCompressor>;

#[derive(Parser)]
#[command(name = "dbvault")]
#[command(about = "Verifiable database backup and recovery")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, env = "DBVAULT_VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "DBVAULT_LOG_JSON")]
    log_json: bool,

    /// Print Prometheus metrics after the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    /// JSON configuration file; flags override its values
    #[arg(short, long, global = true, env = "DBVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Database to protect (sqlite://path or a bare file path)
    #[arg(short, long, global = true, env = "DBVAULT_DATABASE")]
    database: Option<String>,

    /// Directory holding artifacts and the catalog
    #[arg(short, long, global = true, env = "DBVAULT_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Number of most recent backups to keep
    #[arg(long, global = true, env = "DBVAULT_RETENTION")]
    retention: Option<usize>,

    /// Rows per insert statement
    #[arg(long, global = true, env = "DBVAULT_CHUNK_SIZE")]
    chunk_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a new backup
    Backup {
        /// Free-text description stored with the backup
        #[arg(default_value = "")]
        description: String,
        /// Skip table definitions
        #[arg(long)]
        no_structure: bool,
        /// Skip table rows
        #[arg(long)]
        no_data: bool,
        /// Write a plain-text artifact
        #[arg(long)]
        no_compress: bool,
        /// Skip verification of the written artifact
        #[arg(long)]
        no_verify: bool,
    },
    /// List cataloged backups, newest first
    List,
    /// Show details of a specific backup
    Show {
        /// Backup identifier
        backup_id: String,
    },
    /// Verify the integrity of a backup artifact
    Verify {
        /// Backup identifier
        backup_id: String,
    },
    /// Show which tables a backup can restore
    Coverage {
        /// Backup identifier
        backup_id: String,
    },
    /// Restore the database from a backup
    Restore {
        /// Backup identifier
        backup_id: String,
        /// Parse the artifact without executing anything
        #[arg(long)]
        dry_run: bool,
        /// Only restore these tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Do not snapshot the current state first
        #[arg(long)]
        no_safety_backup: bool,
        /// Skip artifact verification before the restore
        #[arg(long)]
        no_verify_before: bool,
        /// Skip database checks after the restore
        #[arg(long)]
        no_verify_after: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a backup and its artifact
    Delete {
        /// Backup identifier
        backup_id: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Take a backup if the schedule says one is due
    Scheduled,
    /// Verify every cataloged artifact
    Audit,
}

#[derive(Tabled)]
struct BackupInfo {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Tables")]
    tables: usize,
    #[tabled(rename = "Rows")]
    rows: u64,
    #[tabled(rename = "Description")]
    description: String,
}

#[derive(Tabled)]
struct AuditRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_json) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let print_metrics = cli.print_metrics;
    let result = run(cli).await;

    if print_metrics {
        match observability::gather_metrics() {
            Ok(text) => eprintln!("{text}"),
            Err(e) => warn!("Failed to gather metrics: {}", e),
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    if json && !verbose {
        return observability::init_observability(true).map_err(Into::into);
    }

    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// 2 for verification-only failures, 1 for everything else
fn exit_status(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<VaultError>())
        .map_or(1, |e| e.exit_code() as u8)
}

fn load_config(cli: &Cli) -> Result<VaultConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::from_file(path)?,
        None => {
            let database = cli
                .database
                .as_deref()
                .context("--database (or DBVAULT_DATABASE) is required without --config")?;
            VaultConfig::new(DatabaseConfig::from_uri(database)?, "./backups")
        }
    };

    if cli.config.is_some() {
        if let Some(database) = &cli.database {
            config.database = DatabaseConfig::from_uri(database)?;
        }
    }
    if let Some(dir) = &cli.backup_dir {
        config.backup_dir = dir.clone();
    }
    if let Some(retention) = cli.retention {
        config.retention = retention;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }

    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = load_config(&cli)?;
    let engine = Arc::new(create_engine_from_config(&config)?);

    match cli.command {
        Commands::Backup {
            description,
            no_structure,
            no_data,
            no_compress,
            no_verify,
        } => {
            let mut options = BackupOptions::default().with_description(description);
            options.include_structure = !no_structure;
            options.include_data = !no_data;
            options.compress = !no_compress;
            options.verify = !no_verify;
            run_backup(&engine, &config, options).await
        }
        Commands::List => list_backups(&engine),
        Commands::Show { backup_id } => show_backup(&engine, &backup_id),
        Commands::Verify { backup_id } => verify_backup(&engine, &backup_id),
        Commands::Coverage { backup_id } => show_coverage(&engine, &backup_id),
        Commands::Restore {
            backup_id,
            dry_run,
            tables,
            no_safety_backup,
            no_verify_before,
            no_verify_after,
            json,
        } => {
            let options = RecoveryOptions {
                tables: None,
                verify_before: !no_verify_before,
                verify_after: !no_verify_after,
                create_backup: !no_safety_backup,
                dry_run,
            };
            run_restore(&engine, &config, backup_id, tables, options, json).await
        }
        Commands::Delete { backup_id, force } => delete_backup(&engine, &backup_id, force),
        Commands::Scheduled => run_scheduled(&engine, &config).await,
        Commands::Audit => audit_backups(&engine),
    }
}

/// Run blocking engine work on the blocking pool, bounded by `limit`
async fn with_timeout<T, F>(what: &str, limit: Duration, work: F) -> Result<T, anyhow::Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, VaultError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(limit, task).await {
        Ok(joined) => Ok(joined.with_context(|| format!("{what} task panicked"))??),
        // the blocking task cannot be cancelled and the runtime waits for it on exit
        Err(_) => Err(anyhow::anyhow!(
            "{what} did not finish within {limit:?} and is still running; its changes may \
             still be committed before the process exits (use `dbvault list` to find the \
             safety snapshot of an interrupted restore)"
        )),
    }
}

fn backup_task(
    engine: &Arc<Engine>,
    options: BackupOptions,
) -> impl FnOnce() -> Result<BackupRecord, VaultError> + Send + 'static {
    let engine = engine.clone();
    move || engine.backup_engine().create_backup(&options)
}

fn report_backup(record: &BackupRecord) {
    println!("✓ Backup {} created", record.id);
    println!("  Artifact: {}", record.artifact_path.display());
    println!("  Size: {}", format_size(record.size_bytes));
    println!(
        "  Tables: {}  Rows: {}  Chunks: {}",
        record.table_count, record.row_count, record.chunk_count
    );
    println!("  Checksum: {}", record.checksum);
}

async fn run_backup(
    engine: &Arc<Engine>,
    config: &VaultConfig,
    options: BackupOptions,
) -> Result<(), anyhow::Error> {
    info!("Creating backup in {}", config.backup_dir.display());
    let record = with_timeout(
        "backup",
        config.backup_timeout(),
        backup_task(engine, options),
    )
    .await?;
    report_backup(&record);
    Ok(())
}

fn list_backups(engine: &Engine) -> Result<(), anyhow::Error> {
    let records = engine.backup_engine().list_backups()?;
    if records.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let rows: Vec<BackupInfo> = records
        .iter()
        .map(|record| BackupInfo {
            id: record.id.clone(),
            created: format_timestamp(record.created_at.timestamp()),
            size: format_size(record.size_bytes),
            tables: record.table_count,
            rows: record.row_count,
            description: record.options.description.clone(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn show_backup(engine: &Engine, backup_id: &str) -> Result<(), anyhow::Error> {
    let record = engine.backup_engine().get_backup(backup_id)?;

    println!("Backup Details:");
    println!("  ID: {}", record.id);
    println!("  Created: {}", format_timestamp(record.created_at.timestamp()));
    println!("  Duration: {} ms", record.duration_ms);
    println!("  Artifact: {}", record.artifact_path.display());
    println!("  Present: {}", record.artifact_exists());
    println!("  Size: {}", format_size(record.size_bytes));
    println!("  Tables: {}", record.table_count);
    println!("  Rows: {}", record.row_count);
    println!("  Chunks: {}", record.chunk_count);
    println!("  Compression: {}", record.compression_algorithm);
    println!("  Format Version: {}", record.format_version);
    println!("  Checksum: {}", record.checksum);
    println!(
        "  Sections: structure={} data={}",
        record.options.include_structure, record.options.include_data
    );
    if !record.options.description.is_empty() {
        println!("  Description: {}", record.options.description);
    }
    Ok(())
}

fn verify_backup(engine: &Engine, backup_id: &str) -> Result<(), anyhow::Error> {
    info!("Verifying backup: {}", backup_id);
    let record = engine.backup_engine().get_backup(backup_id)?;
    let report = verify_artifact(
        &record.artifact_path,
        &VerificationExpectations::for_record(&record),
    )?;

    if report.passed {
        println!("✓ Backup is valid and integrity check passed");
        println!("  Structure definitions: {}", report.structure_count);
        println!("  Checksum: {}", report.checksum);
        return Ok(());
    }

    let reason = report.reason().unwrap_or_default();
    error!("✗ Verification failed: {}", reason);
    report.into_result()?;
    Ok(())
}

fn show_coverage(engine: &Engine, backup_id: &str) -> Result<(), anyhow::Error> {
    let coverage = engine.analyze_coverage(backup_id)?;
    println!("Coverage for {}:", coverage.backup_id);
    println!("  Data section: {}", coverage.has_data);
    if !coverage.complete {
        println!("  (scan limit reached; list may be incomplete)");
    }
    for table in &coverage.tables {
        println!("  - {table}");
    }
    Ok(())
}

async fn run_restore(
    engine: &Arc<Engine>,
    config: &VaultConfig,
    backup_id: String,
    tables: Vec<String>,
    options: RecoveryOptions,
    json: bool,
) -> Result<(), anyhow::Error> {
    let task_engine = engine.clone();
    let report = with_timeout("restore", config.restore_timeout(), move || {
        if tables.is_empty() {
            task_engine.restore(&backup_id, &options)
        } else {
            task_engine.restore_specific_tables(&backup_id, &tables, &options)
        }
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_restore_report(&report);
    }
    Ok(())
}

fn print_restore_report(report: &RecoveryReport) {
    if report.dry_run {
        println!("✓ Dry run of {} parsed cleanly", report.backup_id);
    } else {
        println!("✓ Restored backup {}", report.backup_id);
    }
    println!("  Statements: {}", report.statements_executed);
    println!("  Skipped: {}", report.statements_skipped);
    println!("  Tables: {}", report.tables_restored.join(", "));
    println!("  Duration: {} ms", report.duration.as_millis());
    if let Some(safety) = &report.safety_backup_id {
        println!("  Safety snapshot: {safety}");
    }
}

fn delete_backup(engine: &Engine, backup_id: &str, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        print!("Are you sure you want to delete backup '{backup_id}'? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Deletion cancelled");
            return Ok(());
        }
    }

    engine.backup_engine().delete_backup(backup_id)?;
    println!("✓ Backup deleted successfully");
    Ok(())
}

async fn run_scheduled(engine: &Arc<Engine>, config: &VaultConfig) -> Result<(), anyhow::Error> {
    let mut scheduler = Scheduler::new(config.schedule_state_path(), config.schedule_interval())?;
    let now = chrono::Utc::now();
    if !scheduler.is_due(now) {
        let next = scheduler
            .state()
            .next_run
            .map(|next| format_timestamp(next.timestamp()))
            .unwrap_or_default();
        println!("No backup due; next run at {next}");
        return Ok(());
    }

    let options = BackupOptions::default().with_description("Scheduled backup");
    let record = with_timeout(
        "scheduled backup",
        config.backup_timeout(),
        backup_task(engine, options),
    )
    .await?;
    scheduler.record_run(now)?;
    report_backup(&record);
    Ok(())
}

fn audit_backups(engine: &Engine) -> Result<(), anyhow::Error> {
    let entries = engine.backup_engine().audit()?;
    if entries.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let failed = entries.iter().filter(|entry| !entry.passed()).count();
    let rows: Vec<AuditRow> = entries
        .into_iter()
        .map(|entry| {
            let (status, detail) = match &entry.outcome {
                Ok(report) if report.passed => ("ok", String::new()),
                Ok(report) => ("FAILED", report.reason().unwrap_or_default()),
                Err(e) => ("ERROR", e.to_string()),
            };
            AuditRow {
                id: entry.id,
                status: status.to_string(),
                detail,
            }
        })
        .collect();
    println!("{}", Table::new(rows));

    if failed > 0 {
        anyhow::bail!("{failed} backup(s) failed the audit");
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}
