//! mssql-archiver CLI - scheduled archival of aging SQL Server rows.

mod jobs;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use mssql_archiver::core::{ExecutionSummary, JobStatus};
use mssql_archiver::store::open_store;
use mssql_archiver::{
    ArchiveError, ArchiveExecutor, Config, ConnectionRegistry, JobRepository, JobRunner,
    MssqlArchiveExecutor, MssqlIntrospector, SchemaIntrospector, StoreBackend,
    StructureReplicator,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-archiver")]
#[command(about = "Archive aging SQL Server rows by partition switch, bcp, or bulk copy")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "archiver.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one invocation of a job (name or id)
    Run {
        job: String,

        /// Print the statements and commands each batch executed
        #[arg(long)]
        audit: bool,
    },

    /// Execute every enabled job whose next run is due
    RunDue,

    /// Run the pre-flight safety checks for a job without moving rows
    Validate { job: String },

    /// Create a job's target table from the source table's structure
    CreateTarget {
        job: String,

        /// Filegroup or partition scheme for the new table
        #[arg(long)]
        filegroup: Option<String>,
    },

    /// Show catalog metadata for a table
    Inspect {
        /// Connection name from the config
        #[arg(long)]
        connection: String,

        #[arg(long, default_value = "dbo")]
        schema: String,

        #[arg(long)]
        table: String,

        /// Also collect min/max/distinct statistics for this column
        #[arg(long)]
        column: Option<String>,
    },

    /// Manage stored job definitions
    Jobs {
        #[command(subcommand)]
        action: jobs::JobsCommand,
    },

    /// Mark runs interrupted by a crash as failed
    Recover {
        /// Only runs started at least this many minutes ago
        #[arg(long, default_value = "60")]
        older_than_minutes: i64,
    },

    /// Test every configured connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ArchiveError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| ArchiveError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler();
    let registry = Arc::new(ConnectionRegistry::new(config.connections.clone()));

    match cli.command {
        Commands::Run { job, audit } => {
            let (runner, repo) = build_runner(&config, &registry).await?;
            let job = jobs::find_job(repo.as_ref(), &job).await?;
            let summary = runner.execute(job.id(), &cancel_token).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
                if audit {
                    print!("{}", summary.audit_trail());
                }
            }
            summary_result(&summary, &cancel_token)?;
        }

        Commands::RunDue => {
            let (runner, _repo) = build_runner(&config, &registry).await?;
            let summaries = runner.run_due(chrono::Utc::now(), &cancel_token).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No jobs due");
            } else {
                for summary in &summaries {
                    print_summary(summary);
                }
            }
            if cancel_token.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
        }

        Commands::Validate { job } => {
            let repo = open_jobs(&config, &registry).await?;
            let job = jobs::find_job(repo.as_ref(), &job).await?;
            let executor = executor(&config, &registry);
            let verdict = executor.preflight(&job).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            } else {
                println!(
                    "{}: {}",
                    job.name(),
                    if verdict.can_proceed { "OK" } else { "BLOCKED" }
                );
                for issue in &verdict.blocking_issues {
                    println!("  [{}] {}", issue.code, issue.message);
                }
                for warning in &verdict.warnings {
                    println!("  warning: {}", warning);
                }
            }
            verdict.into_result()?;
        }

        Commands::CreateTarget { job, filegroup } => {
            let repo = open_jobs(&config, &registry).await?;
            let job = jobs::find_job(repo.as_ref(), &job).await?;
            let def = job.definition();

            let source = registry.pool(&def.source_connection).await?;
            let target = registry.pool(def.target_connection()).await?;
            let mut replicator = StructureReplicator::new(source, target);
            if let Some(fg) = filegroup {
                replicator = replicator.with_filegroup(fg);
            }
            let outcome = replicator
                .create_target_table(
                    &def.source_schema,
                    &def.source_table,
                    &def.target_schema,
                    &def.target_table,
                )
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            match outcome {
                mssql_archiver::drivers::mssql::ReplicationOutcome::Created {
                    script,
                    column_count,
                } => {
                    if !cli.output_json {
                        println!("Created {} ({} columns)", def.target_full_name(), column_count);
                        println!("{}", script);
                    }
                }
                mssql_archiver::drivers::mssql::ReplicationOutcome::Failed { reason } => {
                    return Err(ArchiveError::Replication(reason));
                }
            }
        }

        Commands::Inspect {
            connection,
            schema,
            table,
            column,
        } => {
            let pool = registry.pool(&connection).await?;
            let introspector = MssqlIntrospector::new(pool, config.statistics.clone());
            inspect(&introspector, &schema, &table, column.as_deref(), cli.output_json).await?;
        }

        Commands::Jobs { action } => {
            let repo = open_jobs(&config, &registry).await?;
            jobs::run(action, &config, repo.as_ref(), cli.output_json).await?;
        }

        Commands::Recover { older_than_minutes } => {
            let (runner, _repo) = build_runner(&config, &registry).await?;
            let recovered = runner
                .recover_stale(chrono::Duration::minutes(older_than_minutes))
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&recovered)?);
            } else if recovered.is_empty() {
                println!("No interrupted runs found");
            } else {
                for name in &recovered {
                    println!("Recovered {}", name);
                }
            }
        }

        Commands::HealthCheck => {
            let mut results = Vec::new();
            let mut healthy = true;
            for name in registry.names().map(str::to_string).collect::<Vec<_>>() {
                let start = Instant::now();
                let outcome = match registry.pool(&name).await {
                    Ok(pool) => pool.test_connection().await,
                    Err(e) => Err(e),
                };
                let latency_ms = start.elapsed().as_millis() as u64;
                let error = outcome.err().map(|e| e.to_string());
                healthy &= error.is_none();
                results.push(serde_json::json!({
                    "connection": name,
                    "connected": error.is_none(),
                    "latency_ms": latency_ms,
                    "error": error,
                }));
            }

            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "healthy": healthy,
                        "connections": results,
                    }))?
                );
            } else {
                println!("Health Check Results:");
                for r in &results {
                    let ok = r["connected"].as_bool().unwrap_or(false);
                    println!(
                        "  {}: {} ({}ms)",
                        r["connection"].as_str().unwrap_or("?"),
                        if ok { "OK" } else { "FAILED" },
                        r["latency_ms"]
                    );
                    if let Some(err) = r["error"].as_str() {
                        println!("    Error: {}", err);
                    }
                }
                println!("\n  Overall: {}", if healthy { "HEALTHY" } else { "UNHEALTHY" });
            }

            if !healthy {
                return Err(ArchiveError::Store("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

fn executor(config: &Config, registry: &Arc<ConnectionRegistry>) -> Arc<MssqlArchiveExecutor> {
    Arc::new(MssqlArchiveExecutor::new(
        Arc::clone(registry),
        config.statistics.clone(),
        config.bulk_file.clone(),
    ))
}

/// Open the job store. The memory backend starts empty, so it is seeded
/// from the config's job definitions.
async fn open_jobs(
    config: &Config,
    registry: &ConnectionRegistry,
) -> Result<Arc<dyn JobRepository>, ArchiveError> {
    let repo = open_store(config, registry).await?;
    info!("Using {} job store", repo.backend_type());
    if config.store.backend == StoreBackend::Memory {
        jobs::import(config, repo.as_ref(), config.jobs.clone(), false).await?;
    }
    Ok(repo)
}

async fn build_runner(
    config: &Config,
    registry: &Arc<ConnectionRegistry>,
) -> Result<(JobRunner, Arc<dyn JobRepository>), ArchiveError> {
    let repo = open_jobs(config, registry).await?;
    let runner = JobRunner::new(Arc::clone(&repo), executor(config, registry));
    Ok((runner, repo))
}

async fn inspect(
    introspector: &MssqlIntrospector,
    schema: &str,
    table: &str,
    column: Option<&str>,
    output_json: bool,
) -> Result<(), ArchiveError> {
    if !introspector.table_exists(schema, table).await? {
        return Err(ArchiveError::Schema(format!(
            "table [{}].[{}] not found",
            schema, table
        )));
    }
    let columns = introspector.get_columns(schema, table).await?;
    let partition = introspector.get_partition_info(schema, table).await?;
    let partitions = match &partition {
        Some(_) => introspector.get_partition_details(schema, table).await?,
        None => Vec::new(),
    };
    let indexes = introspector.get_indexes(schema, table).await?;
    let foreign_keys = introspector.get_referencing_foreign_keys(schema, table).await?;
    let estimated_rows = introspector.estimated_row_count(schema, table).await?;
    let statistics = match column {
        Some(col) => Some(introspector.get_column_statistics(schema, table, col).await?),
        None => None,
    };

    if output_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "schema": schema,
                "table": table,
                "estimated_rows": estimated_rows,
                "columns": columns,
                "partition": partition,
                "partitions": partitions,
                "indexes": indexes,
                "referencing_foreign_keys": foreign_keys,
                "statistics": statistics,
            }))?
        );
        return Ok(());
    }

    println!("[{}].[{}] (~{} rows)", schema, table, estimated_rows);
    println!("\nColumns:");
    for c in &columns {
        println!(
            "  {:<30} {:<16} {}{}{}",
            c.name,
            mssql_archiver::drivers::mssql::format_column_type(c),
            if c.is_nullable { "NULL" } else { "NOT NULL" },
            if c.is_identity { " IDENTITY" } else { "" },
            c.primary_key_ordinal
                .map(|o| format!(" PK#{}", o))
                .unwrap_or_default()
        );
    }

    match &partition {
        Some(p) => {
            println!(
                "\nPartitioned on {} ({}) by {} / {}, {} partitions",
                p.column_name, p.column_type, p.function_name, p.scheme_name, p.partition_count
            );
            for d in &partitions {
                println!(
                    "  #{:<4} {:<30} {:>12} rows {:>10} KB",
                    d.partition_number,
                    d.boundary_value.as_deref().unwrap_or("(open)"),
                    d.row_count,
                    d.size_kb
                );
            }
        }
        None => println!("\nNot partitioned"),
    }

    println!("\nIndexes:");
    for i in &indexes {
        println!(
            "  {} ({}{}) [{}]",
            i.name,
            if i.is_clustered { "clustered" } else { "nonclustered" },
            if i.is_unique { ", unique" } else { "" },
            i.key_columns.join(", ")
        );
    }

    if !foreign_keys.is_empty() {
        println!("\nReferenced by:");
        for fk in &foreign_keys {
            println!("  {} ({})", fk.referencing_full_name(), fk.name);
        }
    }

    if let (Some(col), Some(stats)) = (column, &statistics) {
        println!("\nStatistics for {} ({:?}):", col, stats.method);
        if stats.is_available() {
            println!("  min: {}", stats.min.as_deref().unwrap_or("NULL"));
            println!("  max: {}", stats.max.as_deref().unwrap_or("NULL"));
            if let Some(distinct) = stats.distinct_rows {
                println!("  distinct: {}", distinct);
            }
            println!(
                "  rows: {}{}",
                stats.total_rows,
                if stats.is_approximate { " (approximate)" } else { "" }
            );
        } else {
            println!("  unavailable");
        }
    }
    Ok(())
}

fn print_summary(summary: &ExecutionSummary) {
    println!("\n{}: {}", summary.job_name, summary.status);
    println!("  Rows moved: {}", summary.rows_moved);
    println!("  Batches: {}", summary.batches.len());
    println!("  Duration: {:.2}s", summary.duration.as_secs_f64());
    if let Some(reason) = &summary.skip_reason {
        println!("  Skipped: {}", reason);
    }
    if let Some(error) = &summary.error {
        println!("  Error: {}", error);
    }
    if summary.disabled {
        println!("  Job has been disabled");
    }
}

/// Map a finished invocation onto the process exit status.
fn summary_result(
    summary: &ExecutionSummary,
    cancel: &CancellationToken,
) -> Result<(), ArchiveError> {
    if summary.status != JobStatus::Failed {
        return Ok(());
    }
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    Err(ArchiveError::execution(
        &summary.job_name,
        summary.error.clone().unwrap_or_default(),
    ))
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        "trace" => "trace",
        other => return Err(format!("unknown verbosity '{}'", other)),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }
    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, label) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing the current batch...", label);
                    token.cancel();
                }
                Err(e) => warn!("Failed to install {} handler: {}", label, e),
            }
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Finishing the current batch...");
                token.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
