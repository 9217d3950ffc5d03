//! `jobs` subcommands: list, import, enable, disable, reset.

use std::path::PathBuf;

use clap::Subcommand;
use mssql_archiver::{ArchivalJob, ArchiveError, Config, JobDefinition, JobRepository};
use tracing::info;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum JobsCommand {
    /// List stored jobs with their status
    List,

    /// Create jobs from the config's `jobs:` list or a YAML file
    Import {
        /// YAML file holding a list of job definitions
        #[arg(long)]
        file: Option<PathBuf>,

        /// Update jobs that already exist instead of skipping them
        #[arg(long)]
        replace: bool,
    },

    /// Enable a job and clear its failure streak
    Enable { job: String },

    /// Disable a job
    Disable { job: String },

    /// Clear a job's run statistics
    Reset { job: String },
}

pub async fn run(
    command: JobsCommand,
    config: &Config,
    repo: &dyn JobRepository,
    output_json: bool,
) -> Result<(), ArchiveError> {
    match command {
        JobsCommand::List => {
            let jobs = repo.get_all().await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
        }

        JobsCommand::Import { file, replace } => {
            let definitions = match file {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)?;
                    serde_yaml::from_str::<Vec<JobDefinition>>(&content)?
                }
                None => config.jobs.clone(),
            };
            let (created, updated, skipped) = import(config, repo, definitions, replace).await?;
            if output_json {
                println!(
                    "{}",
                    serde_json::json!({
                        "created": created,
                        "updated": updated,
                        "skipped": skipped,
                    })
                );
            } else {
                println!(
                    "Imported jobs: {} created, {} updated, {} unchanged",
                    created, updated, skipped
                );
            }
        }

        JobsCommand::Enable { job } => {
            let mut job = find_job(repo, &job).await?;
            job.enable();
            repo.update(&job).await?;
            println!("Enabled {}", job.name());
        }

        JobsCommand::Disable { job } => {
            let mut job = find_job(repo, &job).await?;
            job.disable();
            repo.update(&job).await?;
            println!("Disabled {}", job.name());
        }

        JobsCommand::Reset { job } => {
            let mut job = find_job(repo, &job).await?;
            job.reset_statistics();
            repo.update(&job).await?;
            println!("Reset statistics of {}", job.name());
        }
    }
    Ok(())
}

/// Create or update jobs from definitions. Returns (created, updated, skipped).
pub async fn import(
    config: &Config,
    repo: &dyn JobRepository,
    definitions: Vec<JobDefinition>,
    replace: bool,
) -> Result<(usize, usize, usize), ArchiveError> {
    let (mut created, mut updated, mut skipped) = (0, 0, 0);

    for definition in definitions {
        for conn in [definition.source_connection.as_str(), definition.target_connection()] {
            if config.connection(conn).is_none() {
                return Err(ArchiveError::Config(format!(
                    "job '{}' references unknown connection '{}'",
                    definition.name, conn
                )));
            }
        }

        match repo.get_by_name(&definition.name).await? {
            Some(mut existing) => {
                if !replace || existing.definition() == &definition {
                    skipped += 1;
                    continue;
                }
                existing.update(definition)?;
                repo.update(&existing).await?;
                info!("Updated job {}", existing.name());
                updated += 1;
            }
            None => {
                let job = ArchivalJob::new(definition)?;
                repo.create(&job).await?;
                info!("Created job {} ({})", job.name(), job.id());
                created += 1;
            }
        }
    }
    Ok((created, updated, skipped))
}

/// Resolve a job by id, falling back to name.
pub async fn find_job(repo: &dyn JobRepository, key: &str) -> Result<ArchivalJob, ArchiveError> {
    let found = match Uuid::parse_str(key) {
        Ok(id) => repo.get_by_id(id).await?,
        Err(_) => repo.get_by_name(key).await?,
    };
    found.ok_or_else(|| ArchiveError::JobNotFound(key.to_string()))
}

fn print_jobs(jobs: &[ArchivalJob]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    println!(
        "{:<24} {:<20} {:<8} {:<12} {:<20} {:>10} {:>12} {:>5}",
        "NAME", "METHOD", "ENABLED", "STATUS", "NEXT RUN", "LAST ROWS", "TOTAL ROWS", "FAILS"
    );
    for job in jobs {
        let rt = job.runtime();
        println!(
            "{:<24} {:<20} {:<8} {:<12} {:<20} {:>10} {:>12} {:>5}",
            job.name(),
            job.definition().method.as_str(),
            if job.is_enabled() { "yes" } else { "no" },
            job.status().as_str(),
            rt.next_run_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            rt.last_rows_moved,
            rt.total_rows_moved,
            rt.consecutive_failures
        );
        if let Some(err) = &rt.last_error {
            println!("    last error: {}", err);
        }
    }
}
