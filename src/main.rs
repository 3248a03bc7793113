use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use au_archive::config::Config;
use au_archive::db::{Actor, Database};
use au_archive::import::{ImportRequest, ImportService, LocationInfo, RunningImport};
use au_archive::jobs::{JobId, JobQueue, JobStatus};

const FAILED_JOBS_SHOWN: i64 = 20;

#[tokio::main]
async fn main() {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }
    if matches!(args[1].as_str(), "-h" | "--help" | "help") {
        print_usage(&args[0]);
        return;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let result = match args[1].as_str() {
        "import" => run_import(&config, &args[2..]).await,
        "jobs" => show_jobs(&config).await,
        "retry" => match args.get(2) {
            Some(id) => retry_job(&config, id).await,
            None => Err("retry requires a job id".to_string()),
        },
        "recover" => recover_jobs(&config).await,
        other => Err(format!("Unknown command: {}", other)),
    };

    if let Err(message) = result {
        error!("{}", message);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage:");
    eprintln!(
        "  {} import --location-id <id> --loc12 <12 chars> --state <ST> --type <type> \\",
        program
    );
    eprintln!("         --name <short name> [--archive <root>] [--actor-id <id>] [--actor-name <name>]");
    eprintln!("         [--ext <ext,ext,...>] <paths...>");
    eprintln!("  {} jobs             Show job counts and recent failures", program);
    eprintln!("  {} retry <job-id>   Re-run a failed job and its dependents", program);
    eprintln!("  {} recover          Requeue jobs left running by a crashed worker", program);
    eprintln!("\nThe archive root defaults to AU_ARCHIVE_ROOT.");
}

async fn open_database(config: &Config) -> Result<Database, String> {
    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    Database::new(&config.database_path)
        .await
        .map_err(|e| format!("Failed to open database: {}", e))
}

fn parse_import_args(config: &Config, args: &[String]) -> Result<ImportRequest, String> {
    let mut archive_root: Option<PathBuf> = None;
    let mut location_id = None;
    let mut loc12 = None;
    let mut state = None;
    let mut location_type = None;
    let mut short_name = None;
    let mut actor = Actor::default();
    let mut allowed_extensions: Option<HashSet<String>> = None;
    let mut paths = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        if !flag.starts_with("--") {
            paths.push(PathBuf::from(flag));
            i += 1;
            continue;
        }

        let value = args
            .get(i + 1)
            .cloned()
            .ok_or_else(|| format!("{} requires a value", flag))?;
        match flag {
            "--archive" => archive_root = Some(PathBuf::from(value)),
            "--location-id" => location_id = Some(value),
            "--loc12" => loc12 = Some(value),
            "--state" => state = Some(value),
            "--type" => location_type = Some(value),
            "--name" => short_name = Some(value),
            "--actor-id" => actor.id = Some(value),
            "--actor-name" => actor.name = Some(value),
            "--ext" => {
                allowed_extensions = Some(
                    value
                        .split(',')
                        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                        .filter(|ext| !ext.is_empty())
                        .collect(),
                )
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
        i += 2;
    }

    let required =
        |value: Option<String>, flag: &str| value.ok_or_else(|| format!("{} is required", flag));

    if paths.is_empty() {
        return Err("No paths to import".to_string());
    }

    Ok(ImportRequest {
        paths,
        location: LocationInfo {
            location_id: required(location_id, "--location-id")?,
            loc12: required(loc12, "--loc12")?,
            state: required(state, "--state")?,
            location_type: required(location_type, "--type")?,
            short_name: required(short_name, "--name")?,
        },
        actor,
        archive_root: match archive_root {
            Some(root) => root,
            None => config
                .require_archive_root()
                .map_err(|e| format!("{} (or pass --archive)", e))?
                .clone(),
        },
        allowed_extensions,
    })
}

async fn run_import(config: &Config, args: &[String]) -> Result<(), String> {
    let request = parse_import_args(config, args)?;
    let database = open_database(config).await?;
    let queue = JobQueue::new(database.clone(), config.worker.clone());
    let service = ImportService::new(database, queue, config.import.clone());

    let RunningImport {
        mut progress,
        cancel,
        handle,
    } = service.start(request);

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            update = progress.next() => match update {
                Some(update) => info!(
                    "[{:>3}%] {} {}/{} {}",
                    update.percent,
                    update.phase,
                    update.files_processed,
                    update.total_files,
                    update.current_file.unwrap_or_default()
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                warn!("Cancelling import, waiting for in-flight files...");
                cancel.cancel();
                cancel_requested = true;
            }
        }
    }

    let result = handle
        .await
        .map_err(|e| format!("Import task failed: {}", e))?
        .map_err(|e| format!("Import failed: {}", e))?;

    println!("\nOutcome:     {:?}", result.outcome);
    if let Some(import_id) = &result.import_id {
        println!("Import id:   {}", import_id);
    }
    println!("Files:       {}", result.total_files);
    println!("Imported:    {}", result.total_imported);
    println!("Duplicates:  {}", result.total_duplicates);
    println!("Errors:      {}", result.total_errors);
    println!("Bytes:       {}", result.total_bytes_copied);
    println!("Jobs queued: {}", result.jobs_enqueued);
    for message in &result.error_messages {
        println!("  ✗ {}", message);
    }

    Ok(())
}

async fn show_jobs(config: &Config) -> Result<(), String> {
    let database = open_database(config).await?;
    let queue = JobQueue::new(database, config.worker.clone());

    let counts = queue.counts().await.map_err(|e| e.to_string())?;
    println!("pending: {}", counts.pending);
    println!("running: {}", counts.running);
    println!("done:    {}", counts.done);
    println!("failed:  {}", counts.failed);

    let failed = queue
        .list_by_status(JobStatus::Failed, FAILED_JOBS_SHOWN)
        .await
        .map_err(|e| e.to_string())?;
    if !failed.is_empty() {
        println!("\nRecent failures:");
        for job in failed {
            println!(
                "  {} {} ({}/{} attempts): {}",
                job.id,
                job.kind(),
                job.attempts,
                job.max_attempts,
                job.last_error.unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn retry_job(config: &Config, id: &str) -> Result<(), String> {
    let database = open_database(config).await?;
    let queue = JobQueue::new(database, config.worker.clone());

    let reset = queue
        .retry(&JobId::from(id))
        .await
        .map_err(|e| e.to_string())?;
    println!("Requeued {} job(s)", reset.len());
    Ok(())
}

async fn recover_jobs(config: &Config) -> Result<(), String> {
    let database = open_database(config).await?;
    let queue = JobQueue::new(database, config.worker.clone());

    let requeued = queue
        .requeue_stale_running()
        .await
        .map_err(|e| e.to_string())?;
    println!("Requeued {} stale job(s)", requeued);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use au_archive::config::{ImportConfig, WorkerConfig};

    fn config() -> Config {
        Config {
            config_dir: PathBuf::from("/cfg"),
            database_path: PathBuf::from("/cfg/data/au-archive.db"),
            archive_root: Some(PathBuf::from("/archive")),
            import: ImportConfig::default(),
            worker: WorkerConfig::default(),
        }
    }

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_import_args() {
        let request = parse_import_args(
            &config(),
            &args(&[
                "--location-id", "loc-1", "--loc12", "abcd12345678", "--state", "NY",
                "--type", "factory", "--name", "Mill", "--ext", ".JPG, mov",
                "/photos/a", "/photos/b",
            ]),
        )
        .unwrap();

        assert_eq!(request.paths.len(), 2);
        assert_eq!(request.archive_root, PathBuf::from("/archive"));
        assert_eq!(request.location.loc12, "abcd12345678");
        let allowed = request.allowed_extensions.unwrap();
        assert!(allowed.contains("jpg") && allowed.contains("mov"));
    }

    #[test]
    fn test_parse_import_args_needs_archive_root() {
        let mut config = config();
        config.archive_root = None;
        let location = [
            "--location-id", "loc-1", "--loc12", "abcd12345678", "--state", "NY",
            "--type", "factory", "--name", "Mill",
        ];

        let err = parse_import_args(&config, &args(&[&location[..], &["/photos"][..]].concat()))
            .unwrap_err();
        assert!(err.contains("AU_ARCHIVE_ROOT"));

        let request = parse_import_args(
            &config,
            &args(&[&location[..], &["--archive", "/elsewhere", "/photos"][..]].concat()),
        )
        .unwrap();
        assert_eq!(request.archive_root, PathBuf::from("/elsewhere"));
    }

    #[test]
    fn test_parse_import_args_requires_location() {
        let err = parse_import_args(&config(), &args(&["/photos"])).unwrap_err();
        assert!(err.contains("--location-id"));
    }
}
