use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use au_archive::config::{Config, SUPPORT_DIRS};

struct Options {
    archive: Option<PathBuf>,
    force: bool,
    db_only: bool,
}

fn main() {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args[1..]) {
        Ok(options) => options,
        Err(message) => {
            error!("{}", message);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if options.db_only {
        reset_database_only(&config, options.force);
    } else {
        reset_all(&config, options.archive.as_deref(), options.force);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        archive: None,
        force: false,
        db_only: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-a" | "--archive" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| format!("{} requires a directory path", args[i]))?;
                options.archive = Some(PathBuf::from(value));
                i += 2;
            }
            "-f" | "--force" => {
                options.force = true;
                i += 1;
            }
            "--db-only" => {
                options.db_only = true;
                i += 1;
            }
            "-h" | "--help" => {
                return Err("Help requested".to_string());
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    Ok(options)
}

fn print_usage(program: &str) {
    eprintln!("Reset the AU Archive database and support files\n");
    eprintln!("Usage: {} [OPTIONS]\n", program);
    eprintln!("Options:");
    eprintln!("  -a, --archive <path>  Also clean archive support directories");
    eprintln!("                        (.thumbnails, .previews, .posters)");
    eprintln!("  -f, --force           Skip confirmation prompt");
    eprintln!("      --db-only         Only remove the database, keep config and archive files");
}

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N]: ", prompt);
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    is_yes(&line)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Database file plus its WAL companions
fn database_files(database_path: &Path) -> Vec<PathBuf> {
    let mut files = vec![database_path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = database_path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

fn remove_file(path: &Path, name: &str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            println!("  ✓ Removed {}: {}", name, path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("  - {} not found: {}", name, path.display());
            false
        }
        Err(e) => {
            println!("  ✗ Failed to remove {}: {}", name, e);
            false
        }
    }
}

fn remove_dir(path: &Path, name: &str) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            println!("  ✓ Removed {}: {}", name, path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("  - {} not found: {}", name, path.display());
            false
        }
        Err(e) => {
            println!("  ✗ Failed to remove {}: {}", name, e);
            false
        }
    }
}

fn remove_database(database_path: &Path) {
    for (path, label) in database_files(database_path)
        .iter()
        .zip(["Database", "Database -wal file", "Database -shm file"])
    {
        remove_file(path, label);
    }
}

fn reset_database_only(config: &Config, force: bool) {
    println!("\n=== AU Archive Reset (DB Only) ===\n");

    if !force {
        println!("Will remove: {}", config.database_path.display());
        if !confirm("Are you sure?") {
            println!("Aborted.");
            return;
        }
    }

    println!("\nRemoving database...");
    remove_database(&config.database_path);
    println!("\n✓ Done!\n");
}

fn reset_all(config: &Config, archive: Option<&Path>, force: bool) {
    println!("\n=== AU Archive Reset ===\n");

    let config_path = config.bootstrap_config_path();
    let data_dir = config.data_dir();
    let backups_dir = config.backups_dir();

    println!("The following will be removed:");
    println!("  - Database: {}", config.database_path.display());
    println!("  - Config: {}", config_path.display());
    println!("  - Data directory: {}", data_dir.display());
    println!("  - Backups directory: {}", backups_dir.display());
    if let Some(archive) = archive {
        for dir in SUPPORT_DIRS {
            println!("  - {}", archive.join(dir).display());
        }
    }
    println!();

    if !force && !confirm("Are you sure you want to proceed?") {
        println!("Aborted.");
        return;
    }

    println!("\nRemoving files...");
    remove_database(&config.database_path);
    remove_file(&config_path, "Config");

    // Only an empty data dir goes; anything else in it was put there by someone else
    match fs::read_dir(&data_dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                match fs::remove_dir(&data_dir) {
                    Ok(()) => println!("  ✓ Removed empty data directory: {}", data_dir.display()),
                    Err(e) => warn!("Failed to remove {:?}: {}", data_dir, e),
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot read {:?}: {}", data_dir, e),
    }

    remove_dir(&backups_dir, "Backups directory");

    if let Some(archive) = archive {
        println!("\nRemoving archive support files...");
        for dir in SUPPORT_DIRS {
            remove_dir(&archive.join(dir), dir);
        }
    }

    println!("\n✓ Reset complete!\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&["-a", "/archive", "--force"])).unwrap();
        assert_eq!(options.archive, Some(PathBuf::from("/archive")));
        assert!(options.force);
        assert!(!options.db_only);

        assert!(parse_args(&args(&["--archive"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
        assert!(parse_args(&args(&["--db-only"])).unwrap().db_only);
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
    }

    #[test]
    fn test_database_files_include_wal_companions() {
        let files = database_files(Path::new("/cfg/data/au-archive.db"));
        assert_eq!(
            files,
            vec![
                PathBuf::from("/cfg/data/au-archive.db"),
                PathBuf::from("/cfg/data/au-archive.db-wal"),
                PathBuf::from("/cfg/data/au-archive.db-shm"),
            ]
        );
    }
}
