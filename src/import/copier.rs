//! Places verified-unique files into the archive.
//!
//! Every strategy writes to a temp file in the destination directory and
//! links it into place, so a destination path is either absent or complete.
//! An existing destination is never replaced: it holds the same digest, and
//! another batch may own it.

use crate::import::paths;
use crate::import::progress::{ratio, ProgressReporter};
use crate::import::types::{CopiedFile, CopyStrategy, HashedFile, ImportPhase, LocationInfo};
use futures::stream::{self, StreamExt};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TEMP_SUFFIX: &str = ".au-tmp";

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub workers: usize,
    pub prefer_hardlink: bool,
    pub allow_clone: bool,
}

/// Strategy order for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPlan {
    /// Hardlink; on failure one plain-copy retry
    Hardlink,
    /// Copy-on-write clone; on failure a plain copy
    Clone,
    Copy,
}

/// Outcome of placing one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub strategy: CopyStrategy,
    /// False when the destination already existed and was left alone
    pub created: bool,
}

pub fn select_plan(same_device: bool, options: &CopyOptions) -> CopyPlan {
    if same_device && options.prefer_hardlink {
        CopyPlan::Hardlink
    } else if options.allow_clone {
        CopyPlan::Clone
    } else {
        CopyPlan::Copy
    }
}

/// Copy every file that needs it. Duplicates and hash failures pass through
/// untouched. Output order matches input order.
pub async fn copy_files(
    files: Vec<HashedFile>,
    archive_root: &Path,
    location: &LocationInfo,
    options: &CopyOptions,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Vec<CopiedFile> {
    let total_bytes: u64 = files.iter().filter(|f| f.needs_copy()).map(|f| f.size).sum();
    let to_copy = files.iter().filter(|f| f.needs_copy()).count();
    info!(
        "Copying {} file(s), {} bytes, with {} worker(s)",
        to_copy,
        total_bytes,
        options.workers
    );

    let mut copied = Vec::with_capacity(files.len());
    let mut bytes_done = 0u64;
    let mut results = stream::iter(files)
        .map(|file| copy_one(file, archive_root, location, options, cancel.clone()))
        .buffered(options.workers.max(1));

    while let Some(file) = results.next().await {
        bytes_done += file.bytes_copied;
        progress.report(
            ImportPhase::Copy,
            ratio(bytes_done, total_bytes),
            Some(&file.filename),
            copied.len() + 1,
        );
        copied.push(file);
    }

    copied
}

async fn copy_one(
    file: HashedFile,
    archive_root: &Path,
    location: &LocationInfo,
    options: &CopyOptions,
    cancel: CancellationToken,
) -> CopiedFile {
    if !file.needs_copy() {
        return CopiedFile::uncopied(file);
    }
    if cancel.is_cancelled() {
        let mut skipped = CopiedFile::uncopied(file);
        skipped.copy_error = Some(crate::import::types::NOT_STARTED.to_string());
        return skipped;
    }

    let Some(hash) = file.hash.clone() else {
        return CopiedFile::uncopied(file);
    };
    let relative = paths::archive_relative_path(location, file.media_type, &hash, &file.extension);
    let destination = archive_root.join(&relative);
    let source = file.path.clone();
    let plan_options = options.clone();

    let placed = tokio::task::spawn_blocking(move || {
        place_file(&source, &destination, &plan_options)
    })
    .await
    .unwrap_or_else(|e| Err(io::Error::other(format!("Copy task panicked: {}", e))));

    match placed {
        Ok(placement) => {
            let bytes = if placement.created {
                debug!("Placed {:?} via {}", file.path, placement.strategy);
                file.size
            } else {
                debug!("{:?} already present at {:?}", file.path, relative);
                0
            };
            CopiedFile {
                hashed: file,
                archive_path: Some(paths::to_db_path(&relative)),
                strategy: Some(placement.strategy),
                created: placement.created,
                copy_error: None,
                bytes_copied: bytes,
            }
        }
        Err(e) => {
            warn!("Copying {:?} failed: {}", file.path, e);
            let mut failed = CopiedFile::uncopied(file);
            failed.copy_error = Some(format!("Copy failed: {}", e));
            failed
        }
    }
}

/// Put `source` at `destination` unless something is already there.
pub fn place_file(
    source: &Path,
    destination: &Path,
    options: &CopyOptions,
) -> io::Result<Placement> {
    let parent = destination.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent directory")
    })?;
    fs::create_dir_all(parent)?;

    let same_device = paths::same_device(source, parent).unwrap_or(false);
    let (strategy, created) = match select_plan(same_device, options) {
        CopyPlan::Hardlink => match write_via_temp(source, destination, CopyStrategy::Hardlink) {
            Ok(created) => (CopyStrategy::Hardlink, created),
            Err(e) => {
                warn!("Hardlink of {:?} failed ({}), retrying as copy", source, e);
                let created = write_via_temp(source, destination, CopyStrategy::Copy)?;
                (CopyStrategy::Copy, created)
            }
        },
        CopyPlan::Clone => match write_via_temp(source, destination, CopyStrategy::Reflink) {
            Ok(created) => (CopyStrategy::Reflink, created),
            Err(e) => {
                debug!("Clone of {:?} unavailable ({}), copying bytes", source, e);
                let created = write_via_temp(source, destination, CopyStrategy::Copy)?;
                (CopyStrategy::Copy, created)
            }
        },
        CopyPlan::Copy => {
            let created = write_via_temp(source, destination, CopyStrategy::Copy)?;
            (CopyStrategy::Copy, created)
        }
    };
    Ok(Placement { strategy, created })
}

fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4(), TEMP_SUFFIX))
}

/// Returns whether this call created `destination`. The temp name is always
/// gone afterwards.
fn write_via_temp(source: &Path, destination: &Path, strategy: CopyStrategy) -> io::Result<bool> {
    let temp = temp_path_for(destination);

    let written = match strategy {
        CopyStrategy::Hardlink => fs::hard_link(source, &temp),
        CopyStrategy::Reflink => clone_file(source, &temp),
        CopyStrategy::Copy => copy_bytes(source, &temp),
    };
    if let Err(e) = written {
        remove_if_exists(&temp);
        return Err(e);
    }

    let published = publish_no_clobber(&temp, destination);
    remove_if_exists(&temp);
    let created = published?;

    if created {
        if let Some(parent) = destination.parent() {
            sync_dir(parent);
        }
    }
    Ok(created)
}

/// Give `temp` the name `destination` without replacing an existing file.
/// The caller removes `temp`.
fn publish_no_clobber(temp: &Path, destination: &Path) -> io::Result<bool> {
    match fs::hard_link(temp, destination) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => {
            // No hardlinks on this filesystem (exFAT, some network mounts)
            debug!("Linking {:?} failed ({}), renaming instead", temp, e);
            if destination.try_exists()? {
                return Ok(false);
            }
            fs::rename(temp, destination)?;
            Ok(true)
        }
    }
}

fn copy_bytes(source: &Path, temp: &Path) -> io::Result<()> {
    fs::copy(source, temp)?;
    File::open(temp)?.sync_all()
}

#[cfg(target_os = "linux")]
fn clone_file(source: &Path, temp: &Path) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // _IOW(0x94, 9, int)
    const FICLONE: libc::c_ulong = 0x4004_9409;

    let src = File::open(source)?;
    let dst = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)?;

    // SAFETY: both descriptors are open for the duration of the call
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE as _, src.as_raw_fd()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    dst.sync_all()
}

#[cfg(not(target_os = "linux"))]
fn clone_file(_source: &Path, _temp: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "copy-on-write clone not supported on this platform",
    ))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!("fsync of {:?} failed: {}", dir, e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Delete a file this batch placed in the archive
pub async fn remove_copied_file(archive_root: &Path, archive_path: &str) -> io::Result<()> {
    let path = paths::resolve(archive_root, archive_path);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!("Rolled back {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove temp files left behind by interrupted batches. Files younger than
/// `grace` may belong to a batch still running and are kept.
pub async fn sweep_stale_temp_files(archive_root: &Path, grace: Duration) -> io::Result<usize> {
    let root = archive_root.join(paths::LOCATIONS_DIR);
    tokio::task::spawn_blocking(move || {
        if !root.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        sweep_dir(&root, cutoff)
    })
    .await
    .map_err(|e| io::Error::other(format!("Sweep task panicked: {}", e)))?
}

fn sweep_dir(dir: &Path, cutoff: SystemTime) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            removed += sweep_dir(&path, cutoff)?;
            continue;
        }

        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(TEMP_SUFFIX))
            .unwrap_or(false);
        if !is_temp {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        if modified <= cutoff {
            info!("Removing stale temp file {:?}", path);
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
