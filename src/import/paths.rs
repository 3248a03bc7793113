//! Archive layout.
//!
//! `{root}/locations/{STATE}-{type}/{shortName}-{loc12}/org-{kind}-{loc12}/{digest}{ext}`
//!
//! Paths stored in the database are relative to the archive root and always
//! use `/` separators.

use crate::db::MediaType;
use crate::import::types::{ImportError, LocationInfo};
use std::path::{Path, PathBuf};

pub const LOCATIONS_DIR: &str = "locations";
pub const LOC12_LEN: usize = 12;

/// Make a caller-supplied name safe as a single path component
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Reject locations that cannot produce a well-formed folder name
pub fn validate_location(location: &LocationInfo) -> Result<(), ImportError> {
    if location.location_id.trim().is_empty() {
        return Err(ImportError::InvalidLocation("location id is empty".to_string()));
    }
    if location.loc12.len() != LOC12_LEN
        || !location.loc12.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(ImportError::InvalidLocation(format!(
            "loc12 must be {} alphanumeric characters, got {:?}",
            LOC12_LEN, location.loc12
        )));
    }
    if location.state.trim().is_empty() {
        return Err(ImportError::InvalidLocation("state is empty".to_string()));
    }
    Ok(())
}

/// `locations/{STATE}-{type}/{shortName}-{loc12}`
pub fn location_folder(location: &LocationInfo) -> PathBuf {
    let state_dir = format!(
        "{}-{}",
        sanitize_component(&location.state).to_uppercase(),
        sanitize_component(&location.location_type)
    );
    let location_dir = format!(
        "{}-{}",
        sanitize_component(&location.short_name),
        location.loc12
    );
    PathBuf::from(LOCATIONS_DIR).join(state_dir).join(location_dir)
}

/// `.../org-{kind}-{loc12}`
pub fn media_folder(location: &LocationInfo, media_type: MediaType) -> PathBuf {
    location_folder(location).join(format!(
        "org-{}-{}",
        media_type.folder_kind(),
        location.loc12
    ))
}

/// Archive-relative destination for one file, `extension` includes its dot
pub fn archive_relative_path(
    location: &LocationInfo,
    media_type: MediaType,
    digest: &str,
    extension: &str,
) -> PathBuf {
    media_folder(location, media_type).join(format!("{}{}", digest, extension))
}

/// Render a relative path the way it is stored in the database
pub fn to_db_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a stored archive path against the archive root
pub fn resolve(archive_root: &Path, db_path: &str) -> PathBuf {
    db_path
        .split('/')
        .fold(archive_root.to_path_buf(), |acc, part| acc.join(part))
}

/// Whether two existing paths live on the same filesystem device
#[cfg(unix)]
pub fn same_device(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(a)?.dev() == std::fs::metadata(b)?.dev())
}

#[cfg(not(unix))]
pub fn same_device(_a: &Path, _b: &Path) -> std::io::Result<bool> {
    Ok(false)
}
