//! Recursive file discovery for an import batch.
//!
//! Walks the user's selection depth-first, drops system and hidden files,
//! applies the extension allow-list and detects companion files
//! (RAW+JPEG pairs, Live Photo still+motion).

use crate::db::{MediaType, RelationKind};
use crate::import::types::{CandidateFile, FileRelation};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "heic", "heif",
];
const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", "nef", "arw", "dng", "raf", "orf", "rw2", "pef", "srw",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "m4v", "mts", "m2ts", "3gp", "wmv", "webm", "mpg", "mpeg",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "txt", "rtf", "odt", "xls", "xlsx", "csv", "md",
];
const MAP_EXTENSIONS: &[&str] = &["kml", "kmz", "gpx", "geojson", "shp"];
/// Camera sidecar formats. Archived, but hidden by default.
const DERIVED_EXTENSIONS: &[&str] = &["thm", "lrv"];

/// Rendered stills a camera writes next to a RAW file
const RAW_PARTNER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "heic", "heif"];
const LIVE_STILL_EXTENSIONS: &[&str] = &["heic", "heif", "jpg", "jpeg"];
const LIVE_MOTION_EXTENSIONS: &[&str] = &["mov", "mp4"];

const NOISE_FILES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "Icon\r",
    "$RECYCLE.BIN",
    "System Volume Information",
    "__MACOSX",
];

/// Something the scanner refused to read
#[derive(Debug, Clone)]
pub struct ScanIssue {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub files: Vec<CandidateFile>,
    pub relations: Vec<FileRelation>,
    pub skipped: Vec<ScanIssue>,
}

/// Every extension the archive knows how to file
pub fn default_allowed_extensions() -> HashSet<String> {
    IMAGE_EXTENSIONS
        .iter()
        .chain(RAW_EXTENSIONS)
        .chain(VIDEO_EXTENSIONS)
        .chain(DOCUMENT_EXTENSIONS)
        .chain(MAP_EXTENSIONS)
        .chain(DERIVED_EXTENSIONS)
        .map(|ext| ext.to_string())
        .collect()
}

/// Classify by lower-case extension (no dot)
pub fn media_type_for_extension(ext: &str) -> MediaType {
    if IMAGE_EXTENSIONS.contains(&ext) || RAW_EXTENSIONS.contains(&ext) {
        MediaType::Image
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        MediaType::Video
    } else if DOCUMENT_EXTENSIONS.contains(&ext) {
        MediaType::Document
    } else if MAP_EXTENSIONS.contains(&ext) {
        MediaType::Map
    } else {
        MediaType::Unknown
    }
}

/// Check if a file is OS noise or hidden (.DS_Store, ._resource forks, dotfiles)
fn is_noise_file(name: &str) -> bool {
    NOISE_FILES.contains(&name) || name.starts_with('.')
}

fn lower_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Scan the user's selection. Blocking; run it on the blocking pool.
///
/// `allowed` holds lower-case extensions without the dot. Files are returned
/// in walk order; that order is kept by every later stage.
pub fn scan_paths(
    paths: &[PathBuf],
    allowed: &HashSet<String>,
    cancel: &CancellationToken,
) -> ScanOutput {
    info!("Scanning {} selected path(s)", paths.len());

    let mut walker = Walker {
        allowed,
        cancel,
        visited_dirs: HashSet::new(),
        seen_files: HashSet::new(),
        output: ScanOutput::default(),
    };

    for path in paths {
        if cancel.is_cancelled() {
            break;
        }
        walker.visit(path, true);
    }

    let mut output = walker.output;
    output.relations = detect_relations(&output.files);

    info!(
        "Scan found {} file(s), {} relation(s), skipped {}",
        output.files.len(),
        output.relations.len(),
        output.skipped.len()
    );

    output
}

struct Walker<'a> {
    allowed: &'a HashSet<String>,
    cancel: &'a CancellationToken,
    /// Canonical directories already entered; breaks symlink cycles
    visited_dirs: HashSet<PathBuf>,
    /// Canonical files already emitted; overlapping selections yield each file once
    seen_files: HashSet<PathBuf>,
    output: ScanOutput,
}

impl Walker<'_> {
    fn skip(&mut self, path: &Path, reason: String) {
        warn!("Skipping {:?}: {}", path, reason);
        self.output.skipped.push(ScanIssue {
            path: path.to_path_buf(),
            reason,
        });
    }

    /// `selected` marks a path the user picked directly; hidden directories
    /// are only skipped when reached by walking.
    fn visit(&mut self, path: &Path, selected: bool) {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        // follows symlinks
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.skip(path, format!("unreadable: {}", e));
                return;
            }
        };

        if (!selected || metadata.is_file()) && !name.is_empty() && is_noise_file(&name) {
            debug!("Ignoring hidden/system entry {:?}", path);
            return;
        }

        let canonical = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(e) => {
                self.skip(path, format!("cannot resolve: {}", e));
                return;
            }
        };

        if metadata.is_dir() {
            self.visit_dir(path, canonical);
        } else if metadata.is_file() {
            self.visit_file(path, canonical, &name, metadata.len());
        }
    }

    fn visit_dir(&mut self, dir: &Path, canonical: PathBuf) {
        if !self.visited_dirs.insert(canonical) {
            debug!("Already visited {:?}, not following again", dir);
            return;
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.skip(dir, format!("cannot list directory: {}", e));
                return;
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => children.push(entry.path()),
                Err(e) => self.skip(dir, format!("cannot read directory entry: {}", e)),
            }
        }
        children.sort();

        for child in children {
            if self.cancel.is_cancelled() {
                return;
            }
            self.visit(&child, false);
        }
    }

    fn visit_file(&mut self, path: &Path, canonical: PathBuf, name: &str, size: u64) {
        let Some(ext) = lower_extension(path) else {
            debug!("No extension, ignoring {:?}", path);
            return;
        };
        if !self.allowed.contains(&ext) {
            debug!("Extension {} not allowed, ignoring {:?}", ext, path);
            return;
        }
        if size == 0 {
            debug!("Empty file, ignoring {:?}", path);
            return;
        }
        if !self.seen_files.insert(canonical) {
            return;
        }

        self.output.files.push(CandidateFile {
            path: path.to_path_buf(),
            filename: name.to_string(),
            size,
            media_type: media_type_for_extension(&ext),
            extension: format!(".{}", ext),
        });
    }
}

/// Pair up files that share a directory and stem
fn detect_relations(files: &[CandidateFile]) -> Vec<FileRelation> {
    let mut groups: HashMap<(PathBuf, String), Vec<usize>> = HashMap::new();
    for (index, file) in files.iter().enumerate() {
        let dir = file.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = file
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        groups.entry((dir, stem)).or_default().push(index);
    }

    let ext_of = |index: usize| files[index].extension.trim_start_matches('.');
    let first_with = |members: &[usize], exts: &[&str]| {
        members.iter().copied().find(|&i| exts.contains(&ext_of(i)))
    };

    let mut relations = Vec::new();
    for members in groups.values().filter(|m| m.len() > 1) {
        if let (Some(raw), Some(still)) = (
            first_with(members, RAW_EXTENSIONS),
            first_with(members, RAW_PARTNER_EXTENSIONS),
        ) {
            relations.push(FileRelation {
                primary: raw,
                companion: still,
                kind: RelationKind::RawPair,
            });
        }

        if let (Some(still), Some(motion)) = (
            first_with(members, LIVE_STILL_EXTENSIONS),
            first_with(members, LIVE_MOTION_EXTENSIONS),
        ) {
            relations.push(FileRelation {
                primary: still,
                companion: motion,
                kind: RelationKind::LivePhoto,
            });
        }
    }

    relations.sort_by_key(|r| (r.primary, r.companion));
    relations
}
