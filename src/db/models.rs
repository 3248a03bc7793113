//! Database models for the archive metadata store
//!
//! - One `imports` row per batch (summary + attribution)
//! - One `media` row per accepted file, keyed by content digest
//! - `media_relations` link files that belong together (RAW+JPEG, Live Photos)
//! - `jobs` hold background enrichment work (see `crate::jobs`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

/// Broad media category, inferred from the file extension at scan time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Document,
    Map,
    Unknown,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Document => "document",
            MediaType::Map => "map",
            MediaType::Unknown => "unknown",
        }
    }

    /// Short folder token used in `org-{kind}-{loc12}` directories.
    /// Unknown files are filed with documents.
    pub fn folder_kind(&self) -> &'static str {
        match self {
            MediaType::Image => "img",
            MediaType::Video => "vid",
            MediaType::Document | MediaType::Unknown => "doc",
            MediaType::Map => "map",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How two archived files relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Camera RAW file and the JPEG/HEIC the camera rendered alongside it
    RawPair,
    /// Still image and its motion companion
    LivePhoto,
}

/// Who performed an import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Actor {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Import batch summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbImport {
    pub id: String,
    pub location_id: String,
    pub loc12: String,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
    pub total_files: i64,
    pub imported: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub created_at: DateTime<Utc>,
}

impl DbImport {
    pub fn new(location_id: &str, loc12: &str, actor: &Actor) -> Self {
        DbImport {
            id: Uuid::new_v4().to_string(),
            location_id: location_id.to_string(),
            loc12: loc12.to_string(),
            actor_id: actor.id.clone(),
            actor_name: actor.name.clone(),
            total_files: 0,
            imported: 0,
            duplicates: 0,
            errors: 0,
            created_at: Utc::now(),
        }
    }
}

/// One archived file
///
/// `hash` is unique: the archive never holds two rows for the same content.
/// `archive_path` is relative to the archive root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbMedia {
    pub id: String,
    pub hash: String,
    pub media_type: MediaType,
    pub extension: String,
    pub original_filename: String,
    pub original_path: String,
    pub archive_path: String,
    pub size_bytes: i64,
    pub location_id: String,
    pub import_id: String,
    pub hidden: bool,
    pub hidden_reason: Option<String>,
    pub imported_by_id: Option<String>,
    pub imported_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Directed link between two media rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbMediaRelation {
    pub id: String,
    pub media_id: String,
    pub related_media_id: String,
    pub relation: RelationKind,
    pub created_at: DateTime<Utc>,
}

impl DbMediaRelation {
    pub fn new(media_id: &str, related_media_id: &str, relation: RelationKind) -> Self {
        DbMediaRelation {
            id: Uuid::new_v4().to_string(),
            media_id: media_id.to_string(),
            related_media_id: related_media_id.to_string(),
            relation,
            created_at: Utc::now(),
        }
    }
}
