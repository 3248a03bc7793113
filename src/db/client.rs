use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::models::*;

// SQLite caps bound parameters per statement at 999
const HASH_LOOKUP_CHUNK: usize = 500;

const MEDIA_COLUMNS: &str = "id, hash, media_type, extension, original_filename, original_path, \
     archive_path, size_bytes, location_id, import_id, hidden, hidden_reason, \
     imported_by_id, imported_by, created_at";

/// Fixed-width UTC timestamp; lexical order equals chronological order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and create tables
    pub async fn new(database_path: &Path) -> Result<Self, sqlx::Error> {
        info!("Connecting to {}", database_path.display());

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.create_tables().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all necessary tables
    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        // Import batches
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS imports (
                id TEXT PRIMARY KEY,
                location_id TEXT NOT NULL,
                loc12 TEXT NOT NULL,
                actor_id TEXT,
                actor_name TEXT,
                total_files INTEGER NOT NULL DEFAULT 0,
                imported INTEGER NOT NULL DEFAULT 0,
                duplicates INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Archived files, one row per distinct content digest
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id TEXT PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                media_type TEXT NOT NULL,
                extension TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                original_path TEXT NOT NULL,
                archive_path TEXT NOT NULL UNIQUE,
                size_bytes INTEGER NOT NULL CHECK (size_bytes > 0),
                location_id TEXT NOT NULL,
                import_id TEXT NOT NULL,
                hidden BOOLEAN NOT NULL DEFAULT FALSE,
                hidden_reason TEXT,
                imported_by_id TEXT,
                imported_by TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (import_id) REFERENCES imports (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_relations (
                id TEXT PRIMARY KEY,
                media_id TEXT NOT NULL,
                related_media_id TEXT NOT NULL,
                relation TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (media_id) REFERENCES media (id) ON DELETE CASCADE,
                FOREIGN KEY (related_media_id) REFERENCES media (id) ON DELETE CASCADE,
                UNIQUE(media_id, related_media_id, relation)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Background enrichment jobs. `seq` gives FIFO order within a priority.
        // Rows are never deleted on failure.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                media_hash TEXT NOT NULL,
                priority INTEGER NOT NULL,
                depends_on TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_error TEXT,
                available_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                FOREIGN KEY (depends_on) REFERENCES jobs (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_import_id ON media (import_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, priority DESC, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_depends_on ON jobs (depends_on)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_media_hash ON jobs (media_hash)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Return the subset of `hashes` already present in the archive
    pub async fn existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>, sqlx::Error> {
        let mut found = HashSet::new();

        for chunk in hashes.chunks(HASH_LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT hash FROM media WHERE hash IN (");
            let mut separated = builder.separated(", ");
            for hash in chunk {
                separated.push_bind(hash.clone());
            }
            separated.push_unseparated(")");

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in rows {
                found.insert(row.try_get::<String, _>("hash")?);
            }
        }

        Ok(found)
    }

    /// Insert an import batch summary row
    pub async fn insert_import(
        conn: &mut SqliteConnection,
        import: &DbImport,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO imports (
                id, location_id, loc12, actor_id, actor_name,
                total_files, imported, duplicates, errors, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&import.id)
        .bind(&import.location_id)
        .bind(&import.loc12)
        .bind(&import.actor_id)
        .bind(&import.actor_name)
        .bind(import.total_files)
        .bind(import.imported)
        .bind(import.duplicates)
        .bind(import.errors)
        .bind(format_timestamp(import.created_at))
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Record final batch counts once all rows are in
    pub async fn update_import_counts(
        conn: &mut SqliteConnection,
        import_id: &str,
        imported: i64,
        duplicates: i64,
        errors: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE imports SET imported = ?, duplicates = ?, errors = ? WHERE id = ?")
            .bind(imported)
            .bind(duplicates)
            .bind(errors)
            .bind(import_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Insert several media rows with one multi-row statement
    pub async fn insert_media_batch(
        conn: &mut SqliteConnection,
        rows: &[DbMedia],
    ) -> Result<(), sqlx::Error> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO media ({}) ", MEDIA_COLUMNS));
        builder.push_values(rows, |mut b, media| {
            b.push_bind(media.id.clone())
                .push_bind(media.hash.clone())
                .push_bind(media.media_type)
                .push_bind(media.extension.clone())
                .push_bind(media.original_filename.clone())
                .push_bind(media.original_path.clone())
                .push_bind(media.archive_path.clone())
                .push_bind(media.size_bytes)
                .push_bind(media.location_id.clone())
                .push_bind(media.import_id.clone())
                .push_bind(media.hidden)
                .push_bind(media.hidden_reason.clone())
                .push_bind(media.imported_by_id.clone())
                .push_bind(media.imported_by.clone())
                .push_bind(format_timestamp(media.created_at));
        });

        builder.build().execute(conn).await?;
        Ok(())
    }

    /// Insert a single media row
    pub async fn insert_media(
        conn: &mut SqliteConnection,
        media: &DbMedia,
    ) -> Result<(), sqlx::Error> {
        Self::insert_media_batch(conn, std::slice::from_ref(media)).await
    }

    pub async fn insert_relation(
        conn: &mut SqliteConnection,
        relation: &DbMediaRelation,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO media_relations (
                id, media_id, related_media_id, relation, created_at
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&relation.id)
        .bind(&relation.media_id)
        .bind(&relation.related_media_id)
        .bind(relation.relation)
        .bind(format_timestamp(relation.created_at))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Media row id for a digest, read on the caller's connection
    pub async fn media_id_for_hash(
        conn: &mut SqliteConnection,
        hash: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT id FROM media WHERE hash = ?")
            .bind(hash)
            .fetch_optional(conn)
            .await?;
        row.map(|row| row.try_get("id")).transpose()
    }

    pub async fn get_import(&self, import_id: &str) -> Result<Option<DbImport>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM imports WHERE id = ?")
            .bind(import_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<DbImport, sqlx::Error> {
            Ok(DbImport {
                id: row.try_get("id")?,
                location_id: row.try_get("location_id")?,
                loc12: row.try_get("loc12")?,
                actor_id: row.try_get("actor_id")?,
                actor_name: row.try_get("actor_name")?,
                total_files: row.try_get("total_files")?,
                imported: row.try_get("imported")?,
                duplicates: row.try_get("duplicates")?,
                errors: row.try_get("errors")?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .transpose()
    }

    pub async fn get_media_by_hash(&self, hash: &str) -> Result<Option<DbMedia>, sqlx::Error> {
        let row = sqlx::query(&format!("SELECT {} FROM media WHERE hash = ?", MEDIA_COLUMNS))
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(media_from_row).transpose()
    }

    pub async fn get_media_for_import(&self, import_id: &str) -> Result<Vec<DbMedia>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM media WHERE import_id = ? ORDER BY created_at, original_path",
            MEDIA_COLUMNS
        ))
        .bind(import_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(media_from_row).collect()
    }

    pub async fn count_media(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&self.pool)
            .await
    }

    /// Whether any media row points at this archive-relative path
    pub async fn is_archive_path_referenced(
        conn: &mut SqliteConnection,
        archive_path: &str,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media WHERE archive_path = ?")
            .bind(archive_path)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count > 0)
    }

    /// Take the database write lock on a dedicated connection. Other writers
    /// wait, up to the busy timeout, until `release_write_lock`.
    pub async fn acquire_write_lock(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }

    pub async fn release_write_lock(mut conn: PoolConnection<Sqlite>) {
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            warn!("Releasing write lock failed, discarding connection: {}", e);
            conn.close_on_drop();
        }
    }

    pub async fn get_relations_for_media(
        &self,
        media_id: &str,
    ) -> Result<Vec<DbMediaRelation>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, media_id, related_media_id, relation, created_at
            FROM media_relations
            WHERE media_id = ? OR related_media_id = ?
            "#,
        )
        .bind(media_id)
        .bind(media_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DbMediaRelation, sqlx::Error> {
                Ok(DbMediaRelation {
                    id: row.try_get("id")?,
                    media_id: row.try_get("media_id")?,
                    related_media_id: row.try_get("related_media_id")?,
                    relation: row.try_get("relation")?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }
}

fn media_from_row(row: &SqliteRow) -> Result<DbMedia, sqlx::Error> {
    Ok(DbMedia {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        media_type: row.try_get("media_type")?,
        extension: row.try_get("extension")?,
        original_filename: row.try_get("original_filename")?,
        original_path: row.try_get("original_path")?,
        archive_path: row.try_get("archive_path")?,
        size_bytes: row.try_get("size_bytes")?,
        location_id: row.try_get("location_id")?,
        import_id: row.try_get("import_id")?,
        hidden: row.try_get("hidden")?,
        hidden_reason: row.try_get("hidden_reason")?,
        imported_by_id: row.try_get("imported_by_id")?,
        imported_by: row.try_get("imported_by")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}
