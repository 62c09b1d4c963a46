//! Persistent cold tier
//!
//! Payloads are opaque files under `<dir>/payloads/`; a SQLite index at
//! `<dir>/index.db` maps `(track_id, chunk_index, preset_id, intensity)` to
//! the payload file plus its size and store time.
//!
//! Writes are replace-on-write: the payload goes to a unique temporary file
//! which is renamed over the final name, and only then is the index row
//! upserted. An index row whose payload file is missing (or truncated) is a
//! stale index entry: it is deleted and reported as a miss.

use crate::error::Result;
use bytes::Bytes;
use chunkflow_common::{CacheKey, TrackId};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A payload read back from durable storage
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub payload: Bytes,
    pub size_bytes: usize,
    /// Unix time in milliseconds when the payload was written
    pub stored_at_ms: i64,
}

/// Durable payload storage for the cold tier
pub struct ColdStore {
    db: Pool<Sqlite>,
    payload_dir: PathBuf,
}

impl ColdStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open(dir: &Path) -> Result<Self> {
        let payload_dir = dir.join("payloads");
        tokio::fs::create_dir_all(&payload_dir).await?;

        let db_path = dir.join("index.db");
        let newly_created = !db_path.exists();

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await?;

        // WAL lets readers proceed while a worker completion writes
        sqlx::query("PRAGMA journal_mode = WAL").execute(&db).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&db).await?;

        create_index_table(&db).await?;

        if newly_created {
            info!("Initialized new cold store: {}", dir.display());
        } else {
            info!("Opened existing cold store: {}", dir.display());
        }

        Ok(Self { db, payload_dir })
    }

    /// Write a payload, atomically replacing any previous one for `key`
    pub async fn store(&self, key: &CacheKey, payload: &Bytes) -> Result<()> {
        let file_name = payload_file_name(key);
        let final_path = self.payload_dir.join(&file_name);
        let tmp_path = self
            .payload_dir
            .join(format!("{}.{}.tmp", file_name, Uuid::new_v4()));

        tokio::fs::write(&tmp_path, payload).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cold_chunks
                (track_id, chunk_index, preset_id, intensity, file_name, size_bytes, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.track_id.to_string())
        .bind(key.chunk_index as i64)
        .bind(key.preset_id.as_str())
        .bind(key.intensity.percent() as i64)
        .bind(&file_name)
        .bind(payload.len() as i64)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;

        debug!("Cold store wrote {} ({} bytes)", key, payload.len());
        Ok(())
    }

    /// Read a payload back; a stale index row degrades to `None`
    pub async fn load(&self, key: &CacheKey) -> Result<Option<StoredChunk>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT file_name, size_bytes, stored_at FROM cold_chunks
            WHERE track_id = ? AND chunk_index = ? AND preset_id = ? AND intensity = ?
            "#,
        )
        .bind(key.track_id.to_string())
        .bind(key.chunk_index as i64)
        .bind(key.preset_id.as_str())
        .bind(key.intensity.percent() as i64)
        .fetch_optional(&self.db)
        .await?;

        let Some((file_name, size_bytes, stored_at_ms)) = row else {
            return Ok(None);
        };

        let payload = match tokio::fs::read(self.payload_dir.join(&file_name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Cold store index lists {} but payload file is missing; dropping entry", key);
                self.delete_row(key).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if payload.len() as i64 != size_bytes {
            warn!(
                "Cold store payload for {} is {} bytes, index says {}; dropping entry",
                key,
                payload.len(),
                size_bytes
            );
            self.remove(key).await?;
            return Ok(None);
        }

        Ok(Some(StoredChunk {
            payload: Bytes::from(payload),
            size_bytes: size_bytes as usize,
            stored_at_ms,
        }))
    }

    /// True if the index lists `key` (payload presence is checked on load)
    pub async fn contains(&self, key: &CacheKey) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM cold_chunks
            WHERE track_id = ? AND chunk_index = ? AND preset_id = ? AND intensity = ?
            "#,
        )
        .bind(key.track_id.to_string())
        .bind(key.chunk_index as i64)
        .bind(key.preset_id.as_str())
        .bind(key.intensity.percent() as i64)
        .fetch_one(&self.db)
        .await?;
        Ok(count > 0)
    }

    /// Remove one payload and its index row
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        remove_payload_file(&self.payload_dir.join(payload_file_name(key))).await?;
        self.delete_row(key).await
    }

    /// Remove every payload stored for a track; returns rows removed
    pub async fn remove_track(&self, track_id: TrackId) -> Result<usize> {
        let files: Vec<String> =
            sqlx::query_scalar("SELECT file_name FROM cold_chunks WHERE track_id = ?")
                .bind(track_id.to_string())
                .fetch_all(&self.db)
                .await?;

        for file_name in &files {
            remove_payload_file(&self.payload_dir.join(file_name)).await?;
        }

        let result = sqlx::query("DELETE FROM cold_chunks WHERE track_id = ?")
            .bind(track_id.to_string())
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() as usize)
    }

    /// Number of indexed payloads
    pub async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cold_chunks")
            .fetch_one(&self.db)
            .await?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Directory holding payload files
    pub fn payload_dir(&self) -> &Path {
        &self.payload_dir
    }

    /// Path of the payload file for `key` (whether or not it exists)
    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.payload_dir.join(payload_file_name(key))
    }

    async fn delete_row(&self, key: &CacheKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM cold_chunks
            WHERE track_id = ? AND chunk_index = ? AND preset_id = ? AND intensity = ?
            "#,
        )
        .bind(key.track_id.to_string())
        .bind(key.chunk_index as i64)
        .bind(key.preset_id.as_str())
        .bind(key.intensity.percent() as i64)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn create_index_table(db: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cold_chunks (
            track_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            preset_id TEXT NOT NULL,
            intensity INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            stored_at INTEGER NOT NULL,
            PRIMARY KEY (track_id, chunk_index, preset_id, intensity)
        )
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cold_chunks_track ON cold_chunks(track_id)")
        .execute(db)
        .await?;

    Ok(())
}

/// Stable file name derived from the full cache key
fn payload_file_name(key: &CacheKey) -> String {
    format!("{:x}.bin", Sha256::digest(key.to_string().as_bytes()))
}

async fn remove_payload_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
