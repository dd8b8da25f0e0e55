//! SQLite backend implementation.

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::schema::SCHEMA;
use super::{PersistedThumbnail, PhotoRecord, StoreResult, ThumbnailStore};
use crate::error::StoreError;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // WAL lets readers proceed while a worker writes, including from the
        // maintenance CLI in another process.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ThumbnailStore for SqliteDb {
    // ========================================================================
    // Photo operations
    // ========================================================================

    fn get_photo(&self, path: &str) -> StoreResult<Option<PhotoRecord>> {
        let conn = self.conn()?;
        let photo = conn
            .query_row(
                r#"
                SELECT path, filename, directory, size_bytes, modified_at,
                       width, height, format, orientation, taken_at
                FROM photos
                WHERE path = ?
                "#,
                [path],
                |row| {
                    Ok(PhotoRecord {
                        path: row.get(0)?,
                        filename: row.get(1)?,
                        directory: row.get(2)?,
                        size_bytes: row.get(3)?,
                        modified_at: row.get(4)?,
                        width: row.get(5)?,
                        height: row.get(6)?,
                        format: row.get(7)?,
                        orientation: row.get(8)?,
                        taken_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(photo)
    }

    fn upsert_photo(&self, photo: &PhotoRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO photos (path, filename, directory, size_bytes, modified_at,
                                width, height, format, orientation, taken_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(path) DO UPDATE SET
                filename = excluded.filename,
                directory = excluded.directory,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                width = excluded.width,
                height = excluded.height,
                format = excluded.format,
                orientation = excluded.orientation,
                taken_at = excluded.taken_at,
                scanned_at = CURRENT_TIMESTAMP
            "#,
            rusqlite::params![
                photo.path,
                photo.filename,
                photo.directory,
                photo.size_bytes,
                photo.modified_at,
                photo.width,
                photo.height,
                photo.format,
                photo.orientation,
                photo.taken_at,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Thumbnail blob operations
    // ========================================================================

    fn get_thumbnail_blob(&self, key_digest: &str) -> StoreResult<Option<PersistedThumbnail>> {
        let conn = self.conn()?;
        let thumbnail = conn
            .query_row(
                r#"
                SELECT key_digest, source_path, height, data, source_fingerprint
                FROM thumbnails
                WHERE key_digest = ?
                "#,
                [key_digest],
                |row| {
                    Ok(PersistedThumbnail {
                        key_digest: row.get(0)?,
                        source_path: row.get(1)?,
                        height: row.get(2)?,
                        data: row.get(3)?,
                        source_fingerprint: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(thumbnail)
    }

    fn put_thumbnail_blob(&self, thumbnail: &PersistedThumbnail) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO thumbnails
                (key_digest, source_path, height, data, source_fingerprint, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
            "#,
            rusqlite::params![
                thumbnail.key_digest,
                thumbnail.source_path,
                thumbnail.height,
                thumbnail.data,
                thumbnail.source_fingerprint,
            ],
        )?;
        Ok(())
    }

    fn delete_thumbnail_blob(&self, key_digest: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM thumbnails WHERE key_digest = ?", [key_digest])?;
        Ok(())
    }

    fn thumbnail_digests_for_path(&self, source_path: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key_digest FROM thumbnails WHERE source_path = ?")?;
        let digests = stmt
            .query_map([source_path], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(digests)
    }

    fn clear_thumbnails(&self, path_prefix: Option<&str>) -> StoreResult<usize> {
        let conn = self.conn()?;
        let removed = match path_prefix {
            // substr comparison instead of LIKE so '%' and '_' in paths match literally
            Some(prefix) => conn.execute(
                "DELETE FROM thumbnails WHERE substr(source_path, 1, length(?1)) = ?1",
                [prefix],
            )?,
            None => conn.execute("DELETE FROM thumbnails", [])?,
        };
        Ok(removed)
    }

    fn count_thumbnails(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM thumbnails", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn thumbnail_counts_by_height(&self) -> StoreResult<Vec<(u32, usize)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT height, COUNT(*) FROM thumbnails GROUP BY height ORDER BY height")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}
