use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use mb_core::*;

/// Default number of connections in the pool. SQLite WAL mode supports one
/// writer plus N readers, so even a small pool keeps concurrent read queries
/// from queueing behind each other.
const DEFAULT_POOL_SIZE: usize = 4;

/// SQLite-backed metadata store for all four catalog tables: `images`,
/// `categories`, `ai_results`, and `ai_tasks`.
pub struct SqliteStore {
    /// Round-robin pool; each connection is independently protected by a
    /// Mutex so callers run synchronous rusqlite work without holding an
    /// async lock.
    pool: Vec<Mutex<Connection>>,
    next_slot: std::sync::atomic::AtomicUsize,
}

impl SqliteStore {
    pub fn open(path: &Path) -> MbResult<Self> {
        let mut pool = Vec::with_capacity(DEFAULT_POOL_SIZE);
        for _ in 0..DEFAULT_POOL_SIZE {
            pool.push(Mutex::new(Self::open_connection(path)?));
        }
        let store = Self {
            pool,
            next_slot: std::sync::atomic::AtomicUsize::new(0),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory store for tests. Uses a shared-cache URI so every pool
    /// connection sees the same database.
    pub fn open_in_memory() -> MbResult<Self> {
        let uri = format!("file:memdb{}?mode=memory&cache=shared", Uuid::new_v4());
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX
            | rusqlite::OpenFlags::SQLITE_OPEN_URI;
        let mut pool = Vec::with_capacity(DEFAULT_POOL_SIZE);
        for _ in 0..DEFAULT_POOL_SIZE {
            let conn = Connection::open_with_flags(&uri, flags)
                .map_err(|e| MbError::Storage(format!("open in-memory sqlite: {e}")))?;
            conn.execute_batch("PRAGMA foreign_keys=ON;")
                .map_err(|e| MbError::Storage(format!("pragma error: {e}")))?;
            pool.push(Mutex::new(conn));
        }
        let store = Self {
            pool,
            next_slot: std::sync::atomic::AtomicUsize::new(0),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn open_connection(path: &Path) -> MbResult<Connection> {
        let conn = Connection::open(path)
            .map_err(|e| MbError::Storage(format!("failed to open sqlite: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| MbError::Storage(format!("pragma error: {e}")))?;
        Ok(conn)
    }

    /// Execute a synchronous closure with a pooled connection. The guard
    /// drops before any `.await`, keeping enclosing futures `Send`.
    fn with_conn<F, T>(&self, f: F) -> MbResult<T>
    where
        F: FnOnce(&Connection) -> MbResult<T>,
    {
        let idx = self
            .next_slot
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.pool.len();
        let conn = self.pool[idx]
            .lock()
            .map_err(|e| MbError::Storage(e.to_string()))?;
        f(&conn)
    }

    fn run_migrations(&self) -> MbResult<()> {
        // Migrations run on slot 0 only; the registry keeps the shape used
        // as the schema grows.
        let conn = self.pool[0]
            .lock()
            .map_err(|e| MbError::Storage(e.to_string()))?;

        const MIGRATIONS: &[(i64, &str)] =
            &[(1, include_str!("../migrations/001_initial.sql"))];

        conn.execute_batch(MIGRATIONS[0].1)
            .map_err(|e| MbError::Storage(format!("migration 001 failed: {e}")))?;

        let max_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for &(version, sql) in &MIGRATIONS[1..] {
            if version <= max_version {
                continue;
            }
            conn.execute_batch(sql)
                .map_err(|e| MbError::Storage(format!("migration {version:03} failed: {e}")))?;
        }

        tracing::debug!(
            applied_up_to = MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0),
            "migrations complete"
        );
        Ok(())
    }

    fn row_to_image(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImageRecord> {
        let id_str: String = row.get(0)?;
        let tags_str: String = row.get(3)?;
        let created_at_str: String = row.get(8)?;
        Ok(ImageRecord {
            id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
            name: row.get(1)?,
            category: row.get(2)?,
            tags: serde_json::from_str(&tags_str).unwrap_or_default(),
            path: row.get(4)?,
            size: row.get::<_, i64>(5)? as u64,
            mime_type: row.get(6)?,
            image_hash: row.get(7)?,
            created_at: parse_dt(&created_at_str),
        })
    }

    fn row_to_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
        let id_str: String = row.get(0)?;
        let created_at_str: String = row.get(4)?;
        Ok(Category {
            id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
            name: row.get(1)?,
            description: row.get(2)?,
            emoji_count: row.get::<_, i64>(3)?.max(0) as u64,
            created_at: parse_dt(&created_at_str),
        })
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<AiTask> {
        let id_str: String = row.get(0)?;
        let emoji_id_str: String = row.get(1)?;
        let status_str: String = row.get(4)?;
        let created_at_str: String = row.get(8)?;
        let updated_at_str: String = row.get(9)?;
        Ok(AiTask {
            id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
            emoji_id: Uuid::parse_str(&emoji_id_str).unwrap_or_else(|_| Uuid::nil()),
            image_path: row.get(2)?,
            image_hash: row.get(3)?,
            status: status_str.parse().unwrap_or(TaskStatus::Pending),
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            next_retry_at: row.get(7)?,
            created_at: parse_dt(&created_at_str),
            updated_at: parse_dt(&updated_at_str),
        })
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const IMAGE_COLUMNS: &str =
    "id, name, category, tags, path, size, mime_type, image_hash, created_at";
const TASK_COLUMNS: &str =
    "id, emoji_id, image_path, image_hash, status, attempts, last_error, next_retry_at, created_at, updated_at";

/// Build the WHERE fragment and owned params for an image filter.
fn filter_clause(filter: &ImageFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    if let Some(ref category) = filter.category {
        clauses.push("category = ?".to_string());
        args.push(category.clone());
    }
    if let Some(ref tag) = filter.tag {
        // Tags are stored as a JSON array; matching the quoted element text
        // is an exact any-tag match.
        clauses.push("tags LIKE ?".to_string());
        args.push(format!("%\"{tag}\"%"));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_sql, args)
}

#[async_trait]
impl ImageStore for SqliteStore {
    async fn insert_image(&self, image: &ImageRecord) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO images (id, name, category, tags, path, size, mime_type, image_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    image.id.to_string(),
                    image.name,
                    image.category,
                    serde_json::to_string(&image.tags).unwrap_or_else(|_| "[]".into()),
                    image.path,
                    image.size as i64,
                    image.mime_type,
                    image.image_hash,
                    image.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| MbError::Storage(format!("insert image: {e}")))?;
            Ok(())
        })
    }

    async fn get_image(&self, id: Uuid) -> MbResult<Option<ImageRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_image,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get image: {e}")))
        })
    }

    async fn get_image_by_name(&self, name: &str) -> MbResult<Option<ImageRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE name = ?1 LIMIT 1"),
                params![name],
                Self::row_to_image,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get image by name: {e}")))
        })
    }

    async fn get_image_by_hash(&self, hash: &str) -> MbResult<Option<ImageRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE image_hash = ?1"),
                params![hash],
                Self::row_to_image,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get image by hash: {e}")))
        })
    }

    async fn update_image(&self, image: &ImageRecord) -> MbResult<()> {
        self.with_conn(|conn| {
            let affected = conn
                .execute(
                    "UPDATE images SET name = ?1, category = ?2, tags = ?3 WHERE id = ?4",
                    params![
                        image.name,
                        image.category,
                        serde_json::to_string(&image.tags).unwrap_or_else(|_| "[]".into()),
                        image.id.to_string(),
                    ],
                )
                .map_err(|e| MbError::Storage(format!("update image: {e}")))?;
            if affected == 0 {
                return Err(MbError::ImageNotFound(image.id.to_string()));
            }
            Ok(())
        })
    }

    async fn delete_image(&self, id: Uuid) -> MbResult<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute("DELETE FROM images WHERE id = ?1", params![id.to_string()])
                .map_err(|e| MbError::Storage(format!("delete image: {e}")))?;
            Ok(affected > 0)
        })
    }

    async fn list_images(
        &self,
        filter: &ImageFilter,
        limit: usize,
        offset: usize,
    ) -> MbResult<Vec<ImageRecord>> {
        let (where_sql, args) = filter_clause(filter);
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {IMAGE_COLUMNS} FROM images{where_sql} ORDER BY created_at DESC LIMIT ? OFFSET ?"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| MbError::Storage(format!("list prepare: {e}")))?;
            let mut params: Vec<&dyn rusqlite::ToSql> =
                args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
            let limit = limit as i64;
            let offset = offset as i64;
            params.push(&limit);
            params.push(&offset);
            let rows = stmt
                .query_map(&params[..], Self::row_to_image)
                .map_err(|e| MbError::Storage(format!("list query: {e}")))?;
            let mut images = Vec::new();
            for row in rows {
                images.push(row.map_err(|e| MbError::Storage(format!("list row: {e}")))?);
            }
            Ok(images)
        })
    }

    async fn search_images(&self, keyword: &str, limit: usize) -> MbResult<Vec<ImageRecord>> {
        self.with_conn(|conn| {
            let pattern = format!("%{keyword}%");
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {IMAGE_COLUMNS} FROM images WHERE name LIKE ?1 OR tags LIKE ?1
                     ORDER BY created_at DESC LIMIT ?2"
                ))
                .map_err(|e| MbError::Storage(format!("search prepare: {e}")))?;
            let rows = stmt
                .query_map(params![pattern, limit as i64], Self::row_to_image)
                .map_err(|e| MbError::Storage(format!("search query: {e}")))?;
            let mut images = Vec::new();
            for row in rows {
                images.push(row.map_err(|e| MbError::Storage(format!("search row: {e}")))?);
            }
            Ok(images)
        })
    }

    async fn random_image(&self, filter: &ImageFilter) -> MbResult<Option<ImageRecord>> {
        let (where_sql, args) = filter_clause(filter);
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {IMAGE_COLUMNS} FROM images{where_sql} ORDER BY RANDOM() LIMIT 1"
            );
            let params: Vec<&dyn rusqlite::ToSql> =
                args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
            conn.query_row(&sql, &params[..], Self::row_to_image)
                .optional()
                .map_err(|e| MbError::Storage(format!("random image: {e}")))
        })
    }

    async fn list_tags(&self) -> MbResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT tags FROM images")
                .map_err(|e| MbError::Storage(format!("tags prepare: {e}")))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| MbError::Storage(format!("tags query: {e}")))?;
            let mut seen = std::collections::BTreeSet::new();
            for row in rows {
                let tags_json = row.map_err(|e| MbError::Storage(format!("tags row: {e}")))?;
                let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
                seen.extend(tags);
            }
            Ok(seen.into_iter().collect())
        })
    }

    async fn count_images(&self, filter: &ImageFilter) -> MbResult<usize> {
        let (where_sql, args) = filter_clause(filter);
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM images{where_sql}");
            let params: Vec<&dyn rusqlite::ToSql> =
                args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
            let count: i64 = conn
                .query_row(&sql, &params[..], |row| row.get(0))
                .map_err(|e| MbError::Storage(format!("count images: {e}")))?;
            Ok(count as usize)
        })
    }
}

#[async_trait]
impl CategoryStore for SqliteStore {
    async fn insert_category(&self, category: &Category) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO categories (id, name, description, emoji_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    category.id.to_string(),
                    category.name,
                    category.description,
                    category.emoji_count as i64,
                    category.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| MbError::Storage(format!("insert category: {e}")))?;
            Ok(())
        })
    }

    async fn get_category(&self, id: Uuid) -> MbResult<Option<Category>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, description, emoji_count, created_at FROM categories WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_category,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get category: {e}")))
        })
    }

    async fn get_category_by_name(&self, name: &str) -> MbResult<Option<Category>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, description, emoji_count, created_at FROM categories WHERE name = ?1",
                params![name],
                Self::row_to_category,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get category by name: {e}")))
        })
    }

    async fn list_categories(&self) -> MbResult<Vec<Category>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, description, emoji_count, created_at FROM categories
                     ORDER BY created_at ASC",
                )
                .map_err(|e| MbError::Storage(format!("categories prepare: {e}")))?;
            let rows = stmt
                .query_map([], Self::row_to_category)
                .map_err(|e| MbError::Storage(format!("categories query: {e}")))?;
            let mut categories = Vec::new();
            for row in rows {
                categories.push(row.map_err(|e| MbError::Storage(format!("categories row: {e}")))?);
            }
            Ok(categories)
        })
    }

    async fn delete_category(&self, id: Uuid) -> MbResult<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute(
                    "DELETE FROM categories WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(|e| MbError::Storage(format!("delete category: {e}")))?;
            Ok(affected > 0)
        })
    }

    async fn bump_emoji_count(&self, name: &str, delta: i64) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE categories SET emoji_count = MAX(emoji_count + ?1, 0) WHERE name = ?2",
                params![delta, name],
            )
            .map_err(|e| MbError::Storage(format!("bump count: {e}")))?;
            Ok(())
        })
    }

    async fn recount_categories(&self) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE categories SET emoji_count =
                     (SELECT COUNT(*) FROM images WHERE images.category = categories.name)",
                [],
            )
            .map_err(|e| MbError::Storage(format!("recount categories: {e}")))?;
            Ok(())
        })
    }
}

#[async_trait]
impl ResultCacheStore for SqliteStore {
    async fn get_cached_result(&self, hash: &str) -> MbResult<Option<VisionAnalysis>> {
        let raw: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT result_json FROM ai_results WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get cached result: {e}")))
        })?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_cached_result(&self, hash: &str, result: &VisionAnalysis) -> MbResult<()> {
        let json = serde_json::to_string(result)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ai_results (hash, result_json, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(hash) DO UPDATE SET result_json = excluded.result_json",
                params![hash, json, Utc::now().to_rfc3339()],
            )
            .map_err(|e| MbError::Storage(format!("put cached result: {e}")))?;
            Ok(())
        })
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &AiTask) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO ai_tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    task.id.to_string(),
                    task.emoji_id.to_string(),
                    task.image_path,
                    task.image_hash,
                    task.status.as_str(),
                    task.attempts,
                    task.last_error,
                    task.next_retry_at,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| MbError::Storage(format!("insert task: {e}")))?;
            Ok(())
        })
    }

    async fn get_task(&self, id: Uuid) -> MbResult<Option<AiTask>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM ai_tasks WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_task,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("get task: {e}")))
        })
    }

    async fn find_active_task(&self, emoji_id: Uuid) -> MbResult<Option<AiTask>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM ai_tasks
                     WHERE emoji_id = ?1 AND status IN ('pending', 'processing') LIMIT 1"
                ),
                params![emoji_id.to_string()],
                Self::row_to_task,
            )
            .optional()
            .map_err(|e| MbError::Storage(format!("find active task: {e}")))
        })
    }

    async fn fetch_eligible(&self, now_ms: i64, limit: usize) -> MbResult<Vec<AiTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM ai_tasks
                     WHERE status = 'pending' AND next_retry_at <= ?1
                     ORDER BY created_at ASC LIMIT ?2"
                ))
                .map_err(|e| MbError::Storage(format!("eligible prepare: {e}")))?;
            let rows = stmt
                .query_map(params![now_ms, limit as i64], Self::row_to_task)
                .map_err(|e| MbError::Storage(format!("eligible query: {e}")))?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row.map_err(|e| MbError::Storage(format!("eligible row: {e}")))?);
            }
            Ok(tasks)
        })
    }

    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> MbResult<bool> {
        self.with_conn(|conn| {
            // The single conditional update the at-most-once claim rests on:
            // only a still-pending row transitions, and exactly one caller
            // observes a row change.
            let affected = conn
                .execute(
                    "UPDATE ai_tasks SET status = 'processing', updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now.to_rfc3339(), id.to_string()],
                )
                .map_err(|e| MbError::Storage(format!("claim task: {e}")))?;
            Ok(affected == 1)
        })
    }

    async fn mark_succeeded(&self, id: Uuid, now: DateTime<Utc>) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ai_tasks SET status = 'succeeded', last_error = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now.to_rfc3339(), id.to_string()],
            )
            .map_err(|e| MbError::Storage(format!("mark succeeded: {e}")))?;
            Ok(())
        })
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        next_retry_at: i64,
        now: DateTime<Utc>,
    ) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ai_tasks SET status = 'pending', attempts = ?1, last_error = ?2,
                     next_retry_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![attempts, error, next_retry_at, now.to_rfc3339(), id.to_string()],
            )
            .map_err(|e| MbError::Storage(format!("mark retry: {e}")))?;
            Ok(())
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> MbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ai_tasks SET status = 'failed', attempts = ?1, last_error = ?2,
                     next_retry_at = 0, updated_at = ?3
                 WHERE id = ?4",
                params![attempts, error, now.to_rfc3339(), id.to_string()],
            )
            .map_err(|e| MbError::Storage(format!("mark failed: {e}")))?;
            Ok(())
        })
    }

    async fn reset_processing(&self, now: DateTime<Utc>) -> MbResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ai_tasks SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
                params![now.to_rfc3339()],
            )
            .map_err(|e| MbError::Storage(format!("reset processing: {e}")))
        })
    }

    async fn reset_failed(&self, now: DateTime<Utc>) -> MbResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ai_tasks SET status = 'pending', attempts = 0, next_retry_at = 0,
                     last_error = NULL, updated_at = ?1
                 WHERE status = 'failed'",
                params![now.to_rfc3339()],
            )
            .map_err(|e| MbError::Storage(format!("reset failed: {e}")))
        })
    }

    async fn task_stats(&self) -> MbResult<TaskStats> {
        self.with_conn(|conn| {
            let mut stats = TaskStats::default();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM ai_tasks GROUP BY status")
                .map_err(|e| MbError::Storage(format!("stats prepare: {e}")))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })
                .map_err(|e| MbError::Storage(format!("stats query: {e}")))?;
            for row in rows {
                let (status, count) =
                    row.map_err(|e| MbError::Storage(format!("stats row: {e}")))?;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "processing" => stats.processing = count,
                    "succeeded" => stats.succeeded = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }

    async fn failed_emoji_ids(&self) -> MbResult<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT emoji_id FROM ai_tasks WHERE status = 'failed' ORDER BY created_at ASC")
                .map_err(|e| MbError::Storage(format!("failed ids prepare: {e}")))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| MbError::Storage(format!("failed ids query: {e}")))?;
            let mut ids = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| MbError::Storage(format!("failed ids row: {e}")))?;
                if let Ok(id) = Uuid::parse_str(&raw) {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
    }
}
