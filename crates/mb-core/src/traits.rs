use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MbResult;
use crate::model::*;

/// Storage backend for image metadata rows.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn insert_image(&self, image: &ImageRecord) -> MbResult<()>;
    async fn get_image(&self, id: Uuid) -> MbResult<Option<ImageRecord>>;
    async fn get_image_by_name(&self, name: &str) -> MbResult<Option<ImageRecord>>;
    async fn get_image_by_hash(&self, hash: &str) -> MbResult<Option<ImageRecord>>;
    async fn update_image(&self, image: &ImageRecord) -> MbResult<()>;
    async fn delete_image(&self, id: Uuid) -> MbResult<bool>;
    async fn list_images(
        &self,
        filter: &ImageFilter,
        limit: usize,
        offset: usize,
    ) -> MbResult<Vec<ImageRecord>>;
    /// Substring search over name and tags.
    async fn search_images(&self, keyword: &str, limit: usize) -> MbResult<Vec<ImageRecord>>;
    async fn random_image(&self, filter: &ImageFilter) -> MbResult<Option<ImageRecord>>;
    async fn list_tags(&self) -> MbResult<Vec<String>>;
    async fn count_images(&self, filter: &ImageFilter) -> MbResult<usize>;
}

/// Storage backend for categories and their derived image counts.
#[async_trait]
pub trait CategoryStore: Send + Sync {
    async fn insert_category(&self, category: &Category) -> MbResult<()>;
    async fn get_category(&self, id: Uuid) -> MbResult<Option<Category>>;
    async fn get_category_by_name(&self, name: &str) -> MbResult<Option<Category>>;
    async fn list_categories(&self) -> MbResult<Vec<Category>>;
    async fn delete_category(&self, id: Uuid) -> MbResult<bool>;
    async fn bump_emoji_count(&self, name: &str, delta: i64) -> MbResult<()>;
    /// Recompute every category's count from the live image rows.
    async fn recount_categories(&self) -> MbResult<()>;
}

/// Content-hash → cached analysis. Rows are write-once per hash.
#[async_trait]
pub trait ResultCacheStore: Send + Sync {
    async fn get_cached_result(&self, hash: &str) -> MbResult<Option<VisionAnalysis>>;
    async fn put_cached_result(&self, hash: &str, result: &VisionAnalysis) -> MbResult<()>;
}

/// Durable enrichment-task rows. `try_claim` is the only write that grants
/// processing rights: a conditional update that succeeds iff the row was
/// still pending.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &AiTask) -> MbResult<()>;
    async fn get_task(&self, id: Uuid) -> MbResult<Option<AiTask>>;
    /// The non-terminal (pending or processing) task for an image, if any.
    async fn find_active_task(&self, emoji_id: Uuid) -> MbResult<Option<AiTask>>;
    /// Pending rows with `next_retry_at <= now_ms`, FIFO by `created_at`.
    async fn fetch_eligible(&self, now_ms: i64, limit: usize) -> MbResult<Vec<AiTask>>;
    /// Atomically set pending → processing. Returns true iff this caller won.
    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> MbResult<bool>;
    async fn mark_succeeded(&self, id: Uuid, now: DateTime<Utc>) -> MbResult<()>;
    async fn mark_retry(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        next_retry_at: i64,
        now: DateTime<Utc>,
    ) -> MbResult<()>;
    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> MbResult<()>;
    /// Flip every processing row back to pending. Returns the count.
    async fn reset_processing(&self, now: DateTime<Utc>) -> MbResult<usize>;
    /// Flip every failed row back to pending with attempts reset.
    async fn reset_failed(&self, now: DateTime<Utc>) -> MbResult<usize>;
    async fn task_stats(&self) -> MbResult<TaskStats>;
    async fn failed_emoji_ids(&self) -> MbResult<Vec<Uuid>>;
}

/// All four table stores backed by the same database.
pub trait MetadataStore: ImageStore + CategoryStore + ResultCacheStore + TaskStore {}

impl<T: ImageStore + CategoryStore + ResultCacheStore + TaskStore> MetadataStore for T {}

/// Image byte storage under `<id>.<ext>`. Per-file operations are serialized
/// by unique ids; the store has no internal locking.
pub trait BlobStore: Send + Sync {
    fn write(&self, id: Uuid, ext: &str, bytes: &[u8]) -> MbResult<PathBuf>;
    /// Rename into the store; falls back to copy-then-unlink across
    /// filesystem boundaries.
    fn move_in(&self, id: Uuid, ext: &str, src: &Path) -> MbResult<PathBuf>;
    fn read(&self, path: &Path) -> MbResult<Vec<u8>>;
    fn delete(&self, path: &Path) -> MbResult<()>;
}

/// Injectable time source so retry timing is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn _assert_metadata_store_object_safe(_: &dyn MetadataStore) {}
fn _assert_blob_store_object_safe(_: &dyn BlobStore) {}
fn _assert_clock_object_safe(_: &dyn Clock) {}
