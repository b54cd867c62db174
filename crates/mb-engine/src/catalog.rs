use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use mb_core::*;

use crate::config::MemoboxConfig;
use crate::inspect::{detect_format, prepare_frames, sha256_hex};
use crate::tasks::queue::{EnqueueOutcome, TaskQueue};
use crate::vision::{VisionClient, VisionPrompt};

/// Images with no usable category land here.
pub const DEFAULT_CATEGORY: &str = "其他";

/// Marker description on categories the AI proposed.
const AUTO_CATEGORY_DESCRIPTION: &str = "AI 自动创建";

/// Lifecycle notifications, consumed by the UI refresh path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CatalogEvent {
    ImageAdded { id: Uuid, name: String },
    ImageUpdated { id: Uuid, name: String },
    ImageDeleted { id: Uuid, name: String },
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub name: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MergedFields {
    pub name: String,
    pub category: String,
    pub tags: Vec<String>,
}

/// Merge user-supplied fields with an AI result. Both the cache-hit path at
/// ingest and the worker success path go through here.
pub fn merge_analysis(
    name_u: &str,
    category_u: &str,
    tags_u: &[String],
    analysis: &VisionAnalysis,
) -> MergedFields {
    let name = analysis
        .name
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(name_u)
        .to_string();
    let category = analysis
        .category
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| Some(category_u).filter(|s| !s.trim().is_empty()))
        .unwrap_or(DEFAULT_CATEGORY)
        .to_string();
    let mut tags: Vec<String> = Vec::new();
    for tag in tags_u.iter().chain(analysis.tags.iter()) {
        if !tag.trim().is_empty() && !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    MergedFields { name, category, tags }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Image lifecycle service: ingest, dedup, metadata updates, deletion,
/// category bookkeeping, and handoff to the enrichment pipeline.
pub struct Catalog {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    vision: Arc<dyn VisionClient>,
    clock: Arc<dyn Clock>,
    queue: Arc<TaskQueue>,
    config: MemoboxConfig,
    events: broadcast::Sender<CatalogEvent>,
}

impl Catalog {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        vision: Arc<dyn VisionClient>,
        clock: Arc<dyn Clock>,
        queue: Arc<TaskQueue>,
        config: MemoboxConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            blobs,
            vision,
            clock,
            queue,
            config,
            events,
        }
    }

    /// Seed configured categories and reconcile counts with the image rows.
    /// Called once at process start.
    pub async fn initialize(&self) -> MbResult<()> {
        for name in &self.config.categories {
            self.ensure_category(name, None).await?;
        }
        self.store.recount_categories().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn emit(&self, event: CatalogEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    pub async fn ingest_from_bytes(
        &self,
        options: IngestOptions,
        bytes: Vec<u8>,
        enrich: bool,
    ) -> MbResult<ImageRecord> {
        let format = detect_format(&bytes).ok_or(MbError::InvalidFormat)?;
        let hash = sha256_hex(&bytes);
        self.reject_duplicate(&hash).await?;
        self.check_type_filter(&bytes, format).await?;

        let id = Uuid::now_v7();
        let path = self.blobs.write(id, format.ext(), &bytes)?;
        self.finish_ingest(id, options, &bytes, format, hash, path, enrich)
            .await
    }

    /// Same as [`ingest_from_bytes`] but the source file is moved into the
    /// blob store. On a duplicate, the caller's temp file is deleted.
    pub async fn ingest_from_path(
        &self,
        options: IngestOptions,
        src: &Path,
        enrich: bool,
    ) -> MbResult<ImageRecord> {
        let bytes = std::fs::read(src)
            .map_err(|e| MbError::Storage(format!("read {}: {e}", src.display())))?;
        let format = detect_format(&bytes).ok_or(MbError::InvalidFormat)?;
        let hash = sha256_hex(&bytes);
        if let Err(e) = self.reject_duplicate(&hash).await {
            let _ = std::fs::remove_file(src);
            return Err(e);
        }
        self.check_type_filter(&bytes, format).await?;

        let id = Uuid::now_v7();
        let path = self.blobs.move_in(id, format.ext(), src)?;
        self.finish_ingest(id, options, &bytes, format, hash, path, enrich)
            .await
    }

    /// Ingest every supported file in a directory (non-recursive). Sources
    /// are left in place; duplicates and per-file failures are counted, not
    /// fatal.
    pub async fn import_folder(&self, dir: &Path, enrich: bool) -> MbResult<ImportSummary> {
        let mut summary = ImportSummary::default();
        for path in self.scan_folder(dir)? {
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    summary.failed += 1;
                    continue;
                }
            };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from);
            let options = IngestOptions {
                name,
                ..Default::default()
            };
            match self.ingest_from_bytes(options, bytes, enrich).await {
                Ok(_) => summary.imported += 1,
                Err(MbError::Duplicate(_)) => summary.duplicates += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "import failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Candidate image files in a directory, by extension.
    pub fn scan_folder(&self, dir: &Path) -> MbResult<Vec<std::path::PathBuf>> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| MbError::Storage(format!("read dir {}: {e}", dir.display())))?;
        let mut paths = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if matches!(
                ext.as_deref(),
                Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp")
            ) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn reject_duplicate(&self, hash: &str) -> MbResult<()> {
        if let Some(existing) = self.store.get_image_by_hash(hash).await? {
            return Err(MbError::Duplicate(existing.name));
        }
        Ok(())
    }

    /// Optional pre-ingest gate: ask the model whether the image matches an
    /// accepted type. Model failures never block ingest.
    async fn check_type_filter(&self, bytes: &[u8], format: ImageFormat) -> MbResult<()> {
        let e = &self.config.enrichment;
        if !e.enable_image_type_filter || e.accepted_image_types.is_empty() || !e.auto_analyze {
            return Ok(());
        }
        let frames = prepare_frames(bytes, format);
        match self
            .vision
            .analyze(
                &frames,
                VisionPrompt::TypeFilter {
                    accepted_types: &e.accepted_image_types,
                },
            )
            .await
        {
            Ok(Some(result)) => {
                if let Some(label) = result.category {
                    if !e.accepted_image_types.contains(&label) {
                        return Err(MbError::InvalidInput(format!(
                            "image type not accepted: {label}"
                        )));
                    }
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "type filter call failed, admitting image");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_ingest(
        &self,
        id: Uuid,
        options: IngestOptions,
        bytes: &[u8],
        format: ImageFormat,
        hash: String,
        path: std::path::PathBuf,
        enrich: bool,
    ) -> MbResult<ImageRecord> {
        let name = options
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("表情包-{}", &hash[..8]));
        let category = options
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let mut tags = Vec::new();
        for tag in options.tags {
            if !tag.trim().is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let record = ImageRecord {
            id,
            name,
            category,
            tags,
            path: path.to_string_lossy().into_owned(),
            size: bytes.len() as u64,
            mime_type: format.mime().to_string(),
            image_hash: hash,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.store.insert_image(&record).await {
            // The blob was already written; remove it so the row stays the
            // single source of truth.
            let _ = self.blobs.delete(Path::new(&record.path));
            return Err(e);
        }
        self.ensure_category(&record.category, None).await?;
        self.store.bump_emoji_count(&record.category, 1).await?;
        self.emit(CatalogEvent::ImageAdded {
            id: record.id,
            name: record.name.clone(),
        });
        tracing::info!(id = %record.id, name = %record.name, "image ingested");

        if enrich && self.config.enrichment.auto_analyze {
            return self.enrich_new_image(record, bytes, format).await;
        }
        Ok(record)
    }

    /// Cache hit: apply immediately. Cache miss: enqueue a task, or run the
    /// model inline when task persistence is off. Enrichment errors are not
    /// surfaced to the ingest caller.
    async fn enrich_new_image(
        &self,
        record: ImageRecord,
        bytes: &[u8],
        format: ImageFormat,
    ) -> MbResult<ImageRecord> {
        if let Some(cached) = self.store.get_cached_result(&record.image_hash).await? {
            tracing::debug!(id = %record.id, "analysis cache hit at ingest");
            return self.apply_analysis_to(record, &cached).await;
        }

        if self.config.enrichment.persist_ai_tasks {
            match self
                .queue
                .enqueue(record.id, &record.path, &record.image_hash)
                .await?
            {
                EnqueueOutcome::Created(task) => {
                    tracing::debug!(id = %record.id, task_id = %task.id, "enrichment task enqueued");
                }
                EnqueueOutcome::AlreadyQueued => {}
            }
            return Ok(record);
        }

        // Inline path: block the ingest call on the model.
        let frames = prepare_frames(bytes, format);
        let categories = self.category_names().await?;
        match self
            .vision
            .analyze(
                &frames,
                VisionPrompt::Enrich {
                    known_categories: &categories,
                },
            )
            .await
        {
            Ok(Some(analysis)) => {
                self.store
                    .put_cached_result(&record.image_hash, &analysis)
                    .await?;
                self.apply_analysis_to(record, &analysis).await
            }
            Ok(None) => {
                tracing::warn!(id = %record.id, "inline enrichment returned no structured result");
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "inline enrichment failed");
                Ok(record)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Analysis application
    // -----------------------------------------------------------------------

    /// Apply an analysis to an image that may have been deleted mid-flight;
    /// `Ok(None)` means the row is gone and the update was a no-op.
    pub async fn apply_analysis(
        &self,
        emoji_id: Uuid,
        analysis: &VisionAnalysis,
    ) -> MbResult<Option<ImageRecord>> {
        let Some(record) = self.store.get_image(emoji_id).await? else {
            tracing::debug!(emoji_id = %emoji_id, "image vanished before analysis applied");
            return Ok(None);
        };
        self.apply_analysis_to(record, analysis).await.map(Some)
    }

    async fn apply_analysis_to(
        &self,
        mut record: ImageRecord,
        analysis: &VisionAnalysis,
    ) -> MbResult<ImageRecord> {
        let analysis = if self.config.enrichment.auto_categorize {
            analysis.clone()
        } else {
            VisionAnalysis {
                category: None,
                new_category: None,
                ..analysis.clone()
            }
        };

        if let Some(new_category) = analysis.new_category.as_deref() {
            if !new_category.trim().is_empty() {
                self.ensure_category(new_category, Some(AUTO_CATEGORY_DESCRIPTION))
                    .await?;
            }
        }

        let old_category = record.category.clone();
        let merged = merge_analysis(&record.name, &record.category, &record.tags, &analysis);
        record.name = merged.name;
        record.category = merged.category;
        record.tags = merged.tags;
        self.store.update_image(&record).await?;

        if record.category != old_category {
            self.store.bump_emoji_count(&old_category, -1).await?;
            self.ensure_category(&record.category, Some(AUTO_CATEGORY_DESCRIPTION))
                .await?;
            self.store.bump_emoji_count(&record.category, 1).await?;
        }
        self.emit(CatalogEvent::ImageUpdated {
            id: record.id,
            name: record.name.clone(),
        });
        Ok(record)
    }

    /// Synchronous re-analysis of one image; model failures surface to the
    /// caller here, unlike the queued path.
    pub async fn analyze_image(&self, id: Uuid) -> MbResult<ImageRecord> {
        let record = self
            .store
            .get_image(id)
            .await?
            .ok_or_else(|| MbError::ImageNotFound(id.to_string()))?;
        let bytes = self.blobs.read(Path::new(&record.path))?;
        let format = detect_format(&bytes).ok_or(MbError::InvalidFormat)?;
        let frames = prepare_frames(&bytes, format);
        let categories = self.category_names().await?;
        let analysis = self
            .vision
            .analyze(
                &frames,
                VisionPrompt::Enrich {
                    known_categories: &categories,
                },
            )
            .await?
            .ok_or_else(|| MbError::Model("no structured result from model".into()))?;
        self.store
            .put_cached_result(&record.image_hash, &analysis)
            .await?;
        self.apply_analysis_to(record, &analysis).await
    }

    /// Queue a re-analysis task per image id; returns how many were enqueued.
    pub async fn reanalyze_batch(&self, ids: &[Uuid]) -> MbResult<usize> {
        let mut enqueued = 0;
        for &id in ids {
            let Some(record) = self.store.get_image(id).await? else {
                continue;
            };
            if let EnqueueOutcome::Created(_) = self
                .queue
                .enqueue(record.id, &record.path, &record.image_hash)
                .await?
            {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_by_id_or_name(&self, key: &str) -> MbResult<Option<ImageRecord>> {
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(record) = self.store.get_image(id).await? {
                return Ok(Some(record));
            }
        }
        self.store.get_image_by_name(key).await
    }

    pub async fn get_image(&self, id: Uuid) -> MbResult<Option<ImageRecord>> {
        self.store.get_image(id).await
    }

    pub async fn list(
        &self,
        filter: &ImageFilter,
        limit: usize,
        offset: usize,
    ) -> MbResult<Vec<ImageRecord>> {
        self.store.list_images(filter, limit, offset).await
    }

    pub async fn search(&self, keyword: &str, limit: usize) -> MbResult<Vec<ImageRecord>> {
        self.store.search_images(keyword, limit).await
    }

    pub async fn random(&self, filter: &ImageFilter) -> MbResult<Option<ImageRecord>> {
        self.store.random_image(filter).await
    }

    pub async fn list_tags(&self) -> MbResult<Vec<String>> {
        self.store.list_tags().await
    }

    pub async fn count(&self, filter: &ImageFilter) -> MbResult<usize> {
        self.store.count_images(filter).await
    }

    pub async fn list_categories(&self) -> MbResult<Vec<Category>> {
        self.store.list_categories().await
    }

    pub async fn category_names(&self) -> MbResult<Vec<String>> {
        Ok(self
            .store
            .list_categories()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    pub async fn image_bytes(&self, record: &ImageRecord) -> MbResult<Vec<u8>> {
        self.blobs.read(Path::new(&record.path))
    }

    pub async fn cached_result(&self, hash: &str) -> MbResult<Option<VisionAnalysis>> {
        self.store.get_cached_result(hash).await
    }

    pub async fn put_cached_result(&self, hash: &str, result: &VisionAnalysis) -> MbResult<()> {
        self.store.put_cached_result(hash, result).await
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    pub async fn delete_image(&self, id: Uuid) -> MbResult<ImageRecord> {
        let record = self
            .store
            .get_image(id)
            .await?
            .ok_or_else(|| MbError::ImageNotFound(id.to_string()))?;
        self.blobs.delete(Path::new(&record.path))?;
        self.store.delete_image(id).await?;
        self.store.bump_emoji_count(&record.category, -1).await?;
        self.emit(CatalogEvent::ImageDeleted {
            id: record.id,
            name: record.name.clone(),
        });
        tracing::info!(id = %record.id, name = %record.name, "image deleted");
        Ok(record)
    }

    pub async fn update_name(&self, id: Uuid, name: String) -> MbResult<ImageRecord> {
        let mut record = self
            .store
            .get_image(id)
            .await?
            .ok_or_else(|| MbError::ImageNotFound(id.to_string()))?;
        if name.trim().is_empty() {
            return Err(MbError::InvalidInput("name must not be empty".into()));
        }
        record.name = name;
        self.store.update_image(&record).await?;
        self.emit(CatalogEvent::ImageUpdated {
            id: record.id,
            name: record.name.clone(),
        });
        Ok(record)
    }

    pub async fn update_category(&self, id: Uuid, category: String) -> MbResult<ImageRecord> {
        let mut record = self
            .store
            .get_image(id)
            .await?
            .ok_or_else(|| MbError::ImageNotFound(id.to_string()))?;
        let category = if category.trim().is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            category
        };
        if category != record.category {
            let old = record.category.clone();
            record.category = category;
            self.ensure_category(&record.category, None).await?;
            self.store.update_image(&record).await?;
            self.store.bump_emoji_count(&old, -1).await?;
            self.store.bump_emoji_count(&record.category, 1).await?;
        }
        self.emit(CatalogEvent::ImageUpdated {
            id: record.id,
            name: record.name.clone(),
        });
        Ok(record)
    }

    pub async fn update_tags(&self, id: Uuid, tags: Vec<String>) -> MbResult<ImageRecord> {
        let mut record = self
            .store
            .get_image(id)
            .await?
            .ok_or_else(|| MbError::ImageNotFound(id.to_string()))?;
        let mut deduped = Vec::new();
        for tag in tags {
            if !tag.trim().is_empty() && !deduped.contains(&tag) {
                deduped.push(tag);
            }
        }
        record.tags = deduped;
        self.store.update_image(&record).await?;
        self.emit(CatalogEvent::ImageUpdated {
            id: record.id,
            name: record.name.clone(),
        });
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Categories
    // -----------------------------------------------------------------------

    pub async fn add_category(
        &self,
        name: String,
        description: Option<String>,
    ) -> MbResult<Category> {
        if name.trim().is_empty() {
            return Err(MbError::InvalidInput("category name must not be empty".into()));
        }
        if self.store.get_category_by_name(&name).await?.is_some() {
            return Err(MbError::InvalidInput(format!("category already exists: {name}")));
        }
        let category = Category::new(name, description);
        self.store.insert_category(&category).await?;
        Ok(category)
    }

    /// Deleting a category moves its images to the default category.
    pub async fn delete_category(&self, id: Uuid) -> MbResult<()> {
        let category = self
            .store
            .get_category(id)
            .await?
            .ok_or_else(|| MbError::CategoryNotFound(id.to_string()))?;
        if category.name == DEFAULT_CATEGORY {
            return Err(MbError::InvalidInput(
                "the default category cannot be deleted".into(),
            ));
        }
        let filter = ImageFilter {
            category: Some(category.name.clone()),
            tag: None,
        };
        let members = self.store.list_images(&filter, usize::MAX / 2, 0).await?;
        for mut image in members {
            image.category = DEFAULT_CATEGORY.to_string();
            self.store.update_image(&image).await?;
        }
        self.store.delete_category(id).await?;
        self.store.recount_categories().await?;
        Ok(())
    }

    async fn ensure_category(&self, name: &str, description: Option<&str>) -> MbResult<()> {
        if self.store.get_category_by_name(name).await?.is_none() {
            let category = Category::new(name, description.map(String::from));
            self.store.insert_category(&category).await?;
            tracing::info!(name = %name, "category created");
        }
        Ok(())
    }
}
