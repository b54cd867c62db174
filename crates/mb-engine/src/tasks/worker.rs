use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use mb_core::{AiTask, BlobStore};

use crate::catalog::Catalog;
use crate::config::EnrichmentConfig;
use crate::inspect::{detect_format, prepare_frames};
use crate::tasks::queue::{RetryPolicy, TaskQueue};
use crate::vision::{VisionClient, VisionPrompt};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Mirrors `persist_ai_tasks`; when false the loop idles.
    pub enabled: bool,
    pub concurrency: usize,
    pub batch_delay_ms: u64,
    pub retry: RetryPolicy,
    pub start_paused: bool,
    /// Sleep when paused, disabled, or the queue is empty.
    pub idle_poll: Duration,
    /// Sleep when the concurrency cap is saturated.
    pub busy_poll: Duration,
    /// Settle sleep after a dispatch round.
    pub settle_poll: Duration,
    /// Safety sleep after a loop-level error.
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_enrichment(e: &EnrichmentConfig) -> Self {
        Self {
            enabled: e.persist_ai_tasks,
            concurrency: e.ai_concurrency.max(1),
            batch_delay_ms: e.ai_batch_delay_ms,
            retry: RetryPolicy {
                max_attempts: e.ai_max_attempts.max(1),
                backoff_base_ms: e.ai_backoff_base_ms,
            },
            start_paused: e.start_paused,
            idle_poll: Duration::from_secs(2),
            busy_poll: Duration::from_secs(1),
            settle_poll: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Operator-tunable knobs shared between the worker loop and the HTTP
/// layer. Concurrency > 0 and batch delay >= 0 override the config
/// defaults; zero/negative means "use config".
#[derive(Debug)]
pub struct RuntimeOverrides {
    paused: AtomicBool,
    concurrency: AtomicI64,
    batch_delay_ms: AtomicI64,
}

impl RuntimeOverrides {
    pub fn new(start_paused: bool) -> Self {
        Self {
            paused: AtomicBool::new(start_paused),
            concurrency: AtomicI64::new(0),
            batch_delay_ms: AtomicI64::new(-1),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_concurrency(&self, value: i64) {
        self.concurrency.store(value, Ordering::SeqCst);
    }

    pub fn set_batch_delay_ms(&self, value: i64) {
        self.batch_delay_ms.store(value, Ordering::SeqCst);
    }

    pub fn effective_concurrency(&self, default: usize) -> usize {
        let value = self.concurrency.load(Ordering::SeqCst);
        if value > 0 {
            value as usize
        } else {
            default
        }
    }

    pub fn effective_batch_delay_ms(&self, default: u64) -> u64 {
        let value = self.batch_delay_ms.load(Ordering::SeqCst);
        if value >= 0 {
            value as u64
        } else {
            default
        }
    }
}

enum TaskFailure {
    /// Cannot heal on retry; the task goes straight to FAILED.
    Terminal(String),
    Retryable(String),
}

struct WorkerInner {
    catalog: Arc<Catalog>,
    queue: Arc<TaskQueue>,
    blobs: Arc<dyn BlobStore>,
    vision: Arc<dyn VisionClient>,
    config: WorkerConfig,
    overrides: Arc<RuntimeOverrides>,
    /// Tasks dispatched by this process and not yet finished; guards against
    /// double-dispatch even if a claim misbehaves.
    in_flight: Mutex<HashSet<Uuid>>,
    active: AtomicUsize,
    drained: Notify,
}

/// Single long-running enrichment loop per process: polls the queue,
/// claims eligible tasks, and dispatches them to the vision client under a
/// dynamic concurrency cap.
#[derive(Clone)]
pub struct EnrichmentWorker {
    inner: Arc<WorkerInner>,
}

impl EnrichmentWorker {
    pub fn new(
        catalog: Arc<Catalog>,
        queue: Arc<TaskQueue>,
        blobs: Arc<dyn BlobStore>,
        vision: Arc<dyn VisionClient>,
        config: WorkerConfig,
    ) -> Self {
        let overrides = Arc::new(RuntimeOverrides::new(config.start_paused));
        Self {
            inner: Arc::new(WorkerInner {
                catalog,
                queue,
                blobs,
                vision,
                config,
                overrides,
                in_flight: Mutex::new(HashSet::new()),
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn overrides(&self) -> Arc<RuntimeOverrides> {
        Arc::clone(&self.inner.overrides)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Run until a shutdown signal arrives, then wait for in-flight tasks to
    /// settle before returning.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        match self.inner.queue.reset_stuck().await {
            Ok(n) if n > 0 => tracing::info!(requeued = n, "reset stuck tasks at startup"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "failed to reset stuck tasks"),
        }
        tracing::info!(
            concurrency = self.inner.config.concurrency,
            batch_delay_ms = self.inner.config.batch_delay_ms,
            enabled = self.inner.config.enabled,
            "enrichment worker started"
        );

        loop {
            let sleep = self.poll_once().await;
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        tracing::info!("enrichment worker shutting down, draining in-flight tasks");
        self.wait_idle().await;
        tracing::info!("enrichment worker stopped");
    }

    /// One poll round. Returns how long the loop should sleep before the
    /// next round.
    async fn poll_once(&self) -> Duration {
        let inner = &self.inner;
        if !inner.config.enabled || inner.overrides.is_paused() {
            return inner.config.idle_poll;
        }

        let cap = inner
            .overrides
            .effective_concurrency(inner.config.concurrency)
            .max(1);
        let active = inner.active.load(Ordering::SeqCst);
        if active >= cap {
            return inner.config.busy_poll;
        }

        // Over-fetch: some of these claims will be lost to sibling workers.
        let batch = match inner.queue.fetch_eligible(2 * (cap - active)).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "task poll failed");
                return inner.config.error_backoff;
            }
        };
        if batch.is_empty() {
            return inner.config.idle_poll;
        }

        let delay = inner
            .overrides
            .effective_batch_delay_ms(inner.config.batch_delay_ms);

        for task in batch {
            if inner.active.load(Ordering::SeqCst) >= cap {
                break;
            }
            if !self.begin(task.id) {
                continue; // already dispatched by this process
            }
            match inner.queue.try_claim(task.id).await {
                Ok(true) => {
                    inner.active.fetch_add(1, Ordering::SeqCst);
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_task(task).await;
                    });
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
                Ok(false) => {
                    // Lost the race; another worker owns it now.
                    self.end(task.id);
                }
                Err(e) => {
                    self.end(task.id);
                    tracing::error!(task_id = %task.id, error = %e, "claim failed");
                    return inner.config.error_backoff;
                }
            }
        }

        inner.config.settle_poll
    }

    fn begin(&self, id: Uuid) -> bool {
        self.inner.in_flight.lock().expect("in-flight lock").insert(id)
    }

    fn end(&self, id: Uuid) {
        self.inner
            .in_flight
            .lock()
            .expect("in-flight lock")
            .remove(&id);
    }

    async fn process_task(&self, task: AiTask) {
        tracing::info!(task_id = %task.id, emoji_id = %task.emoji_id, "processing enrichment task");
        match self.enrich(&task).await {
            Ok(()) => {
                if let Err(e) = self.inner.queue.complete_success(task.id).await {
                    tracing::error!(task_id = %task.id, error = %e, "failed to mark task succeeded");
                }
            }
            Err(TaskFailure::Terminal(msg)) => {
                tracing::warn!(task_id = %task.id, error = %msg, "task failed terminally");
                if let Err(e) = self.inner.queue.fail_terminal(task.id, &msg).await {
                    tracing::error!(task_id = %task.id, error = %e, "failed to mark task failed");
                }
            }
            Err(TaskFailure::Retryable(msg)) => {
                tracing::warn!(task_id = %task.id, error = %msg, "task failed");
                if let Err(e) = self
                    .inner
                    .queue
                    .complete_fail(task.id, &msg, &self.inner.config.retry)
                    .await
                {
                    tracing::error!(task_id = %task.id, error = %e, "failed to record task failure");
                }
            }
        }
        self.end(task.id);
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.drained.notify_waiters();
    }

    async fn enrich(&self, task: &AiTask) -> Result<(), TaskFailure> {
        let inner = &self.inner;

        let bytes = inner
            .blobs
            .read(Path::new(&task.image_path))
            .map_err(|e| TaskFailure::Terminal(format!("image file unreadable: {e}")))?;
        let format = detect_format(&bytes).ok_or_else(|| {
            TaskFailure::Terminal("stored bytes are not a supported image".into())
        })?;

        // A sibling task for the same content may already have paid for the
        // model call.
        let analysis = match self.cached(&task.image_hash).await {
            Some(cached) => cached,
            None => {
                let frames = prepare_frames(&bytes, format);
                let categories = inner.catalog.category_names().await.unwrap_or_default();
                match inner
                    .vision
                    .analyze(
                        &frames,
                        VisionPrompt::Enrich {
                            known_categories: &categories,
                        },
                    )
                    .await
                {
                    Ok(Some(analysis)) => analysis,
                    Ok(None) => {
                        return Err(TaskFailure::Retryable(
                            "model returned no structured result".into(),
                        ))
                    }
                    Err(e) => return Err(TaskFailure::Retryable(e.to_string())),
                }
            }
        };

        // The image row may have vanished mid-flight; the update is then a
        // no-op and the task still finishes cleanly.
        inner
            .catalog
            .apply_analysis(task.emoji_id, &analysis)
            .await
            .map_err(|e| TaskFailure::Retryable(format!("apply analysis: {e}")))?;
        inner
            .catalog
            .put_cached_result(&task.image_hash, &analysis)
            .await
            .map_err(|e| TaskFailure::Retryable(format!("cache write: {e}")))?;
        Ok(())
    }

    async fn cached(&self, hash: &str) -> Option<mb_core::VisionAnalysis> {
        match self.inner.catalog.cached_result(hash).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "cache lookup failed, calling model");
                None
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.drained.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IngestOptions;
    use crate::config::MemoboxConfig;
    use crate::tasks::queue::EnqueueOutcome;
    use crate::test_utils::{png_bytes, ScriptedVision, VisionScriptStep};
    use mb_core::{Clock, SystemClock, TaskStore, VisionAnalysis};
    use mb_storage::{DiskBlobStore, SqliteStore};
    use tempfile::TempDir;

    struct Harness {
        store: Arc<SqliteStore>,
        vision: Arc<ScriptedVision>,
        catalog: Arc<Catalog>,
        queue: Arc<TaskQueue>,
        _tmp: TempDir,
    }

    fn fast_config(
        vision: Arc<ScriptedVision>,
        max_attempts: u32,
        backoff_base_ms: u64,
    ) -> (Harness, EnrichmentWorker) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let blobs = Arc::new(DiskBlobStore::new(tmp.path().join("blobs")));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut config = MemoboxConfig::default();
        config.enrichment.ai_max_attempts = max_attempts;
        config.enrichment.ai_backoff_base_ms = backoff_base_ms;
        config.enrichment.ai_batch_delay_ms = 0;

        let queue = Arc::new(TaskQueue::new(store.clone(), clock.clone()));
        let catalog = Arc::new(Catalog::new(
            store.clone(),
            blobs.clone(),
            vision.clone(),
            clock,
            queue.clone(),
            config.clone(),
        ));

        let mut worker_config = WorkerConfig::from_enrichment(&config.enrichment);
        worker_config.idle_poll = Duration::from_millis(20);
        worker_config.busy_poll = Duration::from_millis(20);
        worker_config.settle_poll = Duration::from_millis(10);
        worker_config.error_backoff = Duration::from_millis(50);

        let worker = EnrichmentWorker::new(
            catalog.clone(),
            queue.clone(),
            blobs.clone(),
            vision.clone(),
            worker_config,
        );
        (
            Harness {
                store,
                vision,
                catalog,
                queue,
                _tmp: tmp,
            },
            worker,
        )
    }

    fn cat_analysis() -> VisionAnalysis {
        VisionAnalysis {
            name: Some("猫咪".into()),
            category: Some("可爱".into()),
            tags: vec!["动物".into(), "猫".into()],
            description: Some("a cat".into()),
            new_category: None,
        }
    }

    async fn ingest_with_task(h: &Harness) -> mb_core::ImageRecord {
        h.catalog.initialize().await.unwrap();
        h.catalog
            .ingest_from_bytes(
                IngestOptions {
                    name: Some("cat".into()),
                    ..Default::default()
                },
                png_bytes(),
                true,
            )
            .await
            .unwrap()
    }

    async fn run_worker_for(worker: &EnrichmentWorker, duration: Duration) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let w = worker.clone();
        let handle = tokio::spawn(async move { w.run(shutdown_rx).await });
        tokio::time::sleep(duration).await;
        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn drains_task_and_applies_merge() {
        let vision = Arc::new(ScriptedVision::always(cat_analysis()));
        let (h, worker) = fast_config(vision, 3, 1000);
        let record = ingest_with_task(&h).await;
        assert_eq!(h.queue.stats().await.unwrap().pending, 1);

        run_worker_for(&worker, Duration::from_millis(300)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pending, 0);

        let updated = h.catalog.get_image(record.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "猫咪");
        assert_eq!(updated.category, "可爱");
        assert_eq!(updated.tags, vec!["动物", "猫"]);

        // Success implies a cache row keyed by the content hash.
        let cached = h.catalog.cached_result(&record.image_hash).await.unwrap();
        assert_eq!(cached.unwrap().name.as_deref(), Some("猫咪"));
        assert_eq!(h.vision.calls(), 1);
    }

    #[tokio::test]
    async fn failing_model_exhausts_retries_into_failed() {
        let vision = Arc::new(ScriptedVision::failing("model down"));
        let (h, worker) = fast_config(vision, 3, 10);
        let _record = ingest_with_task(&h).await;

        run_worker_for(&worker, Duration::from_millis(600)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(h.vision.calls(), 3);

        let failed = h.queue.list_failed_emoji_ids().await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let vision = Arc::new(ScriptedVision::script(
            vec![
                VisionScriptStep::Fail("transient 1".into()),
                VisionScriptStep::Fail("transient 2".into()),
                VisionScriptStep::Succeed(cat_analysis()),
            ],
            VisionScriptStep::Fail("exhausted script".into()),
        ));
        let (h, worker) = fast_config(vision, 5, 10);
        let record = ingest_with_task(&h).await;

        run_worker_for(&worker, Duration::from_millis(800)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(h.vision.calls(), 3);

        let updated = h.catalog.get_image(record.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "猫咪");
    }

    #[tokio::test]
    async fn startup_resets_stuck_processing_rows() {
        let vision = Arc::new(ScriptedVision::always(cat_analysis()));
        let (h, worker) = fast_config(vision, 3, 10);
        let record = ingest_with_task(&h).await;

        // Simulate a crash mid-processing: claim the row directly, then
        // start a fresh worker.
        let task = h
            .store
            .find_active_task(record.id)
            .await
            .unwrap()
            .unwrap();
        assert!(h.store.try_claim(task.id, chrono::Utc::now()).await.unwrap());
        assert_eq!(h.queue.stats().await.unwrap().processing, 1);

        run_worker_for(&worker, Duration::from_millis(300)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn paused_worker_makes_no_model_calls() {
        let vision = Arc::new(ScriptedVision::always(cat_analysis()));
        let (h, worker) = fast_config(vision, 3, 10);
        let _record = ingest_with_task(&h).await;

        worker.overrides().set_paused(true);
        run_worker_for(&worker, Duration::from_millis(200)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(h.vision.calls(), 0);
    }

    #[tokio::test]
    async fn resume_after_pause_drains_queue() {
        let vision = Arc::new(ScriptedVision::always(cat_analysis()));
        let (h, worker) = fast_config(vision, 3, 10);
        let _record = ingest_with_task(&h).await;

        worker.overrides().set_paused(true);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let w = worker.clone();
        let handle = tokio::spawn(async move { w.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.vision.calls(), 0);

        worker.overrides().set_paused(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = shutdown_tx.send(());
        handle.await.unwrap();

        assert_eq!(h.queue.stats().await.unwrap().succeeded, 1);
        assert_eq!(h.vision.calls(), 1);
    }

    #[tokio::test]
    async fn deleted_image_still_ends_task_cleanly() {
        let vision = Arc::new(ScriptedVision::always(cat_analysis()));
        let (h, worker) = fast_config(vision, 3, 10);
        let record = ingest_with_task(&h).await;

        // Delete the row but leave the blob so the file read succeeds; the
        // image-update step becomes a no-op.
        let blob_path = std::path::PathBuf::from(&record.path);
        let saved = std::fs::read(&blob_path).unwrap();
        h.catalog.delete_image(record.id).await.unwrap();
        std::fs::write(&blob_path, &saved).unwrap();

        run_worker_for(&worker, Duration::from_millis(300)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert!(h.catalog.get_image(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_image_file_is_terminal_failure() {
        let vision = Arc::new(ScriptedVision::always(cat_analysis()));
        let (h, worker) = fast_config(vision, 5, 10);
        let record = ingest_with_task(&h).await;
        std::fs::remove_file(&record.path).unwrap();

        run_worker_for(&worker, Duration::from_millis(300)).await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        // No retries were burned on an unhealable failure.
        assert_eq!(h.vision.calls(), 0);
    }

    #[tokio::test]
    async fn cache_hit_skips_model_call() {
        let vision = Arc::new(ScriptedVision::failing("should not be called"));
        let (h, worker) = fast_config(vision, 3, 10);
        h.catalog.initialize().await.unwrap();

        // Pre-seed the cache, then enqueue a task for matching content.
        let bytes = png_bytes();
        let hash = crate::inspect::sha256_hex(&bytes);
        h.catalog.put_cached_result(&hash, &cat_analysis()).await.unwrap();

        let record = h
            .catalog
            .ingest_from_bytes(IngestOptions::default(), bytes, false)
            .await
            .unwrap();
        let EnqueueOutcome::Created(_) = h
            .queue
            .enqueue(record.id, &record.path, &record.image_hash)
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        run_worker_for(&worker, Duration::from_millis(300)).await;

        assert_eq!(h.queue.stats().await.unwrap().succeeded, 1);
        assert_eq!(h.vision.calls(), 0);
        let updated = h.catalog.get_image(record.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "猫咪");
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight_tasks() {
        let vision = Arc::new(ScriptedVision::slow(cat_analysis(), Duration::from_millis(150)));
        let (h, worker) = fast_config(vision.clone(), 3, 10);
        h.catalog.initialize().await.unwrap();
        worker.overrides().set_concurrency(2);

        for i in 0..4u8 {
            let mut bytes = png_bytes();
            bytes.push(i); // distinct content hashes
            let record = h
                .catalog
                .ingest_from_bytes(IngestOptions::default(), bytes, false)
                .await
                .unwrap();
            h.queue
                .enqueue(record.id, &record.path, &record.image_hash)
                .await
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let w = worker.clone();
        let handle = tokio::spawn(async move { w.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(worker.active_count() <= 2);
        assert!(vision.max_concurrent() <= 2);

        tokio::time::sleep(Duration::from_millis(700)).await;
        let _ = shutdown_tx.send(());
        handle.await.unwrap();

        assert_eq!(h.queue.stats().await.unwrap().succeeded, 4);
        assert!(vision.max_concurrent() <= 2);
    }

    #[test]
    fn overrides_fall_back_to_config() {
        let overrides = RuntimeOverrides::new(false);
        assert_eq!(overrides.effective_concurrency(3), 3);
        assert_eq!(overrides.effective_batch_delay_ms(500), 500);

        overrides.set_concurrency(8);
        overrides.set_batch_delay_ms(0);
        assert_eq!(overrides.effective_concurrency(3), 8);
        assert_eq!(overrides.effective_batch_delay_ms(500), 0);

        // Zero/negative means "use config".
        overrides.set_concurrency(0);
        overrides.set_batch_delay_ms(-1);
        assert_eq!(overrides.effective_concurrency(3), 3);
        assert_eq!(overrides.effective_batch_delay_ms(500), 500);
    }
}
