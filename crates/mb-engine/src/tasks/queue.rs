use std::sync::Arc;

use uuid::Uuid;

use mb_core::{AiTask, Clock, MbError, MbResult, TaskStats, TaskStatus, TaskStore};

/// Retry budget and backoff base for failed tasks.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    /// Delay before the next run after `attempt` failures:
    /// `base * 2^(attempt-1)`.
    pub fn backoff_ms(&self, attempt: u32) -> i64 {
        let exp = attempt.saturating_sub(1).min(20);
        (self.backoff_base_ms as i64).saturating_mul(1i64 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 30_000,
        }
    }
}

#[derive(Debug)]
pub enum EnqueueOutcome {
    Created(AiTask),
    /// A non-terminal task for the same image already exists.
    AlreadyQueued,
}

/// Policy layer over the durable task table: idempotent enrollment, claim,
/// completion, retry bookkeeping, and operator resets.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Enroll new work unless a pending or processing task for this image
    /// already exists.
    pub async fn enqueue(
        &self,
        emoji_id: Uuid,
        image_path: &str,
        image_hash: &str,
    ) -> MbResult<EnqueueOutcome> {
        if self.store.find_active_task(emoji_id).await?.is_some() {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
        let now = self.clock.now();
        let mut task = AiTask::new(emoji_id, image_path, image_hash);
        task.created_at = now;
        task.updated_at = now;
        self.store.insert_task(&task).await?;
        Ok(EnqueueOutcome::Created(task))
    }

    /// Pending tasks whose retry time has passed, FIFO by creation time.
    pub async fn fetch_eligible(&self, limit: usize) -> MbResult<Vec<AiTask>> {
        self.store.fetch_eligible(self.clock.now_ms(), limit).await
    }

    /// Atomic pending → processing transition; true iff this caller won.
    pub async fn try_claim(&self, id: Uuid) -> MbResult<bool> {
        self.store.try_claim(id, self.clock.now()).await
    }

    pub async fn complete_success(&self, id: Uuid) -> MbResult<()> {
        self.store.mark_succeeded(id, self.clock.now()).await
    }

    /// Record a failure: retry with exponential backoff, or FAILED once the
    /// attempt budget is spent. Returns the resulting status.
    pub async fn complete_fail(
        &self,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> MbResult<TaskStatus> {
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| MbError::Storage(format!("task not found: {id}")))?;
        let attempts = task.attempts + 1;
        let now = self.clock.now();
        if attempts >= policy.max_attempts {
            self.store.mark_failed(id, attempts, error, now).await?;
            Ok(TaskStatus::Failed)
        } else {
            let next_retry_at = self.clock.now_ms() + policy.backoff_ms(attempts);
            self.store
                .mark_retry(id, attempts, error, next_retry_at, now)
                .await?;
            Ok(TaskStatus::Pending)
        }
    }

    /// Fail a task with no retry, regardless of remaining budget. Used when
    /// the failure cannot heal (the image file is gone).
    pub async fn fail_terminal(&self, id: Uuid, error: &str) -> MbResult<()> {
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| MbError::Storage(format!("task not found: {id}")))?;
        self.store
            .mark_failed(id, task.attempts + 1, error, self.clock.now())
            .await
    }

    /// Requeue processing rows left over from a crashed run. Called exactly
    /// once at worker startup.
    pub async fn reset_stuck(&self) -> MbResult<usize> {
        self.store.reset_processing(self.clock.now()).await
    }

    /// Operator retry: every FAILED row back to PENDING with a fresh budget.
    pub async fn retry_failed(&self) -> MbResult<usize> {
        self.store.reset_failed(self.clock.now()).await
    }

    pub async fn stats(&self) -> MbResult<TaskStats> {
        self.store.task_stats().await
    }

    pub async fn list_failed_emoji_ids(&self) -> MbResult<Vec<Uuid>> {
        self.store.failed_emoji_ids().await
    }
}
