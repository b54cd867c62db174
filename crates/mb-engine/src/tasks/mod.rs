pub mod queue;
pub mod worker;

pub use queue::{EnqueueOutcome, RetryPolicy, TaskQueue};
pub use worker::{EnrichmentWorker, RuntimeOverrides, WorkerConfig};
