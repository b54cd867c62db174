pub mod catalog;
pub mod config;
pub mod extract;
pub mod inspect;
pub mod tasks;
pub mod test_utils;
pub mod vision;

pub use catalog::{Catalog, CatalogEvent, IngestOptions};
pub use config::MemoboxConfig;
pub use tasks::{EnrichmentWorker, RuntimeOverrides, TaskQueue, WorkerConfig};
