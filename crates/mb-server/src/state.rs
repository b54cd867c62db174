use std::sync::Arc;

use mb_engine::catalog::Catalog;
use mb_engine::tasks::{RuntimeOverrides, TaskQueue};

/// Shared application state behind every handler.
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub queue: Arc<TaskQueue>,
    pub overrides: Arc<RuntimeOverrides>,
    /// Non-empty value enables the upload token check.
    pub upload_token: String,
    pub base_url: String,
}
