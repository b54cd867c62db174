use std::path::Path;

use serde::{Deserialize, Serialize};

use mb_core::{MbError, MbResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoboxConfig {
    /// Root of the blob store.
    pub storage_path: String,
    /// SQLite database file holding all four tables.
    pub database_path: String,
    /// Base URL advertised to clients building image links.
    #[serde(default)]
    pub base_url: String,
    /// Non-empty token required on uploads; empty disables the check.
    #[serde(default)]
    pub upload_token: String,
    /// Category names seeded at startup if absent.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub vision: VisionConfig,
}

impl Default for MemoboxConfig {
    fn default() -> Self {
        Self {
            storage_path: shellexpand("~/.memobox/images"),
            database_path: shellexpand("~/.memobox/memobox.sqlite"),
            base_url: String::new(),
            upload_token: String::new(),
            categories: default_categories(),
            enrichment: EnrichmentConfig::default(),
            vision: VisionConfig::default(),
        }
    }
}

impl MemoboxConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> MbResult<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| MbError::Config(format!("read {}: {e}", p.display())))?;
                toml::from_str(&raw).map_err(|e| MbError::Config(format!("parse config: {e}")))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = non_empty_env("MEMOBOX_STORAGE_PATH") {
            self.storage_path = v;
        }
        if let Some(v) = non_empty_env("MEMOBOX_DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = non_empty_env("MEMOBOX_UPLOAD_TOKEN") {
            self.upload_token = v;
        }
        if let Some(v) = non_empty_env("MEMOBOX_VISION_API_KEY") {
            self.vision.api_key = Some(v);
        }
        if let Some(v) = non_empty_env("MEMOBOX_VISION_BASE_URL") {
            self.vision.base_url = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Gate AI model use entirely.
    pub auto_analyze: bool,
    pub auto_categorize: bool,
    /// When false, enrichment runs inline during ingest with no queue rows.
    pub persist_ai_tasks: bool,
    /// Default in-process concurrency cap.
    pub ai_concurrency: usize,
    /// Default delay between dispatches, in milliseconds.
    pub ai_batch_delay_ms: u64,
    /// Retry budget per task.
    pub ai_max_attempts: u32,
    /// Backoff base B, in milliseconds: retry delay = B * 2^(attempt-1).
    pub ai_backoff_base_ms: u64,
    /// Pre-ingest type filter labels; active only with the flag below.
    pub accepted_image_types: Vec<String>,
    pub enable_image_type_filter: bool,
    /// Start the worker loop paused; an operator resumes it explicitly.
    #[serde(default)]
    pub start_paused: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            auto_analyze: true,
            auto_categorize: true,
            persist_ai_tasks: true,
            ai_concurrency: 2,
            ai_batch_delay_ms: 500,
            ai_max_attempts: 3,
            ai_backoff_base_ms: 30_000,
            accepted_image_types: Vec::new(),
            enable_image_type_filter: false,
            start_paused: false,
        }
    }
}

/// Connection settings for the OpenAI-compatible vision endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            api_key: None,
            model: "qwen2.5-vl".into(),
            max_tokens: 512,
            temperature: 0.3,
            timeout_secs: 60,
        }
    }
}

fn default_categories() -> Vec<String> {
    ["其他", "可爱", "搞笑", "生气", "伤心"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn shellexpand(s: &str) -> String {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    s.to_string()
}
