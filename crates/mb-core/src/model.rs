use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Image formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Image record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub tags: Vec<String>,
    /// Absolute path in the blob store; immutable after ingest.
    pub path: String,
    pub size: u64,
    pub mime_type: String,
    /// SHA-256 hex of the exact stored bytes; unique across live images.
    pub image_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        image_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            category: category.into(),
            tags: Vec::new(),
            path: path.into(),
            size,
            mime_type: mime_type.into(),
            image_hash: image_hash.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Non-transactional list filter: category match and/or any-tag match.
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub category: Option<String>,
    pub tag: Option<String>,
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Number of live images whose category equals `name`; maintained on
    /// image create/update/delete.
    pub emoji_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Category {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description,
            emoji_count: 0,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Vision analysis result (ai_results payload)
// ---------------------------------------------------------------------------

/// Structured output of one vision-model call, also the cached value keyed
/// by image hash. Field names follow the model's JSON contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionAnalysis {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub new_category: Option<String>,
}

// ---------------------------------------------------------------------------
// Enrichment tasks (ai_tasks rows)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses are never transitioned back except by an explicit
    /// operator retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiTask {
    pub id: Uuid,
    /// The image this task updates on success.
    pub emoji_id: Uuid,
    /// Blob path captured at enqueue time.
    pub image_path: String,
    pub image_hash: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Epoch milliseconds; 0 means eligible immediately.
    pub next_retry_at: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AiTask {
    pub fn new(emoji_id: Uuid, image_path: impl Into<String>, image_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            emoji_id,
            image_path: image_path.into(),
            image_hash: image_hash.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
}
