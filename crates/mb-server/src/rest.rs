use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use mb_core::{ImageFilter, ImageRecord, MbError};
use mb_engine::catalog::IngestOptions;

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/list", get(list_images))
        .route("/search", get(search_images))
        .route("/categories", get(list_categories).post(add_category))
        .route("/categories/:category", get(random_in_category))
        .route("/categories/:category", delete(delete_category))
        .route("/tags", get(list_tags))
        .route("/tags/:tag", get(random_with_tag))
        .route("/random", get(random_image))
        .route("/get/:key", get(get_image))
        .route("/upload", post(upload))
        .route("/import", post(import_folder))
        .route("/scan", get(scan_folder))
        .route("/images/:id", delete(delete_image).patch(update_image))
        .route("/analyze/:id", post(analyze_image))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/failed", get(list_failed))
        .route("/tasks/retry-failed", post(retry_failed))
        .route("/tasks/reanalyze", post(reanalyze_batch))
        .route("/worker/pause", post(set_paused))
        .route("/worker/config", post(set_runtime_config))
        .route("/config/base-url", get(base_url))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "invalid upload token".into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<MbError> for ApiError {
    fn from(err: MbError) -> Self {
        let status = match &err {
            MbError::Duplicate(_) => StatusCode::CONFLICT,
            MbError::ImageNotFound(_) | MbError::CategoryNotFound(_) => StatusCode::NOT_FOUND,
            MbError::InvalidFormat | MbError::InvalidInput(_) | MbError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "message": self.message })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ImageResponse {
    pub id: String,
    pub name: String,
    pub category: String,
    pub tags: Vec<String>,
    pub size: u64,
    pub mime_type: String,
    pub image_hash: String,
    pub created_at: String,
}

impl From<ImageRecord> for ImageResponse {
    fn from(record: ImageRecord) -> Self {
        Self {
            id: record.id.to_string(),
            name: record.name,
            category: record.category,
            tags: record.tags,
            size: record.size,
            mime_type: record.mime_type,
            image_hash: record.image_hash,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct CategoryResponse {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub emoji_count: u64,
}

impl From<mb_core::Category> for CategoryResponse {
    fn from(category: mb_core::Category) -> Self {
        Self {
            id: category.id.to_string(),
            name: category.name,
            description: category.description,
            emoji_count: category.emoji_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListQuery {
    pub category: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

async fn list_images(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = ImageFilter {
        category: query.category,
        tag: query.tag,
    };
    let images = state
        .catalog
        .list(&filter, query.limit.unwrap_or(100), query.offset.unwrap_or(0))
        .await?;
    let total = state.catalog.count(&filter).await?;
    Ok(Json(json!({
        "success": true,
        "total": total,
        "images": images.into_iter().map(ImageResponse::from).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub keyword: Option<String>,
    pub limit: Option<usize>,
}

async fn search_images(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let keyword = query
        .keyword
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("missing keyword"))?;
    let images = state
        .catalog
        .search(&keyword, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({
        "success": true,
        "images": images.into_iter().map(ImageResponse::from).collect::<Vec<_>>(),
    })))
}

async fn list_categories(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let categories = state.catalog.list_categories().await?;
    Ok(Json(json!({
        "success": true,
        "categories": categories.into_iter().map(CategoryResponse::from).collect::<Vec<_>>(),
    })))
}

async fn list_tags(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let tags = state.catalog.list_tags().await?;
    Ok(Json(json!({ "success": true, "tags": tags })))
}

/// Raw image body with its mime type; axum supplies Content-Length.
async fn serve_image_bytes(
    state: &AppState,
    record: ImageRecord,
) -> Result<Response, ApiError> {
    let bytes = state.catalog.image_bytes(&record).await?;
    Ok(([(header::CONTENT_TYPE, record.mime_type)], bytes).into_response())
}

async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let record = state
        .catalog
        .get_by_id_or_name(&key)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("image not found: {key}")))?;
    serve_image_bytes(&state, record).await
}

async fn random_image(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let record = state
        .catalog
        .random(&ImageFilter::default())
        .await?
        .ok_or_else(|| ApiError::not_found("no images in catalog"))?;
    serve_image_bytes(&state, record).await
}

async fn random_in_category(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
) -> Result<Response, ApiError> {
    let filter = ImageFilter {
        category: Some(category.clone()),
        tag: None,
    };
    let record = state
        .catalog
        .random(&filter)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no images in category: {category}")))?;
    serve_image_bytes(&state, record).await
}

async fn random_with_tag(
    State(state): State<Arc<AppState>>,
    Path(tag): Path<String>,
) -> Result<Response, ApiError> {
    let filter = ImageFilter {
        category: None,
        tag: Some(tag.clone()),
    };
    let record = state
        .catalog
        .random(&filter)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no images with tag: {tag}")))?;
    serve_image_bytes(&state, record).await
}

// ---------------------------------------------------------------------------
// Upload and import
// ---------------------------------------------------------------------------

fn check_upload_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.upload_token.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get("x-upload-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    match provided {
        Some(token) if token == state.upload_token => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    check_upload_token(&state, &headers)?;

    let mut files: Vec<(Option<String>, Vec<u8>)> = Vec::new();
    let mut name: Option<String> = None;
    let mut category: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut ai_analysis = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart parse: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                let file_name = field.file_name().map(String::from);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("read file field: {e}")))?;
                files.push((file_name, bytes.to_vec()));
            }
            "name" => {
                name = Some(read_text_field(field).await?);
            }
            "category" => {
                category = Some(read_text_field(field).await?);
            }
            "tags" => {
                let raw = read_text_field(field).await?;
                tags = serde_json::from_str(&raw)
                    .map_err(|_| ApiError::bad_request("tags must be a JSON string array"))?;
            }
            "aiAnalysis" => {
                ai_analysis = read_text_field(field).await? == "true";
            }
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(ApiError::bad_request("missing file field"));
    }

    // Single file: explicit name wins, then the filename stem.
    if files.len() == 1 {
        let (file_name, bytes) = files.remove(0);
        let name = name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| file_name.as_deref().and_then(file_stem));
        let record = state
            .catalog
            .ingest_from_bytes(
                IngestOptions {
                    name,
                    category,
                    tags,
                },
                bytes,
                ai_analysis,
            )
            .await?;
        return Ok(Json(json!({ "success": true, "image": ImageResponse::from(record) })));
    }

    // Batch: each file is named after its stem; per-file failures are
    // reported, not fatal.
    let mut images = Vec::new();
    let mut failures = Vec::new();
    for (file_name, bytes) in files {
        let options = IngestOptions {
            name: file_name.as_deref().and_then(file_stem),
            category: category.clone(),
            tags: tags.clone(),
        };
        match state
            .catalog
            .ingest_from_bytes(options, bytes, ai_analysis)
            .await
        {
            Ok(record) => images.push(ImageResponse::from(record)),
            Err(e) => failures.push(json!({ "file": file_name, "message": e.to_string() })),
        }
    }
    Ok(Json(json!({
        "success": failures.is_empty(),
        "images": images,
        "failures": failures,
    })))
}

fn file_stem(filename: &str) -> Option<String> {
    filename.rsplit_once('.').map(|(stem, _)| stem.to_string())
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("read field: {e}")))
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub path: String,
    #[serde(default)]
    pub ai_analysis: bool,
}

async fn import_folder(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ImportRequest>,
) -> Result<Json<Value>, ApiError> {
    check_upload_token(&state, &headers)?;
    let summary = state
        .catalog
        .import_folder(std::path::Path::new(&request.path), request.ai_analysis)
        .await?;
    Ok(Json(json!({ "success": true, "summary": summary })))
}

#[derive(Deserialize)]
pub struct ScanQuery {
    pub path: String,
}

async fn scan_folder(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanQuery>,
) -> Result<Json<Value>, ApiError> {
    let files = state
        .catalog
        .scan_folder(std::path::Path::new(&query.path))?;
    Ok(Json(json!({
        "success": true,
        "files": files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
    })))
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

async fn delete_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.catalog.delete_image(id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct UpdateImageRequest {
    pub name: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
}

async fn update_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateImageRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut record = None;
    if let Some(name) = request.name {
        record = Some(state.catalog.update_name(id, name).await?);
    }
    if let Some(category) = request.category {
        record = Some(state.catalog.update_category(id, category).await?);
    }
    if let Some(tags) = request.tags {
        record = Some(state.catalog.update_tags(id, tags).await?);
    }
    let record = match record {
        Some(record) => record,
        None => state
            .catalog
            .get_image(id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("image not found: {id}")))?,
    };
    Ok(Json(json!({ "success": true, "image": ImageResponse::from(record) })))
}

#[derive(Deserialize)]
pub struct AddCategoryRequest {
    pub name: String,
    pub description: Option<String>,
}

async fn add_category(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddCategoryRequest>,
) -> Result<Json<Value>, ApiError> {
    let category = state
        .catalog
        .add_category(request.name, request.description)
        .await?;
    Ok(Json(json!({ "success": true, "category": CategoryResponse::from(category) })))
}

async fn delete_category(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.catalog.delete_category(id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn analyze_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let record = state.catalog.analyze_image(id).await?;
    Ok(Json(json!({ "success": true, "image": ImageResponse::from(record) })))
}

// ---------------------------------------------------------------------------
// Task pipeline operations
// ---------------------------------------------------------------------------

async fn task_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state.queue.stats().await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

async fn list_failed(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let ids = state.queue.list_failed_emoji_ids().await?;
    Ok(Json(json!({
        "success": true,
        "emojiIds": ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
    })))
}

async fn retry_failed(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let count = state.queue.retry_failed().await?;
    Ok(Json(json!({ "success": true, "count": count })))
}

#[derive(Deserialize)]
pub struct ReanalyzeRequest {
    pub ids: Vec<Uuid>,
}

async fn reanalyze_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReanalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    let enqueued = state.catalog.reanalyze_batch(&request.ids).await?;
    Ok(Json(json!({ "success": true, "enqueued": enqueued })))
}

#[derive(Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

async fn set_paused(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PauseRequest>,
) -> Result<Json<Value>, ApiError> {
    state.overrides.set_paused(request.paused);
    tracing::info!(paused = request.paused, "worker pause toggled");
    Ok(Json(json!({ "success": true, "paused": request.paused })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfigRequest {
    pub concurrency: Option<i64>,
    pub batch_delay: Option<i64>,
}

async fn set_runtime_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RuntimeConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(concurrency) = request.concurrency {
        state.overrides.set_concurrency(concurrency);
    }
    if let Some(batch_delay) = request.batch_delay {
        state.overrides.set_batch_delay_ms(batch_delay);
    }
    Ok(Json(json!({ "success": true })))
}

async fn base_url(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "baseUrl": state.base_url }))
}
