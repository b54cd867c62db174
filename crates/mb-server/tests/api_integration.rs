//! Full-stack REST API integration tests.
//!
//! Each test wires a real catalog over an in-memory SQLite store and a
//! tempdir blob store, constructs the axum Router, and sends actual HTTP
//! requests via `tower::ServiceExt`. The vision client is scripted.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tower::ServiceExt; // for `.oneshot()`

use mb_core::{Clock, SystemClock, TaskStats, VisionAnalysis};
use mb_engine::catalog::Catalog;
use mb_engine::config::MemoboxConfig;
use mb_engine::tasks::{EnrichmentWorker, TaskQueue, WorkerConfig};
use mb_engine::test_utils::{png_bytes, ScriptedVision};
use mb_server::rest::create_router;
use mb_server::state::AppState;
use mb_storage::{DiskBlobStore, SqliteStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BOUNDARY: &str = "memobox-test-boundary";

struct TestApp {
    router: Router,
    catalog: Arc<Catalog>,
    queue: Arc<TaskQueue>,
    worker: EnrichmentWorker,
    vision: Arc<ScriptedVision>,
    _tmp: TempDir,
}

async fn setup_with(
    vision: ScriptedVision,
    mutate: impl FnOnce(&mut MemoboxConfig),
) -> TestApp {
    let tmp = TempDir::new().expect("tempdir");
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let blobs = Arc::new(DiskBlobStore::new(tmp.path().join("blobs")));
    let vision = Arc::new(vision);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut config = MemoboxConfig::default();
    config.enrichment.ai_batch_delay_ms = 0;
    config.enrichment.ai_backoff_base_ms = 10;
    mutate(&mut config);

    let queue = Arc::new(TaskQueue::new(store.clone(), clock.clone()));
    let catalog = Arc::new(Catalog::new(
        store,
        blobs.clone(),
        vision.clone(),
        clock,
        queue.clone(),
        config.clone(),
    ));
    catalog.initialize().await.expect("catalog init");

    let mut worker_config = WorkerConfig::from_enrichment(&config.enrichment);
    worker_config.idle_poll = Duration::from_millis(20);
    worker_config.busy_poll = Duration::from_millis(20);
    worker_config.settle_poll = Duration::from_millis(10);
    worker_config.error_backoff = Duration::from_millis(50);
    let worker = EnrichmentWorker::new(
        catalog.clone(),
        queue.clone(),
        blobs,
        vision.clone(),
        worker_config,
    );

    let state = Arc::new(AppState {
        catalog: catalog.clone(),
        queue: queue.clone(),
        overrides: worker.overrides(),
        upload_token: config.upload_token.clone(),
        base_url: config.base_url.clone(),
    });

    TestApp {
        router: create_router(state),
        catalog,
        queue,
        worker,
        vision,
        _tmp: tmp,
    }
}

async fn setup(vision: ScriptedVision) -> TestApp {
    setup_with(vision, |_| {}).await
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

/// PNG-sniffable bytes padded to an exact length.
fn png_of_size(len: usize) -> Vec<u8> {
    let mut bytes = png_bytes();
    bytes.resize(len, 0);
    bytes
}

/// Request URIs must be ASCII; encode path/query values the way a browser
/// would. Axum decodes them back before extraction.
fn percent_encode(s: &str) -> String {
    let mut out = String::new();
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

struct MultipartBody(Vec<u8>);

impl MultipartBody {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.0.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    fn file(mut self, filename: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.0.extend_from_slice(bytes);
        self.0.extend_from_slice(b"\r\n");
        self
    }

    fn finish(mut self) -> Vec<u8> {
        self.0
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.0
    }
}

fn upload_request(body: Vec<u8>, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(token) = token {
        builder = builder.header("x-upload-token", token);
    }
    builder.body(Body::from(body)).unwrap()
}

fn json_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Run the worker until the predicate holds (or `timeout_ms` passes), then
/// shut it down gracefully and return the final stats.
async fn run_worker_until(
    app: &TestApp,
    timeout_ms: u64,
    pred: impl Fn(&TaskStats) -> bool,
) -> TaskStats {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = app.worker.clone();
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    let stats = loop {
        let stats = app.queue.stats().await.unwrap();
        if pred(&stats) || std::time::Instant::now() > deadline {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let _ = shutdown_tx.send(());
    handle.await.unwrap();
    stats
}

async fn upload_png(
    app: &TestApp,
    name: &str,
    bytes: Vec<u8>,
    ai_analysis: bool,
) -> (StatusCode, Value) {
    let body = MultipartBody::new()
        .file("upload.png", "image/png", &bytes)
        .text("name", name)
        .text("category", "")
        .text("tags", "[]")
        .text("aiAnalysis", if ai_analysis { "true" } else { "false" })
        .finish();
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(body, None))
        .await
        .unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

// ---------------------------------------------------------------------------
// Ingest + enrichment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_creates_image_and_worker_enriches_it() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;

    let (status, body) = upload_png(&app, "cat", png_of_size(12345), true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["image"]["size"], json!(12345));
    assert_eq!(body["image"]["mime_type"], "image/png");
    assert_eq!(body["image"]["category"], "其他");

    // Enrichment is queued, not inline.
    let stats = app.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);

    let stats = run_worker_until(&app, 2000, |s| s.succeeded == 1).await;
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.pending, 0);

    let id = body["image"]["id"].as_str().unwrap().parse().unwrap();
    let updated = app.catalog.get_image(id).await.unwrap().unwrap();
    assert_eq!(updated.name, "猫咪");
    assert_eq!(updated.category, "可爱");
    assert_eq!(updated.tags, vec!["动物", "猫"]);

    // A cache row exists for the content hash.
    let cached = app
        .catalog
        .cached_result(&updated.image_hash)
        .await
        .unwrap();
    assert!(cached.is_some());
}

#[tokio::test]
async fn duplicate_upload_returns_conflict_with_existing_name() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let bytes = png_of_size(12345);

    let (status, _) = upload_png(&app, "猫咪", bytes.clone(), false).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = upload_png(&app, "anything", bytes, false).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["message"], "表情包已存在: 与现有表情包 猫咪 重复");

    // Still exactly one image row.
    let images = app
        .catalog
        .list(&Default::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(images.len(), 1);
}

#[tokio::test]
async fn cache_hit_at_ingest_applies_without_enqueueing() {
    let app = setup(ScriptedVision::failing("should not be called")).await;

    let bytes = png_of_size(2048);
    let hash = mb_engine::inspect::sha256_hex(&bytes);
    app.catalog
        .put_cached_result(&hash, &cat_analysis())
        .await
        .unwrap();

    let (status, body) = upload_png(&app, "cat", bytes, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["image"]["name"], "猫咪");
    assert_eq!(body["image"]["category"], "可爱");

    let stats = app.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(app.vision.calls(), 0);
}

#[tokio::test]
async fn non_image_upload_is_rejected() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let (status, body) = upload_png(&app, "x", b"definitely not an image".to_vec(), false).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn upload_without_file_field_is_bad_request() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let body = MultipartBody::new().text("name", "cat").finish();
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(body, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Upload token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_token_is_enforced_when_configured() {
    let app = setup_with(ScriptedVision::always(cat_analysis()), |config| {
        config.upload_token = "secret".into();
    })
    .await;

    let make_body = || {
        MultipartBody::new()
            .file("a.png", "image/png", &png_bytes())
            .finish()
    };

    // No token.
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(make_body(), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Wrong token.
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(make_body(), Some("wrong")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Correct token via x-upload-token.
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(make_body(), Some("secret")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Correct token via Authorization: Bearer on fresh content.
    let mut other = png_bytes();
    other.push(7);
    let body = MultipartBody::new()
        .file("b.png", "image/png", &other)
        .finish();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("authorization", "Bearer secret")
        .body(Body::from(body))
        .unwrap();
    let resp = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Image bytes endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_bytes_served_by_id_name_and_random() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let bytes = png_of_size(600);
    let (_, body) = upload_png(&app, "独特的名字", bytes.clone(), false).await;
    let id = body["image"]["id"].as_str().unwrap().to_string();

    for uri in [
        format!("/get/{id}"),
        format!("/get/{}", percent_encode("独特的名字")),
        "/random".to_string(),
    ] {
        let resp = app
            .router
            .clone()
            .oneshot(json_request(Method::GET, &uri, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "uri: {uri}");
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "image/png",
            "uri: {uri}"
        );
        assert_eq!(body_bytes(resp).await, bytes, "uri: {uri}");
    }

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/get/no-such-image", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn category_and_tag_endpoints_serve_member_bytes() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let bytes = png_of_size(500);
    let body = MultipartBody::new()
        .file("a.png", "image/png", &bytes)
        .text("category", "可爱")
        .text("tags", r#"["猫"]"#)
        .finish();
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(body, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::GET,
            &format!("/categories/{}", percent_encode("可爱")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, bytes);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::GET,
            &format!("/tags/{}", percent_encode("猫")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::GET,
            &format!("/categories/{}", percent_encode("空的分类")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Listing, search, metadata updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_search_and_tag_listing() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let body = MultipartBody::new()
        .file("a.png", "image/png", &png_of_size(300))
        .text("name", "开心猫")
        .text("tags", r#"["猫","开心"]"#)
        .finish();
    app.router
        .clone()
        .oneshot(upload_request(body, None))
        .await
        .unwrap();

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/list", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["images"].as_array().unwrap().len(), 1);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::GET,
            &format!("/search?keyword={}", percent_encode("开心")),
            None,
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["images"].as_array().unwrap().len(), 1);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/search", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/tags", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let tags = body["tags"].as_array().unwrap();
    assert!(tags.contains(&json!("猫")));
    assert!(tags.contains(&json!("开心")));
}

#[tokio::test]
async fn update_and_delete_image_flow() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let (_, body) = upload_png(&app, "old", png_of_size(400), false).await;
    let id = body["image"]["id"].as_str().unwrap().to_string();

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::PATCH,
            &format!("/images/{id}"),
            Some(json!({"name": "新名字", "category": "搞笑", "tags": ["a", "b"]})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["image"]["name"], "新名字");
    assert_eq!(body["image"]["category"], "搞笑");
    assert_eq!(body["image"]["tags"], json!(["a", "b"]));

    // Category counts moved with the image.
    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/categories", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let categories = body["categories"].as_array().unwrap();
    let count_of = |name: &str| {
        categories
            .iter()
            .find(|c| c["name"] == name)
            .map(|c| c["emoji_count"].as_u64().unwrap())
            .unwrap()
    };
    assert_eq!(count_of("搞笑"), 1);
    assert_eq!(count_of("其他"), 0);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::DELETE, &format!("/images/{id}"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, &format!("/get/{id}"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn category_create_and_delete() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/categories",
            Some(json!({"name": "新分类", "description": "手动添加"})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let category_id = body["category"]["id"].as_str().unwrap().to_string();

    // Duplicate name rejected.
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/categories",
            Some(json!({"name": "新分类"})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::DELETE,
            &format!("/categories/{category_id}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Task pipeline operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_holds_tasks_and_resume_drains_them() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/worker/pause",
            Some(json!({"paused": true})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    for i in 0..3u8 {
        let mut bytes = png_of_size(200 + i as usize);
        bytes.push(i);
        let (status, _) = upload_png(&app, &format!("img{i}"), bytes, true).await;
        assert_eq!(status, StatusCode::OK);
    }

    // Paused: nothing moves, no model calls.
    let stats = run_worker_until(&app, 150, |_| false).await;
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.processing, 0);
    assert_eq!(app.vision.calls(), 0);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/worker/pause",
            Some(json!({"paused": false})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let stats = run_worker_until(&app, 3000, |s| s.succeeded == 3).await;
    assert_eq!(stats.succeeded, 3);
    assert_eq!(app.vision.calls(), 3);
}

#[tokio::test]
async fn failed_tasks_are_listed_and_retryable() {
    let app = setup_with(ScriptedVision::failing("model down"), |config| {
        config.enrichment.ai_max_attempts = 2;
    })
    .await;

    let (status, body) = upload_png(&app, "unlucky", png_of_size(700), true).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["image"]["id"].as_str().unwrap().to_string();

    let stats = run_worker_until(&app, 3000, |s| s.failed == 1).await;
    assert_eq!(stats.failed, 1);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/tasks/failed", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["emojiIds"], json!([id]));

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::POST, "/tasks/retry-failed", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["count"], json!(1));

    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/tasks/stats", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["stats"]["failed"], json!(0));
    assert_eq!(body["stats"]["pending"], json!(1));
}

#[tokio::test]
async fn reanalyze_batch_enqueues_tasks() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;
    let (_, body) = upload_png(&app, "cat", png_of_size(900), false).await;
    let id = body["image"]["id"].as_str().unwrap().to_string();

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks/reanalyze",
            Some(json!({"ids": [id]})),
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["enqueued"], json!(1));

    // Enqueueing again while the task is still pending is a no-op.
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks/reanalyze",
            Some(json!({"ids": [app.catalog.list(&Default::default(), 1, 0).await.unwrap()[0].id]})),
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["enqueued"], json!(0));
}

#[tokio::test]
async fn runtime_config_endpoint_updates_overrides() {
    let app = setup(ScriptedVision::always(cat_analysis())).await;

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/worker/config",
            Some(json!({"concurrency": 7, "batchDelay": 25})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(app.worker.overrides().effective_concurrency(2), 7);
    assert_eq!(app.worker.overrides().effective_batch_delay_ms(500), 25);

    // Zero and negative fall back to configured defaults.
    app.router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/worker/config",
            Some(json!({"concurrency": 0, "batchDelay": -1})),
        ))
        .await
        .unwrap();
    assert_eq!(app.worker.overrides().effective_concurrency(2), 2);
    assert_eq!(app.worker.overrides().effective_batch_delay_ms(500), 500);
}

#[tokio::test]
async fn base_url_endpoint() {
    let app = setup_with(ScriptedVision::always(cat_analysis()), |config| {
        config.base_url = "https://memo.example".into();
    })
    .await;
    let resp = app
        .router
        .clone()
        .oneshot(json_request(Method::GET, "/config/base-url", None))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["baseUrl"], "https://memo.example");
}
