//! HTTP surface: the two user-facing operations plus the informational
//! index page and a liveness probe.
//!
//! Every handler follows the same line: guard first (rejections touch
//! nothing), then store/register/describer in order, then a structured JSON
//! response. Failures are converted at this boundary; nothing propagates.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{debug, info};

use crate::{
    auth::AccessGuard,
    describer::{Describer, DEFAULT_QUESTION},
    error::ApiError,
    register::LatestImage,
    store::{ImageStore, IMAGE_EXT},
};

/// Fixed guidance returned when a question arrives before any photo has.
pub const NO_IMAGE_MESSAGE: &str = "我还没有收到任何照片, 请先拍摄一张照片, 我再为你描述周围的环境.";

pub struct AppState {
    pub store: ImageStore,
    pub register: LatestImage,
    pub guard: AccessGuard,
    pub describer: Arc<dyn Describer>,
    pub index_auth_required: bool,
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let images_dir = state.store.dir().to_path_buf();
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/ask", post(ask))
        .nest_service("/uploaded_images", ServeDir::new(images_dir))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct ApiResponse {
    status: &'static str,
    description: String,
}

impl ApiResponse {
    fn ok(description: String) -> Json<Self> {
        Json(Self {
            status: "OK",
            description,
        })
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

/// Upload-and-describe: persist the photo, get a description, then publish
/// it as the latest image. A failed describe leaves the register untouched,
/// so follow-ups keep answering against the last photo that was actually
/// described.
async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse>, ApiError> {
    state.guard.authorize(bearer(&headers))?;
    info!("image received ({} bytes)", body.len());
    let received = std::time::Instant::now();

    let id = state.store.save_image(&body)?;
    let jpeg = state.store.read_image(&id)?;
    let description = state.describer.describe(&jpeg).await?;

    state.register.set(id.clone());
    state.store.save_description(&id, &description)?;

    info!(
        "described {id} in {:.2}s: {description}",
        received.elapsed().as_secs_f64()
    );
    Ok(ApiResponse::ok(description))
}

#[derive(Debug, Deserialize)]
struct AskBody {
    question: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AskParams {
    // Auxiliary client context; accepted but not used to answer.
    location: Option<String>,
    heading: Option<String>,
}

/// Follow-up question against the most recently described image.
async fn ask(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AskParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse>, ApiError> {
    state.guard.authorize(bearer(&headers))?;
    if params.location.is_some() || params.heading.is_some() {
        debug!(?params, "auxiliary context ignored");
    }

    let question = parse_question(&body)?;

    let Some(id) = state.register.get() else {
        info!("question before any upload, asking for a photo first");
        return Ok(ApiResponse::ok(NO_IMAGE_MESSAGE.to_string()));
    };

    let jpeg = state.store.read_image(&id)?;
    let answer = state.describer.follow_up(&jpeg, &question).await?;
    Ok(ApiResponse::ok(answer))
}

fn parse_question(body: &[u8]) -> Result<String, ApiError> {
    if body.is_empty() {
        return Ok(DEFAULT_QUESTION.to_string());
    }
    let parsed: AskBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("malformed ask body: {e}")))?;
    Ok(parsed
        .question
        .filter(|question| !question.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_QUESTION.to_string()))
}

/// Informational page with the most recent photo and its description.
async fn index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Html<String>, ApiError> {
    if state.index_auth_required {
        state.guard.authorize(bearer(&headers))?;
    }

    let latest_image = state.store.latest_image()?;
    let latest_description = state
        .store
        .latest_description()?
        .unwrap_or_else(|| "No description available.".to_string());

    let image_html = match &latest_image {
        Some(id) => format!(
            r#"<img src="/uploaded_images/{id}.{IMAGE_EXT}" alt="latest upload">"#
        ),
        None => "<p>No image uploaded yet.</p>".to_string(),
    };

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html lang="zh">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Scene Describer</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
            max-width: 720px;
            margin: 40px auto;
            padding: 0 20px;
            color: #333;
        }}
        img {{ max-width: 100%; border-radius: 8px; }}
        .description {{
            background: #f8f9ff;
            border-radius: 8px;
            padding: 16px;
            margin-top: 16px;
            line-height: 1.6;
        }}
    </style>
</head>
<body>
    <h1>Scene Describer</h1>
    {image_html}
    <div class="description">{latest_description}</div>
</body>
</html>
"#
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        sync::Mutex,
    };

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct StubDescriber {
        calls: AtomicUsize,
        fail: AtomicBool,
        last_jpeg: Mutex<Option<Vec<u8>>>,
    }

    impl StubDescriber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                last_jpeg: Mutex::new(None),
            })
        }

        fn record(&self, jpeg: &[u8]) -> Result<(), ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_jpeg.lock().unwrap() = Some(jpeg.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                Err(ApiError::Upstream("stub backend down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Describer for StubDescriber {
        async fn describe(&self, jpeg: &[u8]) -> Result<String, ApiError> {
            self.record(jpeg)?;
            Ok("a red square".to_string())
        }

        async fn follow_up(&self, jpeg: &[u8], question: &str) -> Result<String, ApiError> {
            self.record(jpeg)?;
            Ok(format!("answer to: {question}"))
        }
    }

    fn test_state() -> (Arc<AppState>, Arc<StubDescriber>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let stub = StubDescriber::new();
        let state = Arc::new(AppState {
            store,
            register: LatestImage::new(),
            guard: AccessGuard::from_tokens("secret"),
            describer: stub.clone(),
            index_auth_required: false,
        });
        (state, stub, dir)
    }

    fn red_jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(10, 10, image::Rgb([255, 0, 0]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut out),
                image::ImageOutputFormat::Jpeg(85),
            )
            .unwrap();
        out
    }

    fn upload_request(token: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/upload");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn ask_request(token: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/ask");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn files_with_ext(dir: &Path, ext: &str) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
            .collect()
    }

    #[tokio::test]
    async fn upload_then_ask_references_the_same_image() {
        let (state, stub, dir) = test_state();
        let app = router(state.clone(), 1024 * 1024);

        let (status, body) = send(app.clone(), upload_request(Some("secret"), red_jpeg())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["description"], "a red square");

        let images = files_with_ext(dir.path(), "jpg");
        let texts = files_with_ext(dir.path(), "txt");
        assert_eq!(images.len(), 1);
        assert_eq!(texts.len(), 1);
        assert_eq!(
            images[0].file_stem().unwrap(),
            texts[0].file_stem().unwrap()
        );
        assert_eq!(std::fs::read_to_string(&texts[0]).unwrap(), "a red square");

        let uploaded_id = state.register.get().expect("register must be set");
        assert_eq!(
            images[0].file_stem().unwrap().to_str().unwrap(),
            uploaded_id.as_str()
        );

        let (status, body) = send(app, ask_request(Some("secret"), "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], format!("answer to: {DEFAULT_QUESTION}"));

        // The follow-up was answered against the stored bytes of the upload.
        let seen = stub.last_jpeg.lock().unwrap().clone().unwrap();
        assert_eq!(seen, std::fs::read(&images[0]).unwrap());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_payload_writes_nothing() {
        let (state, stub, dir) = test_state();
        let app = router(state, 1024 * 1024);

        let (status, body) = send(
            app,
            upload_request(Some("secret"), b"not an image".to_vec()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "ERROR");
        assert!(files_with_ext(dir.path(), "jpg").is_empty());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bad_tokens_are_rejected_with_zero_side_effects() {
        let (state, stub, dir) = test_state();
        let app = router(state.clone(), 1024 * 1024);

        let (status, _) = send(app.clone(), upload_request(None, red_jpeg())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(app.clone(), upload_request(Some("wrong"), red_jpeg())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(app, ask_request(Some("wrong"), "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert!(files_with_ext(dir.path(), "jpg").is_empty());
        assert_eq!(state.register.get(), None);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_describe_keeps_prior_register_value() {
        let (state, stub, dir) = test_state();
        let app = router(state.clone(), 1024 * 1024);

        let (status, _) = send(app.clone(), upload_request(Some("secret"), red_jpeg())).await;
        assert_eq!(status, StatusCode::OK);
        let first = state.register.get().unwrap();

        stub.fail.store(true, Ordering::SeqCst);
        let (status, body) = send(app, upload_request(Some("secret"), red_jpeg())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["status"], "ERROR");

        // The retry persisted a fresh image under a new id, but no description
        // and no register movement.
        assert_eq!(files_with_ext(dir.path(), "jpg").len(), 2);
        assert_eq!(files_with_ext(dir.path(), "txt").len(), 1);
        assert_eq!(state.register.get(), Some(first));
    }

    #[tokio::test]
    async fn ask_before_any_upload_returns_guidance_without_calling_upstream() {
        let (state, stub, _dir) = test_state();
        let app = router(state, 1024 * 1024);

        let (status, body) = send(app, ask_request(Some("secret"), "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["description"], NO_IMAGE_MESSAGE);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ask_forwards_the_supplied_question() {
        let (state, _stub, _dir) = test_state();
        let app = router(state, 1024 * 1024);

        let (status, _) = send(app.clone(), upload_request(Some("secret"), red_jpeg())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            app,
            ask_request(Some("secret"), r#"{"question":"前面有台阶吗"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], "answer to: 前面有台阶吗");
    }

    #[tokio::test]
    async fn malformed_ask_body_is_a_bad_request() {
        let (state, stub, _dir) = test_state();
        let app = router(state, 1024 * 1024);

        let (status, body) = send(app, ask_request(Some("secret"), "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "ERROR");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_uploads_get_distinct_ids() {
        let (state, _stub, dir) = test_state();
        let app = router(state.clone(), 1024 * 1024);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                let (status, _) = send(app, upload_request(Some("secret"), red_jpeg())).await;
                assert_eq!(status, StatusCode::OK);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let images = files_with_ext(dir.path(), "jpg");
        assert_eq!(images.len(), 8, "no filename collisions");

        let winner = state.register.get().expect("register must end set");
        let stems: Vec<_> = images
            .iter()
            .map(|p| p.file_stem().unwrap().to_str().unwrap().to_string())
            .collect();
        assert!(stems.contains(&winner.as_str().to_string()));
    }

    #[tokio::test]
    async fn index_shows_latest_description() {
        let (state, _stub, _dir) = test_state();
        let app = router(state, 1024 * 1024);

        let (status, _) = send(app.clone(), upload_request(Some("secret"), red_jpeg())).await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("a red square"));
        assert!(html.contains("/uploaded_images/"));
    }

    #[tokio::test]
    async fn index_can_require_auth() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState {
            store: ImageStore::new(dir.path()).unwrap(),
            register: LatestImage::new(),
            guard: AccessGuard::from_tokens("secret"),
            describer: StubDescriber::new(),
            index_auth_required: true,
        });
        let app = router(state, 1024 * 1024);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let (state, _stub, _dir) = test_state();
        let app = router(state, 1024 * 1024);

        let (status, body) = send(
            app,
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
    }
}
