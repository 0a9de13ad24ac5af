//! HTTP surface tests, driven through the router without a socket

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{Page, StubRenderer, SMALL_VIEWPORTS, WHITE};
use pagediff::orchestrator::{CompareOptions, ComparisonReport, Orchestrator};
use pagediff::server::{router, COMPARE_FAILED_MESSAGE, MISSING_URLS_MESSAGE};
use pagediff::store::{FsResultStore, MemoryResultStore, ResultStore};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceExt;

const REF: &str = "https://reference.test/";
const TEST: &str = "https://candidate.test/";

fn app(stub: &StubRenderer) -> Router {
    app_with_store(stub, Arc::new(MemoryResultStore::new()), "/screenshots")
}

fn app_with_store(stub: &StubRenderer, store: Arc<dyn ResultStore>, public_prefix: &str) -> Router {
    let options = CompareOptions {
        viewports: SMALL_VIEWPORTS.to_vec(),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(stub.launcher(), store, options);
    router(Arc::new(orchestrator), public_prefix)
}

fn compare_request(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/visual-diff")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn missing_test_url_is_a_bad_request() {
    let stub = StubRenderer::new();
    let body = json!({ "referenceUrl": REF }).to_string();
    let (status, body) = send(app(&stub), compare_request(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "error": MISSING_URLS_MESSAGE }));
    assert_eq!(stub.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreadable_body_is_an_internal_error() {
    for body in ["not json", r#"{"referenceUrl":42,"testUrl":"https://candidate.test/"}"#] {
        let stub = StubRenderer::new();
        let (status, response) = send(app(&stub), compare_request(body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{body}");
        let response: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(response, json!({ "error": COMPARE_FAILED_MESSAGE }));
        assert_eq!(stub.launches.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn unwritable_store_is_an_internal_error() {
    let stub = StubRenderer::new().page(REF, Page::Solid(WHITE)).page(TEST, Page::Solid(WHITE));
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(FsResultStore::new(blocker.path().join("screenshots")));

    let body = json!({ "referenceUrl": REF, "testUrl": TEST }).to_string();
    let (status, body) = send(app_with_store(&stub, store, "/screenshots"), compare_request(body)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "error": COMPARE_FAILED_MESSAGE }));
    assert_eq!(stub.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn root_prefix_serves_the_paths_the_store_returns() {
    let stub = StubRenderer::new().page(REF, Page::Solid(WHITE)).page(TEST, Page::Solid(WHITE));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsResultStore::with_prefix(dir.path(), "/"));
    let app = app_with_store(&stub, store, "/");

    let body = json!({ "referenceUrl": REF, "testUrl": TEST }).to_string();
    let (status, body) = send(app.clone(), compare_request(body)).await;
    assert_eq!(status, StatusCode::OK);
    let report: ComparisonReport = serde_json::from_slice(&body).unwrap();

    let reference = &report.results[0].images.reference;
    assert_eq!(reference, &format!("/{}/desktop-reference.png", report.comparison_id));
    let (status, png) = send(app, Request::builder().uri(reference).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&png[0..8], b"\x89PNG\r\n\x1a\n");
}

#[tokio::test]
async fn render_failure_is_hidden_behind_a_generic_error() {
    let stub = StubRenderer::new().page(REF, Page::Solid(WHITE));
    let body = json!({ "referenceUrl": REF, "testUrl": "https://down.test/" }).to_string();
    let (status, body) = send(app(&stub), compare_request(body)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "error": COMPARE_FAILED_MESSAGE }));
    assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn successful_comparison_returns_report_and_serves_images() {
    let stub = StubRenderer::new()
        .page(REF, Page::Solid(WHITE))
        .page(TEST, Page::Solid([250, 250, 250, 255]));
    let app = app(&stub);

    let body = json!({ "referenceUrl": REF, "testUrl": TEST }).to_string();
    let (status, body) = send(app.clone(), compare_request(body)).await;
    assert_eq!(status, StatusCode::OK);

    let raw: Value = serde_json::from_slice(&body).unwrap();
    assert!(raw["comparisonId"].is_string());
    assert!(raw["results"][0].get("dimensionMismatch").is_none());

    let report: ComparisonReport = serde_json::from_value(raw).unwrap();
    let names: Vec<_> = report.results.iter().map(|r| r.viewport.as_str()).collect();
    assert_eq!(names, ["desktop", "tablet", "mobile"]);
    // Within the default tolerance.
    assert!(report.results.iter().all(|r| r.diff_percentage == "0.00"));

    let diff_path = report.results[0].images.diff.clone();
    let response = app
        .clone()
        .oneshot(Request::builder().uri(&diff_path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let png = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let image = pagediff::codec::decode_png(&png).unwrap();
    assert_eq!(image.dimensions(), (64, 36));

    let missing = format!("/screenshots/{}/desktop-missing.png", report.comparison_id);
    let (status, _) = send(app, Request::builder().uri(&missing).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_responds_ok() {
    let stub = StubRenderer::new();
    let (status, body) = send(
        app(&stub),
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}
