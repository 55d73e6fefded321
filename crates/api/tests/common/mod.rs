//! Shared helpers for API integration tests.
//!
//! The app is built in-process over [`MemoryJobStore`] with every build
//! tool replaced by a `sh -c` override, so no database, Node toolchain, or
//! Android SDK is needed.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use brandkit_api::config::ServerConfig;
use brandkit_api::router::build_app_router;
use brandkit_api::state::AppState;
use brandkit_db::MemoryJobStore;
use brandkit_pipeline::config::{CommandLine, ToolCommands};
use brandkit_pipeline::{ArtifactPublisher, BuildJobManager, PipelineConfig};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        database_url: "postgres://unused".to_string(),
        workspace_sweep_interval_secs: 3600,
    }
}

pub fn sh(script: &str) -> CommandLine {
    CommandLine::new("sh", ["-c", script])
}

/// Compile step that writes a small fake APK where packaging looks first.
pub fn compile_ok() -> CommandLine {
    sh("mkdir -p android/app/build/outputs/apk/release \
        && printf 'fake-apk' > android/app/build/outputs/apk/release/app-release.apk")
}

/// A template project on disk plus a pipeline config pointing at it.
pub struct TestEnv {
    pub root: TempDir,
    pub pipeline: PipelineConfig,
}

impl TestEnv {
    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

pub fn test_env() -> TestEnv {
    let root = tempfile::tempdir().expect("tempdir");
    let template = root.path().join("template");
    write(
        &template.join("app.json"),
        r#"{"expo": {"name": "Template", "slug": "template", "android": {}}}"#,
    );
    write(&template.join("src/constants/colors.ts"), "export const Colors = {};\n");

    let sdk = root.path().join("sdk");
    std::fs::create_dir_all(&sdk).expect("sdk dir");

    let mut pipeline = PipelineConfig::new(
        &template,
        root.path().join("scratch"),
        root.path().join("out"),
    );
    pipeline.toolchain_root = Some(sdk);
    pipeline.watchdog_interval = Duration::from_millis(50);
    pipeline.heartbeat_interval = Duration::from_millis(100);
    pipeline.commands = ToolCommands {
        install: Some(sh("true")),
        prebuild: Some(sh("true")),
        compile: Some(compile_ok()),
        remote_build: None,
        remote_submit: None,
    };

    TestEnv { root, pipeline }
}

pub fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, contents).expect("write");
}

/// Build the full application router with all middleware layers over an
/// in-memory job store.
pub fn build_test_app(pipeline: PipelineConfig) -> Router {
    let manager = BuildJobManager::new(pipeline, Arc::new(MemoryJobStore::new()));
    app_for(manager)
}

pub fn build_test_app_with_publisher(pipeline: PipelineConfig, publisher: ArtifactPublisher) -> Router {
    let manager =
        BuildJobManager::with_publisher(pipeline, Arc::new(MemoryJobStore::new()), publisher);
    app_for(manager)
}

fn app_for(manager: BuildJobManager) -> Router {
    let config = test_config();
    let state = AppState::new(manager, config.clone());
    build_app_router(state, &config)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response")
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response<Body> {
    send(app, Method::POST, uri, Some(body)).await
}

pub async fn delete(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, None).await
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

// ---------------------------------------------------------------------------
// Build helpers
// ---------------------------------------------------------------------------

/// Submit a build and return its job id.
pub async fn submit(app: &Router, body: Value) -> String {
    let response = post_json(app, "/api/v1/builds", body).await;
    assert_eq!(response.status(), 202);
    let json = body_json(response).await;
    json["data"]["job_id"].as_str().expect("job_id").to_string()
}

/// Poll the status endpoint until `pred` holds for the job snapshot.
pub async fn wait_for(app: &Router, job_id: &str, pred: impl Fn(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let json = body_json(get(app, &format!("/api/v1/builds/{job_id}")).await).await;
        let job = json["data"].clone();
        if pred(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached for job {job_id}: {job}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the job is terminal.
pub async fn wait_terminal(app: &Router, job_id: &str) -> Value {
    wait_for(app, job_id, |job| {
        matches!(
            job["status"].as_str(),
            Some("success" | "failed" | "cancelled" | "submitted")
        )
    })
    .await
}
