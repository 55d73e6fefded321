//! Shared fixtures for pipeline integration tests.
//!
//! Every external tool is replaced by a `sh -c` override so the tests need
//! no Node, Android SDK, or network.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use brandkit_core::build_job::BuildJob;
use brandkit_core::types::JobId;
use brandkit_db::MemoryJobStore;
use brandkit_pipeline::config::{CommandLine, ToolCommands};
use brandkit_pipeline::{ArtifactPublisher, BuildJobManager, PipelineConfig};
use tempfile::TempDir;

pub const RELEASE_APK: &str = "android/app/build/outputs/apk/release/app-release.apk";

/// Compile step that "builds" an APK containing the customized manifest.
pub fn compile_ok() -> CommandLine {
    sh(&format!(
        "mkdir -p android/app/build/outputs/apk/release && cp app.json {RELEASE_APK}"
    ))
}

pub fn sh(script: &str) -> CommandLine {
    CommandLine::new("sh", ["-c", script])
}

pub fn noop() -> CommandLine {
    sh("true")
}

pub struct Fixture {
    pub root: TempDir,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn workspace_dir(&self, job_id: JobId) -> std::path::PathBuf {
        self.config
            .scratch_dir
            .join(brandkit_core::naming::workspace_key(&job_id))
    }
}

/// A template project plus a config whose tools all succeed quickly.
pub fn fixture() -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let template = root.path().join("template");
    write(
        &template.join("app.json"),
        r#"{"expo": {"name": "Template", "slug": "template", "android": {}}}"#,
    );
    write(&template.join("src/constants/colors.ts"), "export const Colors = {};\n");
    write(&template.join("src/App.tsx"), "export default function App() {}\n");
    write(&template.join("node_modules/left-pad/index.js"), "module.exports = 1;\n");

    let sdk = root.path().join("sdk");
    std::fs::create_dir_all(&sdk).expect("sdk dir");

    let mut config = PipelineConfig::new(
        &template,
        root.path().join("scratch"),
        root.path().join("out"),
    );
    config.toolchain_root = Some(sdk);
    config.watchdog_interval = Duration::from_millis(50);
    config.heartbeat_interval = Duration::from_millis(100);
    config.commands = ToolCommands {
        install: Some(noop()),
        prebuild: Some(noop()),
        compile: Some(compile_ok()),
        remote_build: None,
        remote_submit: None,
    };

    Fixture { root, config }
}

pub fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, contents).expect("write");
}

pub fn manager(config: PipelineConfig) -> (BuildJobManager, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    (BuildJobManager::new(config, store.clone()), store)
}

pub fn manager_with_publisher(
    config: PipelineConfig,
    publisher: ArtifactPublisher,
) -> (BuildJobManager, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    (
        BuildJobManager::with_publisher(config, store.clone(), publisher),
        store,
    )
}

/// Poll until the job is terminal and the slot has been released.
pub async fn wait_terminal(manager: &BuildJobManager, job_id: JobId) -> BuildJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let job = manager.status(job_id).await.expect("status");
        if job.status.is_terminal() && manager.active_job().await != Some(job_id) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not finish: {job:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `pred` holds for the job, returning the matching snapshot.
pub async fn wait_for(
    manager: &BuildJobManager,
    job_id: JobId,
    pred: impl Fn(&BuildJob) -> bool,
) -> BuildJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = manager.status(job_id).await.expect("status");
        if pred(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached for job {job_id}: {job:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
