//! The per-job worker: stage sequence, progress reporting, finalization.
//!
//! One worker task is spawned per admitted job and is the only writer of
//! that job's record. Whatever happens inside the stages (an error, a
//! cancellation, a panic) the worker tears the workspace down, writes
//! exactly one terminal status, and releases the build slot.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use brandkit_core::brand::BrandCustomization;
use brandkit_core::build_job::{
    truncate_chars, BuildJobPatch, BuildMode, BuildStatus, FailureKind, MAX_MESSAGE_CHARS,
};
use brandkit_core::naming::{slugify, workspace_key};
use brandkit_core::types::JobId;
use brandkit_db::{JobStore, StoreError};
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationRegistry;
use crate::config::PipelineConfig;
use crate::customize::{AppIdentity, TemplateCustomizer};
use crate::error::{error_text, StageError};
use crate::packaging::{locate_artifact, store_artifact, ArtifactNaming};
use crate::process::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner};
use crate::publish::ArtifactPublisher;
use crate::remote::parse_build_handle;
use crate::toolchain::{Invocation, Toolchain};
use crate::workspace::{AliasOutcome, WorkspaceError, WorkspaceHandle, WorkspaceManager};

/// Delay before the first retry of a failed terminal status write.
const TERMINAL_WRITE_RETRY: Duration = Duration::from_millis(500);

/// Upper bound on the delay between terminal status write retries.
const TERMINAL_WRITE_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Components shared by the manager and its workers.
pub(crate) struct PipelineContext {
    pub config: PipelineConfig,
    pub store: Arc<dyn JobStore>,
    /// The single global build slot: the id of the admitted, unfinished job.
    pub slot: Mutex<Option<JobId>>,
    pub tokens: CancellationRegistry,
    pub workspaces: WorkspaceManager,
    pub customizer: TemplateCustomizer,
    pub runner: ProcessRunner,
    pub toolchain: Toolchain,
    pub publisher: ArtifactPublisher,
}

/// How a job ended.
#[derive(Debug)]
enum Completion {
    Success {
        locator: String,
        artifact_path: String,
    },
    Submitted {
        external_build_id: String,
        url: Option<String>,
    },
    Failed {
        kind: FailureKind,
        diagnostic: String,
    },
    Cancelled,
}

impl Completion {
    fn from_stage_error(err: StageError) -> Self {
        if err.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Failed {
            kind: err.failure_kind(),
            diagnostic: err.diagnostic(),
        }
    }

    fn status(&self) -> BuildStatus {
        match self {
            Self::Success { .. } => BuildStatus::Success,
            Self::Submitted { .. } => BuildStatus::Submitted,
            Self::Failed { .. } => BuildStatus::Failed,
            Self::Cancelled => BuildStatus::Cancelled,
        }
    }

    fn into_patch(self, last_log: Option<&str>) -> BuildJobPatch {
        let now = Utc::now();
        let status = Some(self.status());
        match self {
            Self::Success {
                locator,
                artifact_path,
            } => BuildJobPatch {
                status,
                progress_percent: Some(100),
                message: Some("Build completed".into()),
                artifact_locator: Some(locator),
                artifact_path: Some(artifact_path),
                completed_at: Some(now),
                ..Default::default()
            },
            Self::Submitted {
                external_build_id,
                url,
            } => BuildJobPatch {
                status,
                progress_percent: Some(100),
                message: Some(match url {
                    Some(url) => format!("Submitted to remote build provider: {url}"),
                    None => "Submitted to remote build provider".into(),
                }),
                external_build_id: Some(external_build_id),
                completed_at: Some(now),
                ..Default::default()
            },
            Self::Failed { kind, diagnostic } => {
                let headline = diagnostic.lines().next().unwrap_or("Build failed");
                BuildJobPatch {
                    status,
                    message: Some(truncate_chars(headline, MAX_MESSAGE_CHARS)),
                    error_text: Some(error_text(&diagnostic, last_log)),
                    failure_kind: Some(kind),
                    completed_at: Some(now),
                    ..Default::default()
                }
            }
            Self::Cancelled => BuildJobPatch {
                status,
                message: Some("Build cancelled".into()),
                completed_at: Some(now),
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Writes progress updates, never letting the percentage go backwards.
struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    last: u8,
}

impl ProgressReporter {
    async fn report(&mut self, percent: u8, message: impl Into<String>) -> Result<(), StoreError> {
        let percent = percent.clamp(self.last, 100);
        self.last = percent;
        let patch = BuildJobPatch::progress(percent, message);
        self.store.update(self.job_id, &patch).await?;
        tracing::debug!(
            job_id = %self.job_id,
            progress = percent,
            message = patch.message.as_deref().unwrap_or_default(),
            "Progress"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Where the project lives and where tools run from (the short alias when
/// one is attached).
struct ProjectDirs {
    project: PathBuf,
    exec: PathBuf,
}

/// State of one job while its stages run.
struct JobRun {
    ctx: Arc<PipelineContext>,
    job_id: JobId,
    brand_id: String,
    brand: BrandCustomization,
    token: CancellationToken,
    reporter: ProgressReporter,
    workspace: Option<WorkspaceHandle>,
    last_log: Option<String>,
}

/// Entry point of the spawned worker task.
pub(crate) async fn run_job(
    ctx: Arc<PipelineContext>,
    job_id: JobId,
    brand_id: String,
    brand: BrandCustomization,
    token: CancellationToken,
) {
    let mode = brand.build_mode;
    let mut run = JobRun {
        reporter: ProgressReporter {
            store: Arc::clone(&ctx.store),
            job_id,
            last: 0,
        },
        ctx: Arc::clone(&ctx),
        job_id,
        brand_id,
        brand,
        token,
        workspace: None,
        last_log: None,
    };

    tracing::info!(job_id = %job_id, brand_id = %run.brand_id, mode = %mode, "Build worker started");

    let completion = match AssertUnwindSafe(run.execute()).catch_unwind().await {
        Ok(Ok(completion)) => completion,
        Ok(Err(err)) => {
            if !err.is_cancelled() {
                tracing::error!(job_id = %job_id, kind = %err.failure_kind(), error = %err, "Build failed");
            }
            Completion::from_stage_error(err)
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(job_id = %job_id, panic = %reason, "Build worker panicked");
            Completion::Failed {
                kind: FailureKind::Internal,
                diagnostic: format!("Internal error: worker panicked: {reason}"),
            }
        }
    };

    finalize(&ctx, job_id, run.workspace.take(), run.last_log.take(), completion).await;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Teardown, terminal status, slot release, token removal. In that order,
/// so a caller who observes the terminal status can submit immediately.
///
/// The slot stays claimed until the terminal status is persisted; a failed
/// write is retried with backoff for as long as the store keeps failing.
async fn finalize(
    ctx: &PipelineContext,
    job_id: JobId,
    workspace: Option<WorkspaceHandle>,
    last_log: Option<String>,
    completion: Completion,
) {
    let teardown = match &workspace {
        Some(handle) => ctx.workspaces.destroy(handle).await,
        None => ctx.workspaces.destroy_key(&workspace_key(&job_id)).await,
    };
    if let Err(e) = teardown {
        tracing::warn!(job_id = %job_id, error = %e, "Workspace teardown failed");
    }

    let status = completion.status();
    let patch = completion.into_patch(last_log.as_deref());
    let mut delay = TERMINAL_WRITE_RETRY;
    let mut attempts = 1u32;
    while let Err(e) = settle(ctx, job_id, &patch).await {
        tracing::warn!(
            job_id = %job_id,
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %e,
            "Terminal status write failed, retrying"
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(TERMINAL_WRITE_MAX_BACKOFF);
        attempts += 1;
    }
    ctx.tokens.remove(job_id);

    tracing::info!(job_id = %job_id, status = %status, attempts, "Build finished");
}

/// Write the terminal patch and release the slot under one lock.
///
/// Only database errors are returned for retry. A record the store no
/// longer holds, or one already terminal, releases the slot as is.
async fn settle(ctx: &PipelineContext, job_id: JobId, patch: &BuildJobPatch) -> Result<(), StoreError> {
    let mut slot = ctx.slot.lock().await;
    match ctx.store.update(job_id, patch).await {
        Ok(_) => {}
        Err(e @ StoreError::Database(_)) => return Err(e),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Terminal status refused by store");
        }
    }
    if *slot == Some(job_id) {
        *slot = None;
    }
    Ok(())
}

impl JobRun {
    fn checkpoint(&self) -> Result<(), StageError> {
        if self.token.is_cancelled() {
            tracing::info!(job_id = %self.job_id, "Cancellation observed at stage boundary");
            return Err(StageError::Cancelled);
        }
        Ok(())
    }

    /// Checkpoint, then report the stage start.
    async fn enter(&mut self, percent: u8, stage: &str, message: &str) -> Result<(), StageError> {
        self.checkpoint()?;
        tracing::info!(job_id = %self.job_id, stage, "Stage started");
        self.reporter.report(percent, message).await?;
        Ok(())
    }

    async fn execute(&mut self) -> Result<Completion, StageError> {
        // A job cancelled while still queued ends here with no stage run.
        self.checkpoint()?;

        self.enter(5, "preflight", "Cleaning up stale workspaces").await?;
        self.ctx
            .workspaces
            .sweep_stale(&[], self.ctx.config.workspace_retention)
            .await;

        let dirs = self.provision().await?;
        let identity = self.customize(&dirs.project).await?;

        self.enter(50, "dependencies", "Installing dependencies").await?;
        let install = self.ctx.toolchain.install(&dirs.exec);
        let timeout = self.ctx.config.timeouts.install;
        self.run_tool("install", install, timeout, StageError::DependencyInstall)
            .await?;

        match self.brand.build_mode {
            BuildMode::Remote => self.remote_build(&dirs.exec).await,
            BuildMode::Native => self.native_build(&dirs, &identity).await,
        }
    }

    async fn provision(&mut self) -> Result<ProjectDirs, StageError> {
        self.enter(10, "provision", "Preparing workspace").await?;
        let ctx = Arc::clone(&self.ctx);
        let key = workspace_key(&self.job_id);
        let handle = self.workspace.insert(ctx.workspaces.provision(&key).await?);
        let copied = ctx
            .workspaces
            .copy_template(&ctx.config.template_root, handle)
            .await?;
        tracing::info!(job_id = %self.job_id, files = copied, "Template copied");

        if ctx.config.path_alias.enabled {
            let outcome = match self.workspace.as_mut() {
                Some(handle) => ctx.workspaces.attach_alias(handle).await?,
                None => AliasOutcome::Disabled,
            };
            match outcome {
                AliasOutcome::Created(alias) => {
                    self.reporter
                        .report(12, format!("Using short path {}", alias.display()))
                        .await?;
                }
                AliasOutcome::FellBack(reason) => {
                    self.reporter
                        .report(12, format!("Short path unavailable, using full path: {reason}"))
                        .await?;
                }
                AliasOutcome::Disabled => {}
            }
        }

        let handle = self.workspace.as_ref().ok_or(WorkspaceError::Task(
            "workspace handle lost after provisioning".into(),
        ))?;
        Ok(ProjectDirs {
            project: handle.project_dir().to_path_buf(),
            exec: handle.exec_dir(),
        })
    }

    async fn customize(&mut self, project: &Path) -> Result<AppIdentity, StageError> {
        let ctx = Arc::clone(&self.ctx);

        self.enter(20, "manifest", "Configuring app manifest").await?;
        let identity = ctx
            .customizer
            .rewrite_manifest(project, &self.brand_id, &self.brand)
            .await?;

        self.enter(30, "icon", "Writing app icon").await?;
        ctx.customizer.write_icon(project, &self.brand).await?;

        self.enter(40, "theme", "Applying theme colors").await?;
        ctx.customizer.write_theme(project, &self.brand).await?;

        self.enter(45, "brand", "Writing brand identity").await?;
        ctx.customizer
            .write_brand_identity(project, &self.brand_id, &self.brand)
            .await?;

        tracing::info!(
            job_id = %self.job_id,
            package_id = %identity.package_id,
            "Template customized"
        );
        Ok(identity)
    }

    async fn remote_build(&mut self, exec_dir: &Path) -> Result<Completion, StageError> {
        self.enter(60, "remote_build", "Submitting to remote build provider").await?;
        let invocation = self.ctx.toolchain.remote_build(exec_dir);
        let timeout = self.ctx.config.timeouts.remote_build;
        let output = self
            .run_tool("remote-build", invocation, timeout, StageError::RemoteProcess)
            .await?;

        let handle = parse_build_handle(&output.tail).ok_or_else(|| {
            StageError::RemoteSubmission("provider output did not include a build id".into())
        })?;
        tracing::info!(job_id = %self.job_id, external_build_id = %handle.id, "Remote build submitted");
        Ok(Completion::Submitted {
            external_build_id: handle.id,
            url: handle.url,
        })
    }

    async fn native_build(
        &mut self,
        dirs: &ProjectDirs,
        identity: &AppIdentity,
    ) -> Result<Completion, StageError> {
        let ctx = Arc::clone(&self.ctx);
        let exec_dir = &dirs.exec;

        self.enter(65, "prebuild", "Generating native project").await?;
        let prebuild = ctx.toolchain.prebuild(exec_dir);
        self.run_tool("prebuild", prebuild, ctx.config.timeouts.prebuild, StageError::Prebuild)
            .await?;

        self.checkpoint()?;
        if let Some(reason) = ctx.toolchain.missing_sdk() {
            return Err(StageError::Toolchain(reason));
        }
        ctx.toolchain
            .prepare_compile(exec_dir)
            .await
            .map_err(|e| StageError::Toolchain(format!("cannot prepare build wrapper: {e}")))?;
        self.enter(70, "compile", "Compiling release build").await?;
        let compile = ctx.toolchain.compile(exec_dir);
        self.compile_with_heartbeat(compile).await?;

        self.enter(85, "packaging", "Packaging artifact").await?;
        let built = locate_artifact(&dirs.project, &ctx.config.artifact_candidates).await?;
        let brand_slug = slugify(&identity.display_name);
        let naming = ArtifactNaming {
            brand_id: &self.brand_id,
            brand_slug: &brand_slug,
            version: &ctx.config.app_version,
            at: Utc::now(),
        };
        let stored = store_artifact(&built, &ctx.config.output_dir, &naming).await?;
        tracing::info!(
            job_id = %self.job_id,
            path = %stored.path.display(),
            bytes = stored.size_bytes,
            "Artifact stored"
        );

        if let Err(e) = self.enter(90, "publish", "Publishing artifact").await {
            if let Err(remove) = tokio::fs::remove_file(&stored.path).await {
                tracing::warn!(
                    job_id = %self.job_id,
                    path = %stored.path.display(),
                    error = %remove,
                    "Failed to remove stored artifact of cancelled build"
                );
            }
            return Err(e);
        }
        let locator = self.publish(&stored.path, &stored.object_key).await;

        self.reporter.report(95, "Finalizing").await?;
        Ok(Completion::Success {
            locator,
            artifact_path: stored.path.to_string_lossy().into_owned(),
        })
    }

    /// Upload when enabled. Never fails: any error degrades to the local
    /// download reference.
    async fn publish(&self, path: &Path, key: &str) -> String {
        let publisher = &self.ctx.publisher;
        let local = publisher.local_reference(self.job_id);
        if self.brand.local_only || !publisher.is_enabled() {
            tracing::info!(job_id = %self.job_id, "Publishing skipped, serving locally");
            return local;
        }
        match publisher.publish(path, key).await {
            Ok(url) => {
                tracing::info!(job_id = %self.job_id, url = %url, "Artifact published");
                url
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Publish failed, serving locally");
                local
            }
        }
    }

    /// Run the compiler, reporting the latest output line on a fixed
    /// heartbeat while it runs.
    async fn compile_with_heartbeat(&mut self, invocation: Invocation) -> Result<(), StageError> {
        let ctx = Arc::clone(&self.ctx);
        let token = self.token.clone();
        let spec = self.command_spec("compile", invocation, ctx.config.timeouts.compile);
        self.record_log(&spec).await?;

        let (line_tx, mut line_rx) = watch::channel(String::new());
        let run = ctx.runner.run_observed(&spec, &token, Some(line_tx));
        tokio::pin!(run);

        let period = ctx.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = heartbeat.tick() => {
                    let line = line_rx.borrow_and_update().trim().to_string();
                    let message = if line.is_empty() {
                        "Compiling".to_string()
                    } else {
                        format!("Compiling: {line}")
                    };
                    // Keep the watchdog polled while the store write is pending.
                    let write = self.reporter.report(75, message);
                    tokio::select! {
                        result = &mut run => break result,
                        written = write => {
                            if let Err(e) = written {
                                tracing::warn!(job_id = %self.job_id, error = %e, "Heartbeat update failed");
                            }
                        }
                    }
                }
            }
        };

        let output = result.map_err(StageError::Compile)?;
        tracing::info!(
            job_id = %self.job_id,
            stage = "compile",
            elapsed_secs = output.duration.as_secs(),
            "Stage completed"
        );
        Ok(())
    }

    fn command_spec(&self, stage: &str, invocation: Invocation, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: invocation.command,
            cwd: invocation.cwd,
            env: self.ctx.toolchain.compile_env(&self.ctx.config),
            timeout,
            log_path: self.ctx.config.stage_log_path(&self.job_id, stage),
        }
    }

    /// Remember and persist the log of the stage about to run.
    async fn record_log(&mut self, spec: &CommandSpec) -> Result<(), StageError> {
        let log = spec.log_path.to_string_lossy().into_owned();
        self.last_log = Some(log.clone());
        let patch = BuildJobPatch {
            log_path: Some(log),
            ..Default::default()
        };
        self.ctx.store.update(self.job_id, &patch).await?;
        Ok(())
    }

    /// Run one supervised tool, wrapping its failure in the stage's error.
    async fn run_tool(
        &mut self,
        stage: &str,
        invocation: Invocation,
        timeout: Duration,
        stage_error: fn(ProcessError) -> StageError,
    ) -> Result<ProcessOutput, StageError> {
        let spec = self.command_spec(stage, invocation, timeout);
        self.record_log(&spec).await?;
        let output = self
            .ctx
            .runner
            .run(&spec, &self.token)
            .await
            .map_err(stage_error)?;
        tracing::info!(
            job_id = %self.job_id,
            stage,
            elapsed_secs = output.duration.as_secs(),
            "Stage completed"
        );
        Ok(output)
    }
}
