//! Build job orchestration.
//!
//! [`BuildJobManager`] owns the single global build slot. It admits at most
//! one job at a time, persists the job record, and spawns one worker per
//! admitted job. Status, listing, cancellation, download resolution, and
//! housekeeping operations are served from the record store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use brandkit_core::brand::BrandCustomization;
use brandkit_core::build_job::{BuildJob, BuildJobFilter, BuildJobPatch, BuildMode, BuildStatus, FailureKind};
use brandkit_core::naming::workspace_key;
use brandkit_core::types::{new_job_id, JobId};
use brandkit_db::JobStore;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationRegistry;
use crate::config::PipelineConfig;
use crate::customize::TemplateCustomizer;
use crate::error::BuildError;
use crate::process::{CommandSpec, ProcessRunner};
use crate::publish::{ArtifactPublisher, DownloadHandle};
use crate::toolchain::{check_prerequisites, environment_report, EnvironmentReport, Toolchain};
use crate::worker::{run_job, PipelineContext};
use crate::workspace::{SweepReport, WorkspaceManager};

/// Distribution tracks accepted by [`BuildJobManager::submit_to_distribution`].
pub const DISTRIBUTION_TRACKS: [&str; 4] = ["internal", "alpha", "beta", "production"];

/// Longest accepted brand id.
const MAX_BRAND_ID_LEN: usize = 128;

/// How often [`BuildJobManager::shutdown`] checks whether the slot emptied.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelDisposition {
    CancellationRequested,
    AlreadyTerminal,
}

/// Acknowledgement of a cancel request. Poll status to see it take effect.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub job_id: JobId,
    pub outcome: CancelDisposition,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionReceipt {
    pub job_id: JobId,
    pub track: String,
    pub output_tail: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheClearReport {
    pub removed_workspaces: usize,
    pub removed_logs: usize,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Entry point of the build pipeline. Cheap to clone.
#[derive(Clone)]
pub struct BuildJobManager {
    ctx: Arc<PipelineContext>,
}

impl BuildJobManager {
    /// Build a manager whose publisher is derived from `config.storage`.
    pub fn new(config: PipelineConfig, store: Arc<dyn JobStore>) -> Self {
        let publisher = ArtifactPublisher::from_config(&config);
        Self::with_publisher(config, store, publisher)
    }

    pub fn with_publisher(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        publisher: ArtifactPublisher,
    ) -> Self {
        let ctx = PipelineContext {
            store,
            slot: Mutex::new(None),
            tokens: CancellationRegistry::new(),
            workspaces: WorkspaceManager::from_config(&config),
            customizer: TemplateCustomizer::new(&config.bundle_prefix, &config.app_version),
            runner: ProcessRunner::new(config.watchdog_interval, config.log_tail_lines),
            toolchain: Toolchain::from_config(&config),
            publisher,
            config,
        };
        Self { ctx: Arc::new(ctx) }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.ctx.store
    }

    /// The job currently holding the build slot, if any.
    pub async fn active_job(&self) -> Option<JobId> {
        *self.ctx.slot.lock().await
    }

    /// Admit a new build and start its worker.
    ///
    /// Input is validated first, then the environment is probed, then the
    /// slot is tested and claimed under one lock: a second submission while
    /// a job is queued or building gets [`BuildError::Conflict`] and creates
    /// no record.
    pub async fn submit(
        &self,
        brand_id: &str,
        brand: BrandCustomization,
    ) -> Result<JobId, BuildError> {
        let brand_id = brand_id.trim();
        if brand_id.is_empty() {
            return Err(BuildError::Validation("brand_id must not be empty".into()));
        }
        if brand_id.chars().count() > MAX_BRAND_ID_LEN {
            return Err(BuildError::Validation(format!(
                "brand_id must be at most {MAX_BRAND_ID_LEN} characters"
            )));
        }
        brand.validate()?;

        // Report a busy slot ahead of missing prerequisites, but probe the
        // environment without holding the lock.
        if let Some(active) = self.active_job().await {
            return Err(BuildError::Conflict { active });
        }
        let missing = check_prerequisites(&self.ctx.config, &self.ctx.toolchain, brand.build_mode).await;
        if !missing.is_empty() {
            tracing::warn!(brand_id, missing = ?missing, "Build rejected: prerequisites missing");
            return Err(BuildError::PrerequisitesMissing(missing));
        }

        let mut slot = self.ctx.slot.lock().await;
        if let Some(active) = *slot {
            return Err(BuildError::Conflict { active });
        }

        let job = BuildJob::queued(new_job_id(), brand_id, brand.build_mode, Utc::now());
        self.ctx.store.insert(&job).await?;
        *slot = Some(job.id);

        let token = self.ctx.tokens.register(job.id);
        tokio::spawn(run_job(
            Arc::clone(&self.ctx),
            job.id,
            job.brand_id.clone(),
            brand,
            token,
        ));

        tracing::info!(job_id = %job.id, brand_id, mode = %job.build_mode, "Build job admitted");
        Ok(job.id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<BuildJob, BuildError> {
        self.ctx
            .store
            .get(job_id)
            .await?
            .ok_or(BuildError::NotFound(job_id))
    }

    /// Newest first, optionally for one brand.
    pub async fn list(&self, brand_id: Option<&str>) -> Result<Vec<BuildJob>, BuildError> {
        let filter = BuildJobFilter {
            brand_id: brand_id.map(str::to_string),
            status: None,
        };
        Ok(self.ctx.store.list(&filter).await?)
    }

    /// Request cancellation. Returns immediately; the worker writes the
    /// terminal status at its next checkpoint or watchdog tick.
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, BuildError> {
        let job = self.status(job_id).await?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome {
                job_id,
                outcome: CancelDisposition::AlreadyTerminal,
                status: job.status,
            });
        }

        if !self.ctx.tokens.cancel(job_id) {
            tracing::warn!(job_id = %job_id, "Cancel requested for a job with no live worker");
        } else {
            tracing::info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(CancelOutcome {
            job_id,
            outcome: CancelDisposition::CancellationRequested,
            status: job.status,
        })
    }

    /// Resolve where a finished artifact can be fetched from.
    pub async fn download(&self, job_id: JobId) -> Result<DownloadHandle, BuildError> {
        let job = self.status(job_id).await?;
        if job.status != BuildStatus::Success {
            return Err(BuildError::NotReady {
                id: job_id,
                status: job.status,
            });
        }

        if let Some(path) = job.artifact_path.as_deref().map(PathBuf::from) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(DownloadHandle::Local(path));
            }
        }
        match ArtifactPublisher::resolve_download_handle(&job) {
            Some(DownloadHandle::Remote(url)) => Ok(DownloadHandle::Remote(url)),
            _ => Err(BuildError::ArtifactMissing(job_id)),
        }
    }

    /// Hand a remote build to a store distribution track.
    pub async fn submit_to_distribution(
        &self,
        job_id: JobId,
        track: &str,
    ) -> Result<DistributionReceipt, BuildError> {
        let track = track.trim().to_ascii_lowercase();
        if !DISTRIBUTION_TRACKS.contains(&track.as_str()) {
            return Err(BuildError::Validation(format!(
                "track must be one of: {}",
                DISTRIBUTION_TRACKS.join(", ")
            )));
        }

        let job = self.status(job_id).await?;
        if job.build_mode != BuildMode::Remote || job.status != BuildStatus::Submitted {
            return Err(BuildError::Validation(
                "Only submitted remote builds can be sent to distribution".into(),
            ));
        }
        let Some(external_id) = job.external_build_id.as_deref() else {
            return Err(BuildError::Validation(
                "Build has no remote build id to submit".into(),
            ));
        };

        let config = &self.ctx.config;
        let invocation = self
            .ctx
            .toolchain
            .remote_submit(&config.template_root, external_id, &track);
        let spec = CommandSpec {
            command: invocation.command,
            cwd: invocation.cwd,
            env: Vec::new(),
            timeout: config.timeouts.remote_submit,
            log_path: config.stage_log_path(&job_id, "submit"),
        };

        tracing::info!(job_id = %job_id, track = %track, "Submitting build to distribution");
        let output = self
            .ctx
            .runner
            .run(&spec, &CancellationToken::new())
            .await
            .map_err(BuildError::Distribution)?;

        let patch = BuildJobPatch {
            log_path: Some(spec.log_path.to_string_lossy().into_owned()),
            ..BuildJobPatch::message(format!("Submitted to {track} track"))
        };
        self.ctx.store.update(job_id, &patch).await?;

        Ok(DistributionReceipt {
            job_id,
            track,
            output_tail: output.tail,
        })
    }

    /// Remove every workspace and stage log not belonging to the active job.
    /// Protected dependency caches are kept.
    pub async fn clear_cache(&self) -> CacheClearReport {
        let active = self.active_job().await;
        let exclude: Vec<String> = active.iter().map(workspace_key).collect();
        let sweep = self.ctx.workspaces.sweep_stale(&exclude, Duration::ZERO).await;

        let mut report = CacheClearReport {
            removed_workspaces: sweep.removed.len(),
            removed_logs: 0,
            errors: sweep.errors,
        };

        let log_dir = &self.ctx.config.log_dir;
        let mut entries = match tokio::fs::read_dir(log_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                report.errors.push(format!("{}: {e}", log_dir.display()));
                return report;
            }
        };
        let active_prefix = active.map(|id| id.to_string());
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_log = name.ends_with(".log");
            let is_active = active_prefix.as_deref().is_some_and(|p| name.starts_with(p));
            if !is_log || is_active {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => report.removed_logs += 1,
                Err(e) => report.errors.push(format!("{name}: {e}")),
            }
        }

        tracing::info!(
            removed_workspaces = report.removed_workspaces,
            removed_logs = report.removed_logs,
            errors = report.errors.len(),
            "Build cache cleared"
        );
        report
    }

    /// Delete failed job records. Cancelled and successful jobs are kept.
    pub async fn purge_failed(&self, brand_id: Option<&str>) -> Result<u64, BuildError> {
        let filter = BuildJobFilter {
            brand_id: brand_id.map(str::to_string),
            status: Some(BuildStatus::Failed),
        };
        let deleted = self.ctx.store.delete(&filter).await?;
        tracing::info!(deleted, brand_id = ?brand_id, "Purged failed builds");
        Ok(deleted)
    }

    /// Mark jobs left queued or building by a previous process as failed.
    /// Call once at startup, before accepting submissions.
    pub async fn recover_interrupted(&self) -> Result<usize, BuildError> {
        let active = self.active_job().await;
        let mut recovered = 0;
        for status in [BuildStatus::Queued, BuildStatus::Building] {
            let filter = BuildJobFilter {
                brand_id: None,
                status: Some(status),
            };
            for job in self.ctx.store.list(&filter).await? {
                if Some(job.id) == active {
                    continue;
                }
                let patch = BuildJobPatch {
                    status: Some(BuildStatus::Failed),
                    message: Some("Interrupted by service restart".into()),
                    error_text: Some("Build was interrupted by a service restart; resubmit to retry".into()),
                    failure_kind: Some(FailureKind::Interrupted),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                };
                self.ctx.store.update(job.id, &patch).await?;
                if let Err(e) = self.ctx.workspaces.destroy_key(&workspace_key(&job.id)).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Workspace teardown failed");
                }
                tracing::warn!(job_id = %job.id, previous_status = %status, "Recovered interrupted build");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub async fn environment(&self) -> EnvironmentReport {
        environment_report(&self.ctx.config, &self.ctx.toolchain).await
    }

    /// Periodic sweep of workspaces older than the retention window.
    pub async fn sweep_stale(&self) -> SweepReport {
        let exclude: Vec<String> = self.active_job().await.iter().map(workspace_key).collect();
        self.ctx
            .workspaces
            .sweep_stale(&exclude, self.ctx.config.workspace_retention)
            .await
    }

    /// Cancel the active job and wait up to `grace` for its worker to
    /// finish. Returns `true` when the slot emptied in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let cancelled = self.ctx.tokens.cancel_all();
        if cancelled > 0 {
            tracing::info!(jobs = cancelled, "Cancelling active builds for shutdown");
        }
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.active_job().await.is_none() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Active build did not finish before shutdown deadline");
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }
}
