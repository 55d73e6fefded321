//! Pipeline error taxonomy.
//!
//! [`StageError`] aborts a running job and is recorded on the job record.
//! [`BuildError`] is returned to callers of the manager's control surface.

use brandkit_core::build_job::{truncate_chars, BuildStatus, FailureKind, MAX_ERROR_TEXT_CHARS};
use brandkit_core::error::CoreError;
use brandkit_core::types::JobId;
use brandkit_db::StoreError;

use crate::customize::CustomizationError;
use crate::packaging::PackagingError;
use crate::process::ProcessError;
use crate::workspace::WorkspaceError;

/// A failure inside one pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Customization failed: {0}")]
    Customization(#[from] CustomizationError),

    #[error("Dependency install {0}")]
    DependencyInstall(#[source] ProcessError),

    #[error("Pre-build {0}")]
    Prebuild(#[source] ProcessError),

    #[error("Compile {0}")]
    Compile(#[source] ProcessError),

    #[error("Toolchain unavailable: {0}")]
    Toolchain(String),

    #[error("Remote build submission {0}")]
    RemoteProcess(#[source] ProcessError),

    #[error("Remote build submission failed: {0}")]
    RemoteSubmission(String),

    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Job record update failed: {0}")]
    Store(#[from] StoreError),

    /// Observed at a stage boundary.
    #[error("Cancelled")]
    Cancelled,
}

impl StageError {
    fn process(&self) -> Option<&ProcessError> {
        match self {
            Self::DependencyInstall(e) | Self::Prebuild(e) | Self::Compile(e) | Self::RemoteProcess(e) => {
                Some(e)
            }
            _ => None,
        }
    }

    /// `true` when the job should end `cancelled` rather than `failed`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled) || self.process().is_some_and(ProcessError::is_cancelled)
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Workspace(_) => FailureKind::Workspace,
            Self::Customization(_) => FailureKind::Customization,
            Self::DependencyInstall(_) => FailureKind::DependencyInstall,
            Self::Prebuild(ProcessError::Timeout { .. }) | Self::Compile(ProcessError::Timeout { .. }) => {
                FailureKind::CompileTimeout
            }
            Self::Prebuild(_) | Self::Compile(_) | Self::Toolchain(_) => FailureKind::CompileToolFailure,
            Self::RemoteProcess(_) | Self::RemoteSubmission(_) => FailureKind::RemoteSubmission,
            Self::Packaging(_) => FailureKind::Packaging,
            Self::Store(_) => FailureKind::Store,
            Self::Cancelled => FailureKind::Internal,
        }
    }

    /// Captured tool output, empty for non-process failures.
    pub fn log_tail(&self) -> &[String] {
        match self.process() {
            Some(err) => err.tail(),
            None => &[],
        }
    }

    /// Error message followed by as much of the log tail as fits, keeping
    /// the most recent lines.
    pub fn diagnostic(&self) -> String {
        diagnostic_text(&self.to_string(), self.log_tail())
    }
}

/// Compose `header` and the trailing lines of `tail` within
/// [`MAX_ERROR_TEXT_CHARS`].
pub fn diagnostic_text(header: &str, tail: &[String]) -> String {
    let header = truncate_chars(header, MAX_ERROR_TEXT_CHARS);
    let mut budget = MAX_ERROR_TEXT_CHARS.saturating_sub(header.chars().count());
    let mut kept = Vec::new();
    for line in tail.iter().rev() {
        let cost = line.chars().count() + 1;
        if cost > budget {
            break;
        }
        budget -= cost;
        kept.push(line.as_str());
    }
    if kept.is_empty() {
        return header;
    }
    kept.reverse();
    format!("{header}\n{}", kept.join("\n"))
}

/// Final `error_text`: the diagnostic plus a log reference when one exists.
pub fn error_text(diagnostic: &str, log_path: Option<&str>) -> String {
    let text = truncate_chars(diagnostic, MAX_ERROR_TEXT_CHARS);
    match log_path {
        Some(path) => format!("{text}\nLog: {path}"),
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("A build is already in progress (job {active})")]
    Conflict { active: JobId },

    #[error("Missing build prerequisites: {}", .0.join("; "))]
    PrerequisitesMissing(Vec<String>),

    #[error("{0}")]
    Validation(String),

    #[error("Build job {0} not found")]
    NotFound(JobId),

    #[error("Build {id} is not ready for download (status: {status})")]
    NotReady { id: JobId, status: BuildStatus },

    #[error("Artifact for build {0} is no longer available")]
    ArtifactMissing(JobId),

    #[error("Distribution submission {0}")]
    Distribution(#[source] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl From<BuildError> for CoreError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Conflict { .. } => CoreError::Conflict(err.to_string()),
            BuildError::PrerequisitesMissing(items) => CoreError::PrerequisitesMissing(items),
            BuildError::Validation(msg) => CoreError::Validation(msg),
            BuildError::NotReady { .. } => CoreError::Validation(err.to_string()),
            BuildError::NotFound(id) => CoreError::NotFound {
                entity: "BuildJob",
                id: id.to_string(),
            },
            BuildError::ArtifactMissing(id) => CoreError::NotFound {
                entity: "Artifact",
                id: id.to_string(),
            },
            BuildError::Store(StoreError::NotFound(id)) => CoreError::NotFound {
                entity: "BuildJob",
                id: id.to_string(),
            },
            BuildError::Store(StoreError::Conflict(constraint)) => {
                CoreError::Conflict(format!("A build is already in progress ({constraint})"))
            }
            BuildError::Distribution(_) | BuildError::Store(_) | BuildError::Internal(_) => {
                CoreError::Internal(err.to_string())
            }
        }
    }
}

impl From<CoreError> for BuildError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => BuildError::Validation(msg),
            CoreError::PrerequisitesMissing(items) => BuildError::PrerequisitesMissing(items),
            other => BuildError::Internal(other.to_string()),
        }
    }
}
