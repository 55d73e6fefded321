//! Build job lifecycle record and its status model.
//!
//! A [`BuildJob`] is created `queued` when a submission is admitted and is
//! then mutated only by the worker that owns it. Status transitions are
//! forward-only; see [`BuildStatus::can_transition_to`]. Record stores
//! refuse any patch that [`BuildStatus::admits`] rejects.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

/// Maximum length of the persisted `error_text` diagnostic, in characters.
pub const MAX_ERROR_TEXT_CHARS: usize = 2_000;

/// Maximum length of a progress message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 200;

/// Lookup id type matching SMALLINT columns in the database.
pub type StatusId = i16;

macro_rules! define_lookup_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in lookup id order.
            pub const ALL: &'static [Self] = &[ $( Self::$variant ),+ ];

            /// Return the database lookup id.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database lookup id, if known.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Stable lowercase name used in API payloads and messages.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }

            /// Parse the lowercase name produced by [`Self::as_str`].
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $( $label => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_lookup_enum! {
    /// Build job status. Ids match the `build_job_statuses` seed rows.
    BuildStatus {
        Queued = 1 => "queued",
        Building = 2 => "building",
        Success = 3 => "success",
        Failed = 4 => "failed",
        Cancelled = 5 => "cancelled",
        /// Remote mode only: handed to the remote provider, no local artifact.
        Submitted = 6 => "submitted",
    }
}

define_lookup_enum! {
    /// Where compilation happens. Ids match the `build_modes` seed rows.
    BuildMode {
        Native = 1 => "native",
        Remote = 2 => "remote",
    }
}

impl Default for BuildMode {
    fn default() -> Self {
        Self::Native
    }
}

impl BuildStatus {
    /// `true` once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Submitted
        )
    }

    /// `true` while the job occupies the build slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Building)
    }

    /// Forward-only transition table.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        match self {
            Queued => matches!(next, Building | Cancelled | Failed),
            Building => matches!(next, Building | Success | Failed | Cancelled | Submitted),
            Success | Failed | Cancelled | Submitted => false,
        }
    }

    /// Whether a patch whose status field is `next` may be applied to a
    /// record currently in this status. Terminal records accept only
    /// patches that leave the status unchanged.
    pub fn admits(self, next: Option<BuildStatus>) -> bool {
        match next {
            None => true,
            Some(next) if self.is_terminal() => next == self,
            Some(next) => self.can_transition_to(next),
        }
    }

    /// Statuses a record may be in for a patch carrying `next` to apply.
    pub fn sources_admitting(next: BuildStatus) -> Vec<BuildStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.admits(Some(next)))
            .collect()
    }
}

/// Classification of a failed job, recorded next to `error_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Workspace,
    Customization,
    DependencyInstall,
    CompileTimeout,
    CompileToolFailure,
    RemoteSubmission,
    Packaging,
    Store,
    Interrupted,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Customization => "customization",
            Self::DependencyInstall => "dependency_install",
            Self::CompileTimeout => "compile_timeout",
            Self::CompileToolFailure => "compile_tool_failure",
            Self::RemoteSubmission => "remote_submission",
            Self::Packaging => "packaging",
            Self::Store => "store",
            Self::Interrupted => "interrupted",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "workspace" => Self::Workspace,
            "customization" => Self::Customization,
            "dependency_install" => Self::DependencyInstall,
            "compile_timeout" => Self::CompileTimeout,
            "compile_tool_failure" => Self::CompileToolFailure,
            "remote_submission" => Self::RemoteSubmission,
            "packaging" => Self::Packaging,
            "store" => Self::Store,
            "interrupted" => Self::Interrupted,
            "internal" => Self::Internal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One build request's lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: JobId,
    pub brand_id: String,
    pub status: BuildStatus,
    pub progress_percent: u8,
    /// Latest human-readable status line.
    pub message: String,
    pub build_mode: BuildMode,
    /// Remote provider build handle, set only in remote mode.
    pub external_build_id: Option<String>,
    /// Published URL or service-local download reference. Set only on success.
    pub artifact_locator: Option<String>,
    /// Durable local copy of the artifact. Never exposed over the API.
    #[serde(skip_serializing, default)]
    pub artifact_path: Option<String>,
    /// Log file of the most recent subprocess stage.
    pub log_path: Option<String>,
    pub error_text: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl BuildJob {
    /// A freshly admitted job.
    pub fn queued(id: JobId, brand_id: impl Into<String>, mode: BuildMode, now: Timestamp) -> Self {
        Self {
            id,
            brand_id: brand_id.into(),
            status: BuildStatus::Queued,
            progress_percent: 0,
            message: "Queued".to_string(),
            build_mode: mode,
            external_build_id: None,
            artifact_locator: None,
            artifact_path: None,
            log_path: None,
            error_text: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply the fields carried by `patch`, leaving the others untouched.
    pub fn apply(&mut self, patch: &BuildJobPatch, now: Timestamp) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress_percent {
            self.progress_percent = progress;
        }
        if let Some(message) = &patch.message {
            self.message.clone_from(message);
        }
        if let Some(external) = &patch.external_build_id {
            self.external_build_id = Some(external.clone());
        }
        if let Some(locator) = &patch.artifact_locator {
            self.artifact_locator = Some(locator.clone());
        }
        if let Some(path) = &patch.artifact_path {
            self.artifact_path = Some(path.clone());
        }
        if let Some(log) = &patch.log_path {
            self.log_path = Some(log.clone());
        }
        if let Some(error) = &patch.error_text {
            self.error_text = Some(error.clone());
        }
        if let Some(kind) = patch.failure_kind {
            self.failure_kind = Some(kind);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        self.updated_at = now;
    }
}

/// Partial update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildJobPatch {
    pub status: Option<BuildStatus>,
    pub progress_percent: Option<u8>,
    pub message: Option<String>,
    pub external_build_id: Option<String>,
    pub artifact_locator: Option<String>,
    pub artifact_path: Option<String>,
    pub log_path: Option<String>,
    pub error_text: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub completed_at: Option<Timestamp>,
}

impl BuildJobPatch {
    /// A progress update while building.
    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self {
            status: Some(BuildStatus::Building),
            progress_percent: Some(percent.min(100)),
            message: Some(truncate_chars(&message.into(), MAX_MESSAGE_CHARS)),
            ..Default::default()
        }
    }

    /// A message-only update that leaves status and progress alone.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(truncate_chars(&message.into(), MAX_MESSAGE_CHARS)),
            ..Default::default()
        }
    }
}

/// Conjunctive filter for list and delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildJobFilter {
    pub brand_id: Option<String>,
    pub status: Option<BuildStatus>,
}

impl BuildJobFilter {
    pub fn brand(brand_id: impl Into<String>) -> Self {
        Self {
            brand_id: Some(brand_id.into()),
            status: None,
        }
    }

    pub fn matches(&self, job: &BuildJob) -> bool {
        self.brand_id.as_deref().map_or(true, |b| b == job.brand_id)
            && self.status.map_or(true, |s| s == job.status)
    }
}

/// Truncate `text` to at most `max` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
