//! Brand build pipeline.
//!
//! Turns a shared template project into a branded, compiled app package:
//! provision a workspace, customize the template, install dependencies,
//! compile locally (or submit to a remote builder), store and publish the
//! artifact. [`BuildJobManager`] is the entry point; everything else is a
//! stage component it drives.

pub mod cancel;
pub mod config;
pub mod customize;
pub mod error;
pub mod manager;
pub mod packaging;
pub mod process;
pub mod publish;
pub mod remote;
pub mod toolchain;
mod worker;
pub mod workspace;

pub use config::{ConfigError, PipelineConfig};
pub use error::{BuildError, StageError};
pub use manager::{BuildJobManager, CacheClearReport, CancelDisposition, CancelOutcome, DistributionReceipt};
pub use publish::{ArtifactPublisher, ArtifactStore, DownloadHandle, PublishError};
