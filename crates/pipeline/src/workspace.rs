//! Ephemeral per-job working directories.
//!
//! Each job gets `{scratch}/{key}/app`, created from scratch even if a
//! crashed worker left a directory with the same key behind. The template
//! project is copied in without build outputs, VCS metadata, or dependency
//! caches. Shared tool caches (`gradle`, `npm-cache`) live beside the
//! workspaces in the same scratch root and are never swept.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::{PathAliasConfig, PipelineConfig};

/// Name of the project directory inside a workspace.
pub const PROJECT_DIR_NAME: &str = "app";

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Template project not found at {0}")]
    TemplateMissing(PathBuf),

    #[error("Workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template copy failed: {0}")]
    Copy(String),

    #[error("Path alias could not be created at {path}: {reason}")]
    Alias { path: PathBuf, reason: String },

    #[error("Workspace task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A provisioned workspace owned by one job.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    key: String,
    root: PathBuf,
    project_dir: PathBuf,
    alias: Option<PathBuf>,
}

impl WorkspaceHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The copied template project.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Directory tools should run in: the alias when one is active.
    pub fn exec_dir(&self) -> PathBuf {
        match &self.alias {
            Some(alias) => alias.join(PROJECT_DIR_NAME),
            None => self.project_dir.clone(),
        }
    }

    pub fn alias(&self) -> Option<&Path> {
        self.alias.as_deref()
    }
}

/// What happened when the path alias was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasOutcome {
    Disabled,
    Created(PathBuf),
    /// Alias failed; the job continues on the full path.
    FellBack(String),
}

/// Outcome of a best-effort sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub kept: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    excludes: Vec<String>,
    protected: Vec<String>,
    alias: PathAliasConfig,
}

impl WorkspaceManager {
    pub fn new(
        root: impl Into<PathBuf>,
        excludes: Vec<String>,
        protected: Vec<String>,
        alias: PathAliasConfig,
    ) -> Self {
        Self {
            root: root.into(),
            excludes,
            protected,
            alias,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.scratch_dir.clone(),
            config.template_excludes.clone(),
            config.protected_dirs.clone(),
            config.path_alias.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Delete anything at `key`, then create an empty project directory.
    pub async fn provision(&self, key: &str) -> Result<WorkspaceHandle, WorkspaceError> {
        let root = self.path_for(key);
        remove_dir_if_present(&root).await?;
        let project_dir = root.join(PROJECT_DIR_NAME);
        tokio::fs::create_dir_all(&project_dir)
            .await
            .map_err(io_err(&project_dir))?;

        tracing::debug!(key, path = %root.display(), "Provisioned workspace");
        Ok(WorkspaceHandle {
            key: key.to_string(),
            root,
            project_dir,
            alias: None,
        })
    }

    /// Copy the template tree into the workspace project directory.
    ///
    /// Returns the number of files copied.
    pub async fn copy_template(
        &self,
        template_root: &Path,
        handle: &WorkspaceHandle,
    ) -> Result<u64, WorkspaceError> {
        if !template_root.is_dir() {
            return Err(WorkspaceError::TemplateMissing(template_root.to_path_buf()));
        }
        let src = template_root.to_path_buf();
        let dst = handle.project_dir.clone();
        let excludes = self.excludes.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst, &excludes))
            .await
            .map_err(|e| WorkspaceError::Task(e.to_string()))?
    }

    /// Create the short-path alias when enabled by configuration.
    pub async fn attach_alias(
        &self,
        handle: &mut WorkspaceHandle,
    ) -> Result<AliasOutcome, WorkspaceError> {
        if !self.alias.enabled {
            return Ok(AliasOutcome::Disabled);
        }
        let alias_path = self.alias.alias_root.join(&handle.key);
        match create_alias(&self.alias.alias_root, &alias_path, &handle.root).await {
            Ok(()) => {
                tracing::info!(
                    alias = %alias_path.display(),
                    target = %handle.root.display(),
                    "Workspace path alias created"
                );
                handle.alias = Some(alias_path.clone());
                Ok(AliasOutcome::Created(alias_path))
            }
            Err(reason) if self.alias.allow_long_paths => {
                tracing::warn!(%reason, "Path alias unavailable, continuing on full path");
                Ok(AliasOutcome::FellBack(reason))
            }
            Err(reason) => Err(WorkspaceError::Alias {
                path: alias_path,
                reason,
            }),
        }
    }

    /// Remove the alias (if any) and the whole workspace. Idempotent.
    pub async fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), WorkspaceError> {
        if let Some(alias) = &handle.alias {
            remove_alias(alias).await;
        }
        remove_dir_if_present(&handle.root).await?;
        tracing::debug!(key = %handle.key, "Destroyed workspace");
        Ok(())
    }

    /// Remove the workspace for `key` when no handle is available.
    pub async fn destroy_key(&self, key: &str) -> Result<(), WorkspaceError> {
        if self.alias.enabled {
            remove_alias(&self.alias.alias_root.join(key)).await;
        }
        remove_dir_if_present(&self.path_for(key)).await
    }

    /// Delete workspace directories older than `max_age`.
    ///
    /// Skips protected cache directories and every key in `exclude_keys`.
    /// Errors are collected, never returned.
    pub async fn sweep_stale(&self, exclude_keys: &[String], max_age: Duration) -> SweepReport {
        let root = self.root.clone();
        let mut skip: Vec<String> = self.protected.clone();
        skip.extend(exclude_keys.iter().cloned());
        let alias_root = self.alias.enabled.then(|| self.alias.alias_root.clone());

        let result = tokio::task::spawn_blocking(move || {
            let mut report = sweep_dir(&root, &skip, max_age);
            if let Some(alias_root) = alias_root {
                prune_dangling_aliases(&alias_root, &mut report);
            }
            report
        })
        .await;

        match result {
            Ok(report) => {
                if !report.removed.is_empty() {
                    tracing::info!(removed = report.removed.len(), "Swept stale workspaces");
                }
                for error in &report.errors {
                    tracing::warn!(%error, "Workspace sweep error");
                }
                report
            }
            Err(e) => SweepReport {
                errors: vec![format!("sweep task failed: {e}")],
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

async fn remove_dir_if_present(path: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn is_excluded(name: &OsStr, excludes: &[String]) -> bool {
    name.to_str()
        .is_some_and(|n| excludes.iter().any(|e| e == n))
}

fn copy_tree(src: &Path, dst: &Path, excludes: &[String]) -> Result<u64, WorkspaceError> {
    let mut copied = 0u64;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e.file_name(), excludes));

    for entry in walker {
        let entry = entry.map_err(|e| WorkspaceError::Copy(format!("Failed to walk template: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WorkspaceError::Copy(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target).map_err(io_err(&target))?;
            copied += 1;
        } else if file_type.is_symlink() {
            // Copy linked files by content; linked directories and dangling
            // links are left out.
            match std::fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => {
                    std::fs::copy(entry.path(), &target).map_err(io_err(&target))?;
                    copied += 1;
                }
                _ => {
                    tracing::debug!(path = %entry.path().display(), "Skipping symlink in template");
                }
            }
        }
    }
    Ok(copied)
}

fn sweep_dir(root: &Path, skip: &[String], max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            report.errors.push(format!("{}: {e}", root.display()));
            return report;
        }
    };
    let now = SystemTime::now();

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_dir() || skip.iter().any(|s| *s == name) {
            report.kept += 1;
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            report.kept += 1;
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => report.removed.push(name),
            Err(e) => report.errors.push(format!("{}: {e}", path.display())),
        }
    }
    report
}

fn prune_dangling_aliases(alias_root: &Path, report: &mut SweepReport) {
    let Ok(entries) = std::fs::read_dir(alias_root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_link = std::fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink());
        if is_link && !path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                report.errors.push(format!("{}: {e}", path.display()));
            }
        }
    }
}

#[cfg(unix)]
async fn create_alias(alias_root: &Path, alias: &Path, target: &Path) -> Result<(), String> {
    tokio::fs::create_dir_all(alias_root)
        .await
        .map_err(|e| format!("cannot create alias root: {e}"))?;
    if tokio::fs::symlink_metadata(alias).await.is_ok() {
        tokio::fs::remove_file(alias)
            .await
            .map_err(|e| format!("cannot replace stale alias: {e}"))?;
    }
    tokio::fs::symlink(target, alias)
        .await
        .map_err(|e| e.to_string())
}

#[cfg(not(unix))]
async fn create_alias(_alias_root: &Path, _alias: &Path, _target: &Path) -> Result<(), String> {
    Err("path aliases are only supported on Unix hosts".to_string())
}

async fn remove_alias(alias: &Path) {
    match tokio::fs::symlink_metadata(alias).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            if let Err(e) = tokio::fs::remove_file(alias).await {
                tracing::warn!(alias = %alias.display(), error = %e, "Failed to remove path alias");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::config::{DEFAULT_TEMPLATE_EXCLUDES, PROTECTED_CACHE_DIRS};

    fn manager(root: &Path, alias: PathAliasConfig) -> WorkspaceManager {
        WorkspaceManager::new(
            root,
            DEFAULT_TEMPLATE_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            PROTECTED_CACHE_DIRS.iter().map(|s| s.to_string()).collect(),
            alias,
        )
    }

    fn no_alias() -> PathAliasConfig {
        PathAliasConfig {
            enabled: false,
            alias_root: PathBuf::from("/nonexistent"),
            allow_long_paths: true,
        }
    }

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, contents).expect("write");
    }

    #[tokio::test]
    async fn provision_wipes_stale_remnants() {
        let scratch = tempfile::tempdir().expect("tempdir");
        write(&scratch.path().join("abcd1234/app/stale.txt"), "old");

        let ws = manager(scratch.path(), no_alias());
        let handle = ws.provision("abcd1234").await.expect("provision");

        assert!(handle.project_dir().is_dir());
        assert!(!handle.project_dir().join("stale.txt").exists());
        assert_eq!(handle.exec_dir(), handle.project_dir());
    }

    #[tokio::test]
    async fn copy_template_skips_excluded_entries_at_any_depth() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let template = tempfile::tempdir().expect("tempdir");
        write(&template.path().join("app.json"), "{}");
        write(&template.path().join("src/constants/colors.ts"), "x");
        write(&template.path().join("node_modules/pkg/index.js"), "x");
        write(&template.path().join(".git/HEAD"), "ref");
        write(&template.path().join("src/build/out.js"), "x");

        let ws = manager(scratch.path(), no_alias());
        let handle = ws.provision("k1").await.expect("provision");
        let copied = ws.copy_template(template.path(), &handle).await.expect("copy");

        let project = handle.project_dir();
        assert_eq!(copied, 2);
        assert!(project.join("app.json").is_file());
        assert!(project.join("src/constants/colors.ts").is_file());
        assert!(!project.join("node_modules").exists());
        assert!(!project.join(".git").exists());
        assert!(!project.join("src/build").exists());
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let ws = manager(scratch.path(), no_alias());
        let handle = ws.provision("k2").await.expect("provision");
        let result = ws.copy_template(&scratch.path().join("nope"), &handle).await;
        assert_matches!(result, Err(WorkspaceError::TemplateMissing(_)));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let ws = manager(scratch.path(), no_alias());
        let handle = ws.provision("k3").await.expect("provision");
        ws.destroy(&handle).await.expect("destroy");
        assert!(!handle.root().exists());
        ws.destroy(&handle).await.expect("second destroy");
    }

    #[tokio::test]
    async fn sweep_skips_protected_and_excluded() {
        let scratch = tempfile::tempdir().expect("tempdir");
        for dir in ["aaaa1111", "bbbb2222", "gradle", "npm-cache"] {
            std::fs::create_dir_all(scratch.path().join(dir)).expect("mkdir");
        }
        let ws = manager(scratch.path(), no_alias());
        let report = ws.sweep_stale(&["bbbb2222".to_string()], Duration::ZERO).await;

        assert_eq!(report.removed, vec!["aaaa1111".to_string()]);
        assert!(report.errors.is_empty());
        assert!(scratch.path().join("bbbb2222").exists());
        assert!(scratch.path().join("gradle").exists());
        assert!(scratch.path().join("npm-cache").exists());
    }

    #[tokio::test]
    async fn sweep_keeps_recent_workspaces() {
        let scratch = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(scratch.path().join("cccc3333")).expect("mkdir");
        let ws = manager(scratch.path(), no_alias());
        let report = ws.sweep_stale(&[], Duration::from_secs(3600)).await;
        assert!(report.removed.is_empty());
        assert!(scratch.path().join("cccc3333").exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_root_is_empty() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let ws = manager(&scratch.path().join("never-created"), no_alias());
        let report = ws.sweep_stale(&[], Duration::ZERO).await;
        assert!(report.removed.is_empty() && report.errors.is_empty());
    }

    #[tokio::test]
    async fn alias_disabled_is_a_no_op() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let ws = manager(scratch.path(), no_alias());
        let mut handle = ws.provision("k4").await.expect("provision");
        assert_eq!(ws.attach_alias(&mut handle).await.expect("alias"), AliasOutcome::Disabled);
        assert!(handle.alias().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn alias_routes_exec_dir_and_is_removed_on_destroy() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let aliases = tempfile::tempdir().expect("tempdir");
        let ws = manager(
            scratch.path(),
            PathAliasConfig {
                enabled: true,
                alias_root: aliases.path().to_path_buf(),
                allow_long_paths: false,
            },
        );
        let mut handle = ws.provision("k5").await.expect("provision");
        let outcome = ws.attach_alias(&mut handle).await.expect("alias");

        let alias = aliases.path().join("k5");
        assert_eq!(outcome, AliasOutcome::Created(alias.clone()));
        assert_eq!(handle.exec_dir(), alias.join(PROJECT_DIR_NAME));
        assert!(handle.exec_dir().is_dir());

        ws.destroy(&handle).await.expect("destroy");
        assert!(std::fs::symlink_metadata(&alias).is_err());
        assert!(!handle.root().exists());
    }

    #[tokio::test]
    async fn alias_failure_respects_long_path_policy() {
        let scratch = tempfile::tempdir().expect("tempdir");
        // A regular file where the alias root should be makes creation fail.
        let blocker = scratch.path().join("blocker");
        std::fs::write(&blocker, "x").expect("write");

        let strict = manager(
            scratch.path(),
            PathAliasConfig {
                enabled: true,
                alias_root: blocker.clone(),
                allow_long_paths: false,
            },
        );
        let mut handle = strict.provision("k6").await.expect("provision");
        assert_matches!(strict.attach_alias(&mut handle).await, Err(WorkspaceError::Alias { .. }));

        let lenient = manager(
            scratch.path(),
            PathAliasConfig {
                enabled: true,
                alias_root: blocker,
                allow_long_paths: true,
            },
        );
        let mut handle = lenient.provision("k7").await.expect("provision");
        assert_matches!(lenient.attach_alias(&mut handle).await, Ok(AliasOutcome::FellBack(_)));
        assert_eq!(handle.exec_dir(), handle.project_dir());
    }
}
