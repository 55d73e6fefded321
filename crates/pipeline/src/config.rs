//! Pipeline configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Cache directories under the scratch root that sweeps never delete.
pub const PROTECTED_CACHE_DIRS: [&str; 2] = ["gradle", "npm-cache"];

/// Template entries never copied into a workspace, matched at any depth.
pub const DEFAULT_TEMPLATE_EXCLUDES: [&str; 16] = [
    "node_modules",
    ".git",
    ".expo",
    ".expo-shared",
    ".metro-cache",
    ".cache",
    "dist",
    "build",
    "android",
    "ios",
    "coverage",
    "tmp",
    "logs",
    "test_reports",
    "test_results",
    "memory",
];

/// Where the compiled artifact may appear, relative to the project root.
///
/// Files are checked directly; directories are searched for the first file
/// with an `.apk` or `.aab` extension.
pub const DEFAULT_ARTIFACT_CANDIDATES: [&str; 3] = [
    "android/app/build/outputs/apk/release/app-release.apk",
    "android/app/build/outputs/apk/release",
    "android/app/build/outputs/bundle/release",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// An external command as a program plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split on whitespace. Returns `None` for a blank string.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    /// Replace `{name}` placeholders in the arguments.
    pub fn substitute(&self, vars: &[(&str, &str)]) -> Self {
        let args = self
            .args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), value)
                })
            })
            .collect();
        Self {
            program: self.program.clone(),
            args,
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Explicit command overrides. `None` means "detect from the project".
#[derive(Debug, Clone, Default)]
pub struct ToolCommands {
    pub install: Option<CommandLine>,
    pub prebuild: Option<CommandLine>,
    pub compile: Option<CommandLine>,
    pub remote_build: Option<CommandLine>,
    pub remote_submit: Option<CommandLine>,
}

/// Hard limits for each subprocess stage.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub install: Duration,
    pub prebuild: Duration,
    pub compile: Duration,
    pub remote_build: Duration,
    pub remote_submit: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            install: Duration::from_secs(600),
            prebuild: Duration::from_secs(300),
            compile: Duration::from_secs(1200),
            remote_build: Duration::from_secs(300),
            remote_submit: Duration::from_secs(300),
        }
    }
}

/// Short-path alias for hosts with path-length limits. Off by default: some
/// compilers assume every input shares one filesystem root and break when
/// the project is reached through an alias.
#[derive(Debug, Clone)]
pub struct PathAliasConfig {
    pub enabled: bool,
    pub alias_root: PathBuf,
    /// Continue on the full path when the alias cannot be created.
    pub allow_long_paths: bool,
}

/// Remote object store receiving published artifacts.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub key: String,
    pub bucket: String,
}

/// Everything the build pipeline needs to know about its host.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub template_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Native SDK root, exported to the compiler as `ANDROID_HOME`.
    pub toolchain_root: Option<PathBuf>,
    pub protected_dirs: Vec<String>,
    pub template_excludes: Vec<String>,
    pub artifact_candidates: Vec<PathBuf>,
    pub path_alias: PathAliasConfig,
    pub timeouts: StageTimeouts,
    pub watchdog_interval: Duration,
    pub heartbeat_interval: Duration,
    pub workspace_retention: Duration,
    pub log_tail_lines: usize,
    pub app_version: String,
    pub bundle_prefix: String,
    pub commands: ToolCommands,
    /// Prefix of the service-local download reference.
    pub download_base: String,
    /// Publishing is skipped entirely when unset.
    pub storage: Option<StorageConfig>,
}

impl PipelineConfig {
    /// Defaults rooted at the given directories. Used directly by tests.
    pub fn new(
        template_root: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let output_dir = output_dir.into();
        Self {
            template_root: template_root.into(),
            scratch_dir: scratch_dir.into(),
            log_dir: output_dir.join("logs"),
            output_dir,
            toolchain_root: None,
            protected_dirs: PROTECTED_CACHE_DIRS.iter().map(|s| s.to_string()).collect(),
            template_excludes: DEFAULT_TEMPLATE_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            artifact_candidates: DEFAULT_ARTIFACT_CANDIDATES.iter().map(PathBuf::from).collect(),
            path_alias: PathAliasConfig {
                enabled: false,
                alias_root: std::env::temp_dir().join("bk"),
                allow_long_paths: true,
            },
            timeouts: StageTimeouts::default(),
            watchdog_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(20),
            workspace_retention: Duration::from_secs(6 * 3600),
            log_tail_lines: 50,
            app_version: "1.0.0".to_string(),
            bundle_prefix: "com.brandkit".to_string(),
            commands: ToolCommands::default(),
            download_base: "/api/v1/builds".to_string(),
            storage: None,
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                              | Default                        |
    /// |--------------------------------------|--------------------------------|
    /// | `BRANDKIT_TEMPLATE_ROOT`             | `./template`                   |
    /// | `BRANDKIT_SCRATCH_DIR`               | `{tmp}/brandkit-builds`        |
    /// | `BRANDKIT_OUTPUT_DIR`                | `./builds`                     |
    /// | `BRANDKIT_LOG_DIR`                   | `{output}/logs`                |
    /// | `ANDROID_HOME` / `ANDROID_SDK_ROOT`  | unset                          |
    /// | `BRANDKIT_INSTALL_TIMEOUT_SECS`      | `600`                          |
    /// | `BRANDKIT_PREBUILD_TIMEOUT_SECS`     | `300`                          |
    /// | `BRANDKIT_COMPILE_TIMEOUT_SECS`      | `1200`                         |
    /// | `BRANDKIT_REMOTE_TIMEOUT_SECS`       | `300`                          |
    /// | `BRANDKIT_SUBMIT_TIMEOUT_SECS`       | `300`                          |
    /// | `BRANDKIT_WATCHDOG_INTERVAL_MS`      | `500`                          |
    /// | `BRANDKIT_HEARTBEAT_SECS`            | `20`                           |
    /// | `BRANDKIT_WORKSPACE_RETENTION_HOURS` | `6`                            |
    /// | `BRANDKIT_LOG_TAIL_LINES`            | `50`                           |
    /// | `BRANDKIT_APP_VERSION`               | `1.0.0`                        |
    /// | `BRANDKIT_BUNDLE_PREFIX`             | `com.brandkit`                 |
    /// | `BRANDKIT_PATH_ALIAS`                | `false`                        |
    /// | `BRANDKIT_PATH_ALIAS_ROOT`           | `{tmp}/bk`                     |
    /// | `BRANDKIT_ALLOW_LONG_PATHS`          | `true`                         |
    /// | `BRANDKIT_{INSTALL,PREBUILD,COMPILE,REMOTE_BUILD,REMOTE_SUBMIT}_CMD` | detected |
    /// | `BRANDKIT_DOWNLOAD_BASE`             | `/api/v1/builds`               |
    /// | `BRANDKIT_STORAGE_URL`               | unset (publishing disabled)    |
    /// | `BRANDKIT_STORAGE_KEY`               | empty                          |
    /// | `BRANDKIT_STORAGE_BUCKET`            | `builds`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        let output_dir = PathBuf::from(env_string("BRANDKIT_OUTPUT_DIR", "./builds"));
        let mut config = Self::new(
            env_string("BRANDKIT_TEMPLATE_ROOT", "./template"),
            std::env::var("BRANDKIT_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("brandkit-builds")),
            output_dir,
        );

        if let Ok(dir) = std::env::var("BRANDKIT_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        config.toolchain_root = std::env::var("ANDROID_HOME")
            .or_else(|_| std::env::var("ANDROID_SDK_ROOT"))
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        config.timeouts = StageTimeouts {
            install: secs("BRANDKIT_INSTALL_TIMEOUT_SECS", 600)?,
            prebuild: secs("BRANDKIT_PREBUILD_TIMEOUT_SECS", 300)?,
            compile: secs("BRANDKIT_COMPILE_TIMEOUT_SECS", 1200)?,
            remote_build: secs("BRANDKIT_REMOTE_TIMEOUT_SECS", 300)?,
            remote_submit: secs("BRANDKIT_SUBMIT_TIMEOUT_SECS", 300)?,
        };
        config.watchdog_interval =
            Duration::from_millis(env_parse("BRANDKIT_WATCHDOG_INTERVAL_MS", 500, "an integer")?);
        config.heartbeat_interval = secs("BRANDKIT_HEARTBEAT_SECS", 20)?;
        config.workspace_retention = Duration::from_secs(
            env_parse::<u64>("BRANDKIT_WORKSPACE_RETENTION_HOURS", 6, "an integer")? * 3600,
        );
        config.log_tail_lines = env_parse("BRANDKIT_LOG_TAIL_LINES", 50, "an integer")?;
        config.app_version = env_string("BRANDKIT_APP_VERSION", "1.0.0");
        config.bundle_prefix = env_string("BRANDKIT_BUNDLE_PREFIX", "com.brandkit");
        config.download_base = env_string("BRANDKIT_DOWNLOAD_BASE", "/api/v1/builds");

        config.path_alias.enabled = env_bool("BRANDKIT_PATH_ALIAS", false)?;
        config.path_alias.allow_long_paths = env_bool("BRANDKIT_ALLOW_LONG_PATHS", true)?;
        if let Ok(root) = std::env::var("BRANDKIT_PATH_ALIAS_ROOT") {
            config.path_alias.alias_root = PathBuf::from(root);
        }

        config.storage = std::env::var("BRANDKIT_STORAGE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| StorageConfig {
                url: url.trim_end_matches('/').to_string(),
                key: env_string("BRANDKIT_STORAGE_KEY", ""),
                bucket: env_string("BRANDKIT_STORAGE_BUCKET", "builds"),
            });

        config.commands = ToolCommands {
            install: env_command("BRANDKIT_INSTALL_CMD"),
            prebuild: env_command("BRANDKIT_PREBUILD_CMD"),
            compile: env_command("BRANDKIT_COMPILE_CMD"),
            remote_build: env_command("BRANDKIT_REMOTE_BUILD_CMD"),
            remote_submit: env_command("BRANDKIT_REMOTE_SUBMIT_CMD"),
        };

        Ok(config)
    }

    /// Per-stage log file of one job: `{log_dir}/{job_id}-{stage}.log`.
    pub fn stage_log_path(&self, job_id: &uuid::Uuid, stage: &str) -> PathBuf {
        self.log_dir.join(format!("{job_id}-{stage}.log"))
    }

    /// Shared caches that the compile stage points the tools at.
    pub fn cache_dir(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name)
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_string(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(var: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    env_parse(var, default, "a whole number of seconds").map(Duration::from_secs)
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_bool(&raw).ok_or(ConfigError::Invalid {
            var,
            expected: "a boolean",
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_command(var: &str) -> Option<CommandLine> {
    std::env::var(var).ok().and_then(|raw| CommandLine::parse(&raw))
}
