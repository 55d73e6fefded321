//! Host tool discovery, submission prerequisites, and the environment report.
//!
//! Every external command the pipeline runs is resolved here, either from
//! an explicit override in [`ToolCommands`] or by inspecting the project.

use std::path::{Path, PathBuf};

use brandkit_core::build_job::BuildMode;
use serde::Serialize;

use crate::config::{CommandLine, PipelineConfig, ToolCommands};
use crate::customize::MANIFEST_FILE;

/// Free space below which the environment report warns.
pub const MIN_FREE_DISK_BYTES: u64 = 10 * 1024 * 1024 * 1024;

const GRADLE_WRAPPER: &str = "android/gradlew";
const LOCAL_EXPO_BIN: &str = "node_modules/.bin/expo";

/// A resolved command and the directory it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: CommandLine,
    pub cwd: PathBuf,
}

pub fn find_on_path(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Resolves the commands for each subprocess stage.
#[derive(Debug, Clone)]
pub struct Toolchain {
    commands: ToolCommands,
    sdk_root: Option<PathBuf>,
}

impl Toolchain {
    pub fn new(commands: ToolCommands, sdk_root: Option<PathBuf>) -> Self {
        Self { commands, sdk_root }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.commands.clone(), config.toolchain_root.clone())
    }

    pub fn sdk_root(&self) -> Option<&Path> {
        self.sdk_root.as_deref()
    }

    /// `yarn install --frozen-lockfile` when the project has a yarn lockfile,
    /// otherwise `npm install`.
    pub fn install(&self, project: &Path) -> Invocation {
        let command = self.commands.install.clone().unwrap_or_else(|| {
            if project.join("yarn.lock").is_file() {
                CommandLine::new("yarn", ["install", "--frozen-lockfile"])
            } else {
                CommandLine::new("npm", ["install"])
            }
        });
        Invocation {
            command,
            cwd: project.to_path_buf(),
        }
    }

    /// Native project generation. Prefers the project-local CLI.
    pub fn prebuild(&self, project: &Path) -> Invocation {
        let command = self.commands.prebuild.clone().unwrap_or_else(|| {
            let local = project.join(LOCAL_EXPO_BIN);
            if local.is_file() {
                CommandLine::new(
                    local.to_string_lossy(),
                    ["prebuild", "--platform", "android"],
                )
            } else {
                CommandLine::new("npx", ["expo", "prebuild", "--platform", "android"])
            }
        });
        Invocation {
            command,
            cwd: project.to_path_buf(),
        }
    }

    /// Release compile. The wrapper runs from the generated `android/` dir;
    /// an override runs from the project root.
    pub fn compile(&self, project: &Path) -> Invocation {
        match &self.commands.compile {
            Some(command) => Invocation {
                command: command.clone(),
                cwd: project.to_path_buf(),
            },
            None => Invocation {
                command: CommandLine::new(
                    "./gradlew",
                    [
                        "assembleRelease",
                        "--no-daemon",
                        "--parallel",
                        "--stacktrace",
                        "-x",
                        "lint",
                        "-x",
                        "test",
                    ],
                ),
                cwd: project.join("android"),
            },
        }
    }

    /// Fire-and-forget remote build submission.
    pub fn remote_build(&self, project: &Path) -> Invocation {
        let command = self.commands.remote_build.clone().unwrap_or_else(|| {
            let args = [
                "build",
                "-p",
                "android",
                "--profile",
                "preview",
                "--non-interactive",
                "--json",
                "--no-wait",
            ];
            eas_command(&args)
        });
        Invocation {
            command,
            cwd: project.to_path_buf(),
        }
    }

    /// Hand a finished remote build to a distribution track.
    pub fn remote_submit(&self, cwd: &Path, build_id: &str, track: &str) -> Invocation {
        let vars = [("build_id", build_id), ("track", track)];
        let command = match &self.commands.remote_submit {
            Some(command) => command.substitute(&vars),
            None => eas_command(&[
                "submit",
                "-p",
                "android",
                "--id",
                build_id,
                "--non-interactive",
                "--profile",
                track,
            ]),
        };
        Invocation {
            command,
            cwd: cwd.to_path_buf(),
        }
    }

    /// Environment exported to the compiler.
    pub fn compile_env(&self, config: &PipelineConfig) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(root) = &self.sdk_root {
            let root = root.to_string_lossy().into_owned();
            env.push(("ANDROID_HOME".to_string(), root.clone()));
            env.push(("ANDROID_SDK_ROOT".to_string(), root));
        }
        env.push((
            "GRADLE_USER_HOME".to_string(),
            config.cache_dir("gradle").to_string_lossy().into_owned(),
        ));
        env.push((
            "npm_config_cache".to_string(),
            config.cache_dir("npm-cache").to_string_lossy().into_owned(),
        ));
        env
    }

    /// Make the generated wrapper executable. A missing wrapper is left for
    /// the compile step itself to report.
    pub async fn prepare_compile(&self, project: &Path) -> std::io::Result<()> {
        if self.commands.compile.is_some() {
            return Ok(());
        }
        let wrapper = project.join(GRADLE_WRAPPER);
        if !tokio::fs::try_exists(&wrapper).await.unwrap_or(false) {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(())
    }

    /// `None` when the SDK root is configured and present.
    pub fn missing_sdk(&self) -> Option<String> {
        match &self.sdk_root {
            Some(root) if root.is_dir() => None,
            Some(root) => Some(format!(
                "Android SDK not found at {} (check ANDROID_HOME)",
                root.display()
            )),
            None => Some("Android SDK not configured: set ANDROID_HOME or ANDROID_SDK_ROOT".into()),
        }
    }

    /// Programs a build in `mode` will need from PATH.
    fn required_programs(&self, template_root: &Path, mode: BuildMode) -> Vec<String> {
        let mut programs = vec![self.install(template_root).command.program];
        if mode == BuildMode::Remote {
            match &self.commands.remote_build {
                Some(command) => programs.push(command.program.clone()),
                None if find_on_path("eas").is_some() => {}
                None => programs.push("npx".to_string()),
            }
        }
        programs
    }
}

/// Use `eas` directly when installed, otherwise through `npx`.
fn eas_command(args: &[&str]) -> CommandLine {
    if find_on_path("eas").is_some() {
        CommandLine::new("eas", args.iter().copied())
    } else {
        CommandLine::new("npx", std::iter::once("eas").chain(args.iter().copied()))
    }
}

// ---------------------------------------------------------------------------
// Prerequisites
// ---------------------------------------------------------------------------

/// Eager checks run at submission. Returns one message per missing item.
pub async fn check_prerequisites(
    config: &PipelineConfig,
    toolchain: &Toolchain,
    mode: BuildMode,
) -> Vec<String> {
    let mut missing = Vec::new();

    if mode == BuildMode::Native {
        missing.extend(toolchain.missing_sdk());
    }
    for program in toolchain.required_programs(&config.template_root, mode) {
        if find_on_path(&program).is_none() {
            missing.push(format!("'{program}' not found on PATH"));
        }
    }
    if !config.template_root.is_dir() {
        missing.push(format!(
            "Template project not found at {}",
            config.template_root.display()
        ));
    }
    if let Err(reason) = probe_writable(&config.scratch_dir).await {
        missing.push(format!(
            "Scratch directory {} is not writable: {reason}",
            config.scratch_dir.display()
        ));
    }

    missing
}

/// Create `dir` if needed and write then remove a probe file.
async fn probe_writable(dir: &Path) -> Result<(), String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| e.to_string())?;
    let probe = dir.join(format!(".write-probe-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| e.to_string())?;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        tracing::warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentCheck {
    pub name: String,
    pub ok: bool,
    pub required: bool,
    pub detail: String,
}

impl EnvironmentCheck {
    fn new(name: &str, ok: bool, required: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok,
            required,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    /// `true` when every required check passed.
    pub ready: bool,
    pub checks: Vec<EnvironmentCheck>,
}

/// Inspect the host for everything a native build needs.
pub async fn environment_report(config: &PipelineConfig, toolchain: &Toolchain) -> EnvironmentReport {
    let mut checks = Vec::new();

    checks.push(match toolchain.missing_sdk() {
        None => EnvironmentCheck::new(
            "android_sdk",
            true,
            true,
            toolchain
                .sdk_root()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        Some(reason) => EnvironmentCheck::new("android_sdk", false, true, reason),
    });

    for (program, required) in [("npm", true), ("yarn", false), ("node", true), ("npx", true), ("java", true)] {
        checks.push(match find_on_path(program) {
            Some(path) => EnvironmentCheck::new(program, true, required, path.display().to_string()),
            None => EnvironmentCheck::new(program, false, required, "not found on PATH"),
        });
    }

    let template_ok = config.template_root.is_dir();
    checks.push(EnvironmentCheck::new(
        "template",
        template_ok,
        true,
        config.template_root.display().to_string(),
    ));
    let manifest = config.template_root.join(MANIFEST_FILE);
    checks.push(EnvironmentCheck::new(
        "template_manifest",
        manifest.is_file(),
        true,
        manifest.display().to_string(),
    ));

    for (name, dir) in [
        ("scratch_dir", &config.scratch_dir),
        ("output_dir", &config.output_dir),
        ("log_dir", &config.log_dir),
    ] {
        checks.push(match probe_writable(dir).await {
            Ok(()) => EnvironmentCheck::new(name, true, true, dir.display().to_string()),
            Err(reason) => {
                EnvironmentCheck::new(name, false, true, format!("{}: {reason}", dir.display()))
            }
        });
    }

    checks.push(match fs2::available_space(&config.scratch_dir) {
        Ok(bytes) => EnvironmentCheck::new(
            "disk_space",
            bytes >= MIN_FREE_DISK_BYTES,
            false,
            format!("{:.1} GB free", bytes as f64 / (1024.0 * 1024.0 * 1024.0)),
        ),
        Err(e) => EnvironmentCheck::new("disk_space", false, false, e.to_string()),
    });

    let ready = checks.iter().all(|c| c.ok || !c.required);
    EnvironmentReport { ready, checks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides() -> ToolCommands {
        ToolCommands {
            install: CommandLine::parse("sh -c true"),
            compile: CommandLine::parse("sh -c true"),
            remote_submit: CommandLine::parse("sh -c echo --id {build_id} --profile {track}"),
            ..Default::default()
        }
    }

    #[test]
    fn install_prefers_yarn_with_lockfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let toolchain = Toolchain::new(ToolCommands::default(), None);
        assert_eq!(toolchain.install(dir.path()).command.program, "npm");

        std::fs::write(dir.path().join("yarn.lock"), "").expect("write");
        let inv = toolchain.install(dir.path());
        assert_eq!(inv.command.to_string(), "yarn install --frozen-lockfile");
        assert_eq!(inv.cwd, dir.path());
    }

    #[test]
    fn compile_runs_wrapper_from_android_dir() {
        let toolchain = Toolchain::new(ToolCommands::default(), None);
        let inv = toolchain.compile(Path::new("/w/app"));
        assert_eq!(inv.cwd, PathBuf::from("/w/app/android"));
        assert_eq!(inv.command.program, "./gradlew");
        assert!(inv.command.args.contains(&"assembleRelease".to_string()));
    }

    #[test]
    fn compile_override_runs_from_project_root() {
        let toolchain = Toolchain::new(overrides(), None);
        let inv = toolchain.compile(Path::new("/w/app"));
        assert_eq!(inv.cwd, PathBuf::from("/w/app"));
        assert_eq!(inv.command.program, "sh");
    }

    #[test]
    fn submit_override_substitutes_placeholders() {
        let toolchain = Toolchain::new(overrides(), None);
        let inv = toolchain.remote_submit(Path::new("/o"), "build-7", "beta");
        assert_eq!(inv.command.to_string(), "sh -c echo --id build-7 --profile beta");
    }

    #[test]
    fn compile_env_exports_sdk_and_caches() {
        let config = PipelineConfig::new("/t", "/s", "/o");
        let toolchain = Toolchain::new(ToolCommands::default(), Some(PathBuf::from("/sdk")));
        let env = toolchain.compile_env(&config);
        assert!(env.contains(&("ANDROID_HOME".into(), "/sdk".into())));
        assert!(env.contains(&("ANDROID_SDK_ROOT".into(), "/sdk".into())));
        assert!(env.contains(&("GRADLE_USER_HOME".into(), "/s/gradle".into())));
    }

    #[test]
    fn missing_sdk_is_reported() {
        assert!(Toolchain::new(ToolCommands::default(), None).missing_sdk().is_some());
        let dir = tempfile::tempdir().expect("tempdir");
        let toolchain = Toolchain::new(ToolCommands::default(), Some(dir.path().to_path_buf()));
        assert!(toolchain.missing_sdk().is_none());
    }

    #[tokio::test]
    async fn prerequisites_pass_with_overrides_and_fixtures() {
        let root = tempfile::tempdir().expect("tempdir");
        let template = root.path().join("template");
        std::fs::create_dir_all(&template).expect("mkdir");
        let mut config = PipelineConfig::new(&template, root.path().join("scratch"), root.path().join("out"));
        config.toolchain_root = Some(root.path().to_path_buf());
        config.commands = overrides();
        let toolchain = Toolchain::from_config(&config);

        let missing = check_prerequisites(&config, &toolchain, BuildMode::Native).await;
        assert!(missing.is_empty(), "unexpected: {missing:?}");
    }

    #[tokio::test]
    async fn prerequisites_list_every_missing_item() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut config = PipelineConfig::new(
            root.path().join("absent-template"),
            root.path().join("scratch"),
            root.path().join("out"),
        );
        config.commands.install = CommandLine::parse("definitely-not-a-real-tool-xyz install");
        let toolchain = Toolchain::from_config(&config);

        let missing = check_prerequisites(&config, &toolchain, BuildMode::Native).await;
        assert_eq!(missing.len(), 3, "{missing:?}");
        assert!(missing[0].contains("Android SDK"));
        assert!(missing[1].contains("definitely-not-a-real-tool-xyz"));
        assert!(missing[2].contains("Template project"));
    }

    #[tokio::test]
    async fn remote_mode_skips_sdk_check() {
        let root = tempfile::tempdir().expect("tempdir");
        let template = root.path().join("template");
        std::fs::create_dir_all(&template).expect("mkdir");
        let mut config = PipelineConfig::new(&template, root.path().join("scratch"), root.path().join("out"));
        config.commands = overrides();
        config.commands.remote_build = CommandLine::parse("sh -c true");
        let toolchain = Toolchain::from_config(&config);

        assert!(check_prerequisites(&config, &toolchain, BuildMode::Remote).await.is_empty());
    }

    #[tokio::test]
    async fn environment_report_flags_missing_template() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::new(
            root.path().join("absent"),
            root.path().join("scratch"),
            root.path().join("out"),
        );
        let report = environment_report(&config, &Toolchain::from_config(&config)).await;

        assert!(!report.ready);
        let template = report.checks.iter().find(|c| c.name == "template").expect("check");
        assert!(!template.ok && template.required);
        let scratch = report.checks.iter().find(|c| c.name == "scratch_dir").expect("check");
        assert!(scratch.ok);
        assert!(report.checks.iter().any(|c| c.name == "disk_space"));
    }
}
