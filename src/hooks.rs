//! Lifecycle hooks: ordered, named actions around a testlet's run.
//!
//! Start hooks run after an environment is created and before the payload
//! is injected; they install packages and upload artifacts. Stop hooks
//! run after the testlet has produced its result; they only download
//! artifacts, and their failures never mask that result.
//!
//! Hooks live in a [`HookRegistry`] owned by the orchestration run — an
//! explicit configuration value, not a process-global. Names are unique
//! across the whole registered set; a duplicate is a configuration error
//! caught before any environment is touched.
//!
//! # Failure isolation
//!
//! Within one hook, actions run in order and the first failure aborts the
//! hook's remaining actions. Independently registered hooks are isolated:
//! one hook failing does not stop the next from running. All failures are
//! collected and handed to the caller, which decides what they mean — the
//! [`Harness`](crate::Harness) treats any start-hook failure as fatal for
//! that environment.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::artifact::{self, Artifact, ArtifactError};
use crate::pkg::Package;
use crate::provider::{Instance, ProviderError};

/// Hook registration errors.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// A hook with this name is already registered.
    #[error("duplicate hook name: {0}")]
    DuplicateName(String),
}

/// One hook's failure, reported to the orchestrating caller.
#[derive(Debug, thiserror::Error)]
#[error("hook {hook} failed: {cause}")]
pub struct HookFailure {
    /// Name of the failing hook.
    pub hook: String,

    /// What went wrong.
    #[source]
    pub cause: HookCause,
}

/// Cause of a hook failure.
#[derive(Debug, thiserror::Error)]
pub enum HookCause {
    /// An install action exited nonzero.
    #[error("{command} exited {exit_code}: {stderr}")]
    Install {
        /// Rendered install command.
        command: String,
        /// Exit code reported by the package manager.
        exit_code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// An artifact transfer failed.
    #[error(transparent)]
    Transfer(#[from] ArtifactError),

    /// The provider failed executing an action.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A named action set run when an environment starts.
#[derive(Debug, Clone, Default)]
pub struct StartHook {
    /// Unique hook name.
    pub name: String,

    /// Packages installed first, in order.
    pub packages: Vec<Package>,

    /// Artifacts uploaded after installation, in order.
    pub uploads: Vec<Artifact>,
}

impl StartHook {
    /// Creates an empty start hook.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds a package-install action.
    pub fn install(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    /// Adds an artifact upload.
    pub fn upload(mut self, artifact: Artifact) -> Self {
        self.uploads.push(artifact);
        self
    }
}

/// A named action set run before an environment stops.
#[derive(Debug, Clone, Default)]
pub struct StopHook {
    /// Unique hook name.
    pub name: String,

    /// Artifacts downloaded, in order.
    pub downloads: Vec<Artifact>,
}

impl StopHook {
    /// Creates an empty stop hook.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds an artifact download.
    pub fn download(mut self, artifact: Artifact) -> Self {
        self.downloads.push(artifact);
        self
    }
}

/// The hook set for one orchestration run.
///
/// # Example
///
/// ```
/// use cleanroom::artifact::Artifact;
/// use cleanroom::hooks::{HookRegistry, StartHook, StopHook};
///
/// let mut hooks = HookRegistry::new();
/// hooks.register_start(
///     StartHook::new("seed").upload(Artifact::file("./in.txt", "/root/in.txt")),
/// )?;
/// hooks.register_stop(
///     StopHook::new("collect").download(Artifact::file("/root/out.txt", "./out.txt")),
/// )?;
/// # Ok::<(), cleanroom::hooks::HookError>(())
/// ```
#[derive(Debug, Default)]
pub struct HookRegistry {
    start: Vec<StartHook>,
    stop: Vec<StopHook>,
    names: HashSet<String>,
}

impl HookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a start hook.
    ///
    /// # Errors
    ///
    /// [`HookError::DuplicateName`] when any registered hook — start or
    /// stop — already uses the name.
    pub fn register_start(&mut self, hook: StartHook) -> Result<(), HookError> {
        self.claim_name(&hook.name)?;
        self.start.push(hook);
        Ok(())
    }

    /// Registers a stop hook.
    ///
    /// # Errors
    ///
    /// [`HookError::DuplicateName`] when any registered hook — start or
    /// stop — already uses the name.
    pub fn register_stop(&mut self, hook: StopHook) -> Result<(), HookError> {
        self.claim_name(&hook.name)?;
        self.stop.push(hook);
        Ok(())
    }

    /// Start hooks in registration order.
    pub fn start_hooks(&self) -> &[StartHook] {
        &self.start
    }

    /// Stop hooks in registration order.
    pub fn stop_hooks(&self) -> &[StopHook] {
        &self.stop
    }

    fn claim_name(&mut self, name: &str) -> Result<(), HookError> {
        if !self.names.insert(name.to_string()) {
            return Err(HookError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

/// Runs start hooks against an instance, in registration order.
///
/// Returns every failure encountered; an empty vector means all hooks
/// completed. `base_env` is merged into each install command.
pub async fn run_start_hooks<I: Instance + ?Sized>(
    hooks: &[StartHook],
    instance: &I,
    base_env: &[(String, String)],
) -> Vec<HookFailure> {
    let mut failures = Vec::new();

    'hooks: for hook in hooks {
        debug!(hook = %hook.name, instance = %instance.name(), "running start hook");

        for package in &hook.packages {
            let cmd = package.install_command().envs(base_env.to_vec());
            let rendered = cmd.to_shell_string();
            match instance.exec(&cmd).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        cause: HookCause::Install {
                            command: rendered,
                            exit_code: output.exit_code,
                            stderr: output.stderr,
                        },
                    });
                    continue 'hooks;
                }
                Err(e) => {
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        cause: HookCause::Provider(e),
                    });
                    continue 'hooks;
                }
            }
        }

        for upload in &hook.uploads {
            if let Err(e) = artifact::upload(upload, instance).await {
                failures.push(HookFailure {
                    hook: hook.name.clone(),
                    cause: HookCause::Transfer(e),
                });
                continue 'hooks;
            }
        }
    }

    failures
}

/// Runs stop hooks against an instance, in registration order.
///
/// Returns the local destination paths of every artifact that was
/// collected, plus any failures. Failures are reported but never fatal
/// here — the testlet's result stands regardless.
pub async fn run_stop_hooks<I: Instance + ?Sized>(
    hooks: &[StopHook],
    instance: &I,
) -> (Vec<PathBuf>, Vec<HookFailure>) {
    let mut collected = Vec::new();
    let mut failures = Vec::new();

    'hooks: for hook in hooks {
        debug!(hook = %hook.name, instance = %instance.name(), "running stop hook");

        for download in &hook.downloads {
            match artifact::download(download, instance).await {
                Ok(()) => collected.push(download.dest.clone()),
                Err(e) => {
                    warn!(hook = %hook.name, "stop hook download failed: {e}");
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        cause: HookCause::Transfer(e),
                    });
                    continue 'hooks;
                }
            }
        }
    }

    (collected, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::pkg::PackageManager;
    use crate::provider::local::{LocalInstance, LocalProvider, LocalProviderConfig};
    use crate::provider::{Command, Provider};

    #[test]
    fn test_register_unique_names_succeeds() {
        let mut registry = HookRegistry::new();
        registry.register_start(StartHook::new("a")).unwrap();
        registry.register_start(StartHook::new("b")).unwrap();
        registry.register_stop(StopHook::new("c")).unwrap();
        assert_eq!(registry.start_hooks().len(), 2);
        assert_eq!(registry.stop_hooks().len(), 1);
    }

    #[test]
    fn test_register_duplicate_name_fails() {
        let mut registry = HookRegistry::new();
        registry.register_start(StartHook::new("dup")).unwrap();

        let err = registry.register_start(StartHook::new("dup")).unwrap_err();
        assert!(matches!(err, HookError::DuplicateName(name) if name == "dup"));
    }

    #[test]
    fn test_duplicate_detected_across_hook_types() {
        let mut registry = HookRegistry::new();
        registry.register_start(StartHook::new("shared")).unwrap();

        let err = registry.register_stop(StopHook::new("shared")).unwrap_err();
        assert!(matches!(err, HookError::DuplicateName(_)));
    }

    async fn fixture(name: &str) -> (LocalProvider, LocalInstance, tempfile::TempDir) {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let instance = provider
            .create(name, "scratch", &InstanceConfig::default())
            .await
            .unwrap();
        let host = tempfile::TempDir::new().unwrap();
        (provider, instance, host)
    }

    #[tokio::test]
    async fn test_start_hooks_upload_in_order() {
        let (_provider, instance, host) = fixture("hooks-order").await;

        let first = host.path().join("first");
        let second = host.path().join("second");
        std::fs::write(&first, b"1").unwrap();
        std::fs::write(&second, b"2").unwrap();

        let hook = StartHook::new("seed")
            .upload(Artifact::file(first.to_string_lossy(), "/root/data"))
            .upload(
                Artifact::file(second.to_string_lossy(), "/root/data").overwrite(true),
            );

        let failures = run_start_hooks(&[hook], &instance, &[]).await;
        assert!(failures.is_empty());

        // Second upload overwrote the first: registration order held.
        let out = instance
            .exec(&Command::new("cat").arg("/root/data"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "2");
    }

    #[tokio::test]
    async fn test_failing_action_aborts_hook_but_not_others() {
        let (_provider, instance, host) = fixture("hooks-isolated").await;

        let ok_file = host.path().join("ok");
        std::fs::write(&ok_file, b"fine").unwrap();

        let broken = StartHook::new("broken")
            .upload(Artifact::file("/missing/source", "/root/never"))
            .upload(Artifact::file(ok_file.to_string_lossy(), "/root/skipped"));
        let healthy =
            StartHook::new("healthy").upload(Artifact::file(ok_file.to_string_lossy(), "/root/ok"));

        let failures = run_start_hooks(&[broken, healthy], &instance, &[]).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].hook, "broken");

        // The broken hook's later action never ran.
        let skipped = instance
            .exec(&Command::new("test").arg("-e").arg("/root/skipped"))
            .await
            .unwrap();
        assert!(!skipped.success());

        // The independent hook still ran.
        let ok = instance
            .exec(&Command::new("cat").arg("/root/ok"))
            .await
            .unwrap();
        assert_eq!(ok.stdout, "fine");
    }

    #[tokio::test]
    async fn test_failed_install_reported_with_command() {
        let (_provider, instance, _host) = fixture("hooks-install").await;

        let hook = StartHook::new("pkgs").install(Package::new(
            PackageManager::Pacman,
            ["cleanroom-not-a-package"],
        ));

        let failures = run_start_hooks(&[hook], &instance, &[]).await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0].cause,
            HookCause::Install { command, .. } if command.starts_with("pacman")
        ));
    }

    #[tokio::test]
    async fn test_stop_hooks_collect_artifacts() {
        let (_provider, instance, host) = fixture("hooks-collect").await;

        instance
            .exec(&Command::new("sh").arg("-c").arg("echo report > /root/report.txt"))
            .await
            .unwrap();

        let dest = host.path().join("report.txt");
        let hook = StopHook::new("collect")
            .download(Artifact::file("/root/report.txt", &dest).overwrite(true));

        let (collected, failures) = run_stop_hooks(&[hook], &instance).await;
        assert!(failures.is_empty());
        assert_eq!(collected, vec![dest.clone()]);
        assert_eq!(std::fs::read_to_string(&dest).unwrap().trim(), "report");
    }

    #[tokio::test]
    async fn test_stop_hook_failure_does_not_stop_collection() {
        let (_provider, instance, host) = fixture("hooks-partial").await;

        instance
            .exec(&Command::new("sh").arg("-c").arg("echo keep > /root/keep.txt"))
            .await
            .unwrap();

        let missing = StopHook::new("missing")
            .download(Artifact::file("/root/nope.txt", host.path().join("nope")));
        let present = StopHook::new("present")
            .download(Artifact::file("/root/keep.txt", host.path().join("keep")).overwrite(true));

        let (collected, failures) = run_stop_hooks(&[missing, present], &instance).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].hook, "missing");
        assert_eq!(collected.len(), 1);
    }
}
