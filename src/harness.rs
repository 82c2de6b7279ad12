//! The per-environment lifecycle driver.
//!
//! A [`Harness`] takes one testlet and one environment descriptor through
//! the full lifecycle:
//!
//! ```text
//! Created ──► Configured ──► Injected ──► Executed ──► Collected ──► Terminal
//!    │            │              │            │                        │
//!    │       start hooks     script push   interpreter runs,      stop hooks,
//!  provider      │              │          output captured        destroy or
//!  realizes      ▼              ▼                                 preserve
//!  instance   failure ──────► environment torn down early,
//!             (never injects into a misconfigured environment)
//! ```
//!
//! Transitions are strictly sequential. Any unrecoverable error aborts
//! the remaining transitions for that environment and surfaces as a
//! [`HarnessError`] carrying the phase it happened in — the harness never
//! silently skips ahead to collection. Execution blocks until the payload
//! completes; the engine imposes no timeout of its own.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{Config, EnvironmentSpec};
use crate::hooks::{self, HookFailure, HookRegistry};
use crate::provider::{Command, Instance, Provider, ProviderError};
use crate::testlet::{PackagingError, Testlet, TestletResult};

/// Lifecycle phase of one (testlet, environment) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Environment realized by the provider.
    Created,
    /// Start hooks applied.
    Configured,
    /// Packaged script pushed into the environment.
    Injected,
    /// Payload executed, output captured.
    Executed,
    /// Stop hooks applied, artifacts collected.
    Collected,
    /// Environment destroyed.
    Destroyed,
    /// Environment intentionally left alive for inspection.
    Preserved,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::Configured => "configured",
            Phase::Injected => "injected",
            Phase::Executed => "executed",
            Phase::Collected => "collected",
            Phase::Destroyed => "destroyed",
            Phase::Preserved => "preserved",
        };
        write!(f, "{name}")
    }
}

/// A lifecycle failure, tagged with the phase it happened in.
#[derive(Debug, thiserror::Error)]
#[error("harness failed during {phase}: {cause}")]
pub struct HarnessError {
    /// Phase the failure happened in.
    pub phase: Phase,

    /// Underlying cause.
    #[source]
    pub cause: HarnessCause,
}

/// Cause of a harness failure.
#[derive(Debug, thiserror::Error)]
pub enum HarnessCause {
    /// The provider failed an operation.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The testlet could not be packaged.
    #[error(transparent)]
    Packaging(#[from] PackagingError),

    /// One or more start hooks failed.
    #[error("start hooks failed: {}", failed_hook_names(.0))]
    Hooks(Vec<HookFailure>),
}

fn failed_hook_names(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(|f| f.hook.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything one harness run produced.
#[derive(Debug)]
pub struct HarnessOutcome {
    /// The testlet's result.
    pub result: TestletResult,

    /// Local paths of artifacts collected by stop hooks — a side channel
    /// distinct from the result itself.
    pub artifacts: Vec<PathBuf>,

    /// Stop-hook failures. Reported here rather than as an error so they
    /// can never mask the testlet's result.
    pub hook_failures: Vec<HookFailure>,
}

/// Drives one environment through its full lifecycle for one testlet.
///
/// The harness borrows its collaborators; one harness value can be reused
/// across many environments (the [`Runner`](crate::Runner) does exactly
/// that).
///
/// # Example
///
/// ```no_run
/// use cleanroom::config::{Config, EnvironmentSpec};
/// use cleanroom::harness::Harness;
/// use cleanroom::hooks::HookRegistry;
/// use cleanroom::provider::local::{LocalProvider, LocalProviderConfig};
/// use cleanroom::testlet::Testlet;
///
/// # async fn doc() -> anyhow::Result<()> {
/// let provider = LocalProvider::new(LocalProviderConfig::default())?;
/// let config = Config::default();
/// let hooks = HookRegistry::new();
///
/// let harness = Harness::new(&provider, &config, &hooks);
/// let outcome = harness
///     .run(
///         &Testlet::inline("smoke", "echo ok"),
///         &EnvironmentSpec::new("smoke-jammy", "ubuntu-jammy-amd64"),
///     )
///     .await?;
/// assert!(outcome.result.success());
/// # Ok(())
/// # }
/// ```
pub struct Harness<'a, P: Provider> {
    provider: &'a P,
    config: &'a Config,
    hooks: &'a HookRegistry,
}

impl<'a, P: Provider> Harness<'a, P> {
    /// Creates a harness over the given provider, configuration, and
    /// hook set.
    pub fn new(provider: &'a P, config: &'a Config, hooks: &'a HookRegistry) -> Self {
        Self {
            provider,
            config,
            hooks,
        }
    }

    /// Runs one testlet in one environment.
    ///
    /// Blocks until the environment reaches a terminal state. Stop-hook
    /// failures are carried inside the [`HarnessOutcome`]; every other
    /// failure aborts the lifecycle and is returned as a
    /// [`HarnessError`].
    pub async fn run(
        &self,
        testlet: &Testlet,
        spec: &EnvironmentSpec,
    ) -> Result<HarnessOutcome, HarnessError> {
        info!(environment = %spec.name, testlet = %testlet.name, "starting harness");

        // Created
        let instance = self
            .provider
            .create(&spec.name, &spec.image, &spec.config)
            .await
            .map_err(|e| HarnessError {
                phase: Phase::Created,
                cause: e.into(),
            })?;

        // Configured
        let base_env: Vec<(String, String)> = self
            .config
            .engine
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let failures = hooks::run_start_hooks(self.hooks.start_hooks(), &instance, &base_env).await;
        if !failures.is_empty() {
            self.teardown(&instance).await;
            return Err(HarnessError {
                phase: Phase::Configured,
                cause: HarnessCause::Hooks(failures),
            });
        }

        // Injected
        let packaged = match testlet.package() {
            Ok(packaged) => packaged,
            Err(e) => {
                self.teardown(&instance).await;
                return Err(HarnessError {
                    phase: Phase::Injected,
                    cause: e.into(),
                });
            }
        };
        let remote_script = PathBuf::from(format!("/root/{}", packaged.name));
        if let Err(e) = self.inject(&instance, &packaged.script, &remote_script).await {
            self.teardown(&instance).await;
            return Err(HarnessError {
                phase: Phase::Injected,
                cause: e.into(),
            });
        }

        // Executed
        let cmd = Command::new(packaged.interpreter.as_str())
            .arg(remote_script.to_string_lossy())
            .envs(base_env)
            .envs(packaged.env.clone());
        let output = match instance.exec(&cmd).await {
            Ok(output) => output,
            Err(e) => {
                self.teardown(&instance).await;
                return Err(HarnessError {
                    phase: Phase::Executed,
                    cause: e.into(),
                });
            }
        };
        let result = TestletResult::from_output(&spec.name, output);
        debug!(
            environment = %spec.name,
            exit_code = result.exit_code,
            "testlet finished"
        );

        // Collected
        let (artifacts, hook_failures) =
            hooks::run_stop_hooks(self.hooks.stop_hooks(), &instance).await;

        // Terminal
        self.teardown(&instance).await;

        Ok(HarnessOutcome {
            result,
            artifacts,
            hook_failures,
        })
    }

    /// Pushes the packaged script into the environment.
    async fn inject(
        &self,
        instance: &P::Instance,
        script: &str,
        remote: &Path,
    ) -> Result<(), ProviderError> {
        let staged = tempfile::NamedTempFile::with_prefix("cleanroom-testlet-")?;
        std::fs::write(staged.path(), script)?;
        instance.push(staged.path(), remote).await
    }

    /// Destroys the instance unless preservation was configured.
    ///
    /// Best-effort: a failed destroy is logged, not surfaced, so it can
    /// never displace a result or an earlier error.
    async fn teardown(&self, instance: &P::Instance) {
        if self.config.engine.preserve {
            info!(
                environment = %instance.name(),
                "preserving environment for inspection"
            );
            return;
        }
        if let Err(e) = instance.destroy().await {
            warn!(environment = %instance.name(), "failed to destroy environment: {e}");
        }
    }
}
