//! Parallel fan-out of one testlet across many environments.
//!
//! The [`Runner`] gives each named environment an independent
//! [`Harness`] and drives up to `max_workers` of them concurrently,
//! blocking until every environment reaches a terminal state. Results
//! come back keyed by environment name — completion order between
//! environments is deliberately unspecified, so callers must never
//! depend on arrival order.
//!
//! Environments are round-robined into at most `max_workers` batches;
//! each batch is one worker that runs its harnesses sequentially, so a
//! worker slot is held for the full lifecycle of each environment it
//! owns.
//!
//! # Partial failure
//!
//! One environment failing — a hook error, a provider fault — never
//! cancels the others. The returned map always has exactly one entry per
//! requested environment, successful or not, so each can be evaluated
//! independently.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::{Config, EnvironmentSpec, worker_count};
use crate::harness::{Harness, HarnessError, HarnessOutcome};
use crate::hooks::HookRegistry;
use crate::provider::Provider;
use crate::testlet::Testlet;

/// Runs one testlet across many environments with bounded parallelism.
///
/// # Example
///
/// ```no_run
/// use cleanroom::config::{Config, EnvironmentSpec};
/// use cleanroom::hooks::HookRegistry;
/// use cleanroom::provider::local::{LocalProvider, LocalProviderConfig};
/// use cleanroom::runner::Runner;
/// use cleanroom::testlet::Testlet;
///
/// # async fn doc() -> anyhow::Result<()> {
/// let provider = LocalProvider::new(LocalProviderConfig::default())?;
/// let config = Config::default();
/// let hooks = HookRegistry::new();
///
/// let runner = Runner::new(&provider, &config, &hooks);
/// let results = runner
///     .run(
///         &Testlet::inline("smoke", "echo ok"),
///         &EnvironmentSpec::per_image("smoke", ["jammy", "noble"]),
///     )
///     .await;
///
/// for (name, outcome) in &results {
///     match outcome {
///         Ok(o) => println!("{name}: exit {}", o.result.exit_code),
///         Err(e) => println!("{name}: {e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Runner<'a, P: Provider> {
    provider: &'a P,
    config: &'a Config,
    hooks: &'a HookRegistry,
    max_workers: usize,
}

impl<'a, P: Provider> Runner<'a, P> {
    /// Creates a runner.
    ///
    /// The worker-pool size is resolved here, once: the configured
    /// `max_workers` if set, else the
    /// [`CLEANROOM_MAX_WORKERS`](crate::config::MAX_WORKERS_ENV)
    /// environment variable, else the host's available parallelism.
    pub fn new(provider: &'a P, config: &'a Config, hooks: &'a HookRegistry) -> Self {
        Self {
            provider,
            config,
            hooks,
            max_workers: worker_count(config.engine.max_workers),
        }
    }

    /// Returns the resolved worker-pool size.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs the testlet in every environment, blocking until all of them
    /// reach a terminal state.
    ///
    /// The returned map is keyed by environment name and has exactly one
    /// entry per requested environment: either the harness outcome or
    /// the error that stopped that environment. Other environments are
    /// unaffected by a failure.
    pub async fn run(
        &self,
        testlet: &Testlet,
        environments: &[EnvironmentSpec],
    ) -> HashMap<String, Result<HarnessOutcome, HarnessError>> {
        info!(
            testlet = %testlet.name,
            environments = environments.len(),
            workers = self.max_workers,
            "starting parallel run"
        );

        // Round-robin into one batch per worker slot.
        let mut batches: Vec<Vec<EnvironmentSpec>> = vec![Vec::new(); self.max_workers];
        for (i, spec) in environments.iter().enumerate() {
            batches[i % self.max_workers].push(spec.clone());
        }
        batches.retain(|batch| !batch.is_empty());

        let results = Mutex::new(HashMap::new());

        tokio_scoped::scope(|scope| {
            for batch in batches {
                let results = &results;
                let provider = self.provider;
                let config = self.config;
                let hooks = self.hooks;

                scope.spawn(async move {
                    let harness = Harness::new(provider, config, hooks);
                    for spec in batch {
                        let outcome = harness.run(testlet, &spec).await;
                        results.lock().await.insert(spec.name.clone(), outcome);
                    }
                });
            }
        });

        results.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::provider::local::{LocalProvider, LocalProviderConfig};

    fn provider() -> LocalProvider {
        LocalProvider::new(LocalProviderConfig::default()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_environments_reported() {
        let provider = provider();
        let config = load_config_str("[engine]\nmax_workers = 2").unwrap();
        let hooks = HookRegistry::new();
        let runner = Runner::new(&provider, &config, &hooks);

        let envs = EnvironmentSpec::per_image("par", ["a", "b", "c", "d", "e"]);
        let results = runner.run(&Testlet::inline("noop", "true"), &envs).await;

        assert_eq!(results.len(), 5);
        for (name, outcome) in results {
            let outcome = outcome.unwrap();
            assert!(outcome.result.success(), "{name} failed");
            assert_eq!(outcome.result.environment, name);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_failure_leaves_others_unaffected() {
        let provider = provider();
        let config = load_config_str("[engine]\nmax_workers = 3").unwrap();
        let hooks = HookRegistry::new();
        let runner = Runner::new(&provider, &config, &hooks);

        let mut envs = EnvironmentSpec::per_image("mixed", ["a", "b", "c", "d"]);
        envs[2]
            .config
            .env
            .insert("PLEASE_FAIL".to_string(), "1".to_string());

        // Exits nonzero only where the environment asks for it.
        let testlet = Testlet::inline("selective", r#"test -z "$PLEASE_FAIL""#);
        let results = runner.run(&testlet, &envs).await;

        assert_eq!(results.len(), 4);
        let failed = results.get("mixed-c").unwrap().as_ref().unwrap();
        assert!(!failed.result.success());

        for name in ["mixed-a", "mixed-b", "mixed-d"] {
            let outcome = results.get(name).unwrap().as_ref().unwrap();
            assert!(outcome.result.success(), "{name} should have passed");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_worker_still_completes_all() {
        let provider = provider();
        let config = load_config_str("[engine]\nmax_workers = 1").unwrap();
        let hooks = HookRegistry::new();
        let runner = Runner::new(&provider, &config, &hooks);
        assert_eq!(runner.max_workers(), 1);

        let envs = EnvironmentSpec::per_image("serial", ["a", "b", "c"]);
        let results = runner.run(&Testlet::inline("noop", "true"), &envs).await;
        assert_eq!(results.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_env_override_read_at_construction() {
        let provider = provider();
        let config = Config::default();
        let hooks = HookRegistry::new();

        unsafe { std::env::set_var(crate::config::MAX_WORKERS_ENV, "2") };
        let runner = Runner::new(&provider, &config, &hooks);
        unsafe { std::env::remove_var(crate::config::MAX_WORKERS_ENV) };

        assert_eq!(runner.max_workers(), 2);
    }
}
