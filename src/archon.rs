//! The Archon: a director for topologies of interdependent environments.
//!
//! Where the [`Runner`](crate::Runner) fans one testlet across
//! independent environments and tears everything down, the Archon keeps
//! named environments alive across many operations so that later
//! environments can be provisioned with knowledge of earlier ones — an
//! identity node, a storage node whose configuration references the
//! identity node's address, compute nodes referencing both.
//!
//! Operations execute in the exact order the caller issues them; that
//! ordering is the mechanism by which address-resolution dependencies
//! are satisfied. The Archon does not compute or enforce a dependency
//! graph — callers express topologies as a sequence of [`add`](Archon::add)
//! calls in dependency order.
//!
//! # Failure semantics
//!
//! Configuration-time errors (duplicate names, unknown names) are caught
//! before any provider call. A runtime failure partway through topology
//! construction aborts the remaining construction and leaves previously
//! created environments live for caller-driven cleanup —
//! [`destroy`](Archon::destroy) remains available and is best-effort.
//!
//! # Example
//!
//! ```no_run
//! use cleanroom::archon::Archon;
//! use cleanroom::artifact::Artifact;
//! use cleanroom::config::Config;
//! use cleanroom::provider::local::{LocalProvider, LocalProviderConfig};
//! use cleanroom::testlet::Testlet;
//!
//! # async fn doc() -> anyhow::Result<()> {
//! let provider = LocalProvider::new(LocalProviderConfig::default())?;
//! let mut archon = Archon::new(provider, Config::default());
//!
//! let ldap = Testlet::from_file("provision-ldap", "./provision/ldap.sh");
//! archon.add(&["ldap-0"], "ubuntu-jammy-amd64", Some(&ldap), &[]).await?;
//!
//! // Later environments consume the resolved address of earlier ones.
//! let ldap_addr = archon.get_public_address("ldap-0").await?;
//! let rendered = format!("uri = ldap://{ldap_addr}\n");
//! std::fs::write("./rendered/sssd.conf", rendered)?;
//!
//! let nfs = Testlet::from_file("provision-nfs", "./provision/nfs.sh");
//! archon
//!     .add(
//!         &["nfs-0"],
//!         "ubuntu-jammy-amd64",
//!         Some(&nfs),
//!         &[Artifact::file("./rendered/sssd.conf", "/root/.init/sssd.conf")],
//!     )
//!     .await?;
//!
//! archon.execute(&["nfs-0"], "systemctl restart nfs-server").await?;
//! archon.destroy().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::artifact::{self, Artifact, ArtifactError};
use crate::config::Config;
use crate::hooks::{self, HookFailure, HookRegistry};
use crate::provider::{Command, Instance, Provider, ProviderError};
use crate::testlet::{PackagingError, Testlet, TestletResult};

/// Remote path provisioning payloads are pushed to before execution.
const PROVISION_PATH: &str = "/root/.init/provision";

/// Errors produced by Archon operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchonError {
    /// An environment with this name already exists in the session.
    #[error("environment {0} already exists")]
    DuplicateEnvironment(String),

    /// The named environment was never created, or has been destroyed.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// The provider failed an operation on one environment.
    #[error("provider failed on {environment}: {source}")]
    Provider {
        /// Environment the operation targeted.
        environment: String,
        /// Underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// An artifact transfer failed on one environment.
    #[error("transfer failed on {environment}: {source}")]
    Transfer {
        /// Environment the transfer targeted.
        environment: String,
        /// Underlying artifact error.
        #[source]
        source: ArtifactError,
    },

    /// A provisioning payload could not be packaged.
    #[error(transparent)]
    Packaging(#[from] PackagingError),

    /// A provisioning payload exited nonzero.
    #[error("provisioning {environment} exited {exit_code}: {stderr}")]
    Provision {
        /// Environment being provisioned.
        environment: String,
        /// Exit code of the provisioning payload.
        exit_code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// Start hooks failed while bringing an environment up.
    #[error("start hooks failed on {environment}")]
    Hooks {
        /// Environment the hooks ran in.
        environment: String,
        /// The individual failures.
        failures: Vec<HookFailure>,
    },

    /// The command string could not be parsed.
    #[error("invalid command: {0}")]
    Command(#[from] shell_words::ParseError),

    /// The command string was empty.
    #[error("empty command")]
    EmptyCommand,

    /// One or more environments could not be destroyed.
    #[error("failed to destroy {} environment(s)", .0.len())]
    Destroy(Vec<(String, ProviderError)>),
}

/// Directs a topology of named, long-lived environments.
///
/// The Archon owns its provider, configuration, and hook set for the
/// whole session; environment names are unique across that session.
/// All operations are sequential within one call.
pub struct Archon<P: Provider> {
    provider: P,
    config: Config,
    hooks: HookRegistry,
    instances: HashMap<String, P::Instance>,
}

impl<P: Provider> Archon<P> {
    /// Creates an Archon with no hooks.
    pub fn new(provider: P, config: Config) -> Self {
        Self::with_hooks(provider, config, HookRegistry::new())
    }

    /// Creates an Archon with a hook set.
    ///
    /// Start hooks run in every environment after its provisioning
    /// payload; stop hooks run before [`remove`](Self::remove) and
    /// [`destroy`](Self::destroy) tear an environment down.
    pub fn with_hooks(provider: P, config: Config, hooks: HookRegistry) -> Self {
        Self {
            provider,
            config,
            hooks,
            instances: HashMap::new(),
        }
    }

    /// Returns `true` if the named environment is live in this session.
    pub fn exists(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Names of all live environments, in no particular order.
    pub fn environments(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    /// Creates one or more named environments from the same image.
    ///
    /// Per environment, in order: realize the instance, upload
    /// `resources` (pre-resolved files such as a rendered configuration
    /// referencing an earlier environment's address), push and run the
    /// provisioning payload once, then run the registered start hooks.
    ///
    /// Name uniqueness across the whole session is checked before any
    /// provider call. A failure partway through aborts the remaining
    /// construction; environments created so far stay live for
    /// caller-driven cleanup.
    pub async fn add(
        &mut self,
        names: &[&str],
        image: &str,
        provision: Option<&Testlet>,
        resources: &[Artifact],
    ) -> Result<(), ArchonError> {
        for (i, name) in names.iter().enumerate() {
            if self.exists(name) || names[..i].contains(name) {
                return Err(ArchonError::DuplicateEnvironment(name.to_string()));
            }
        }

        let provisioner = provision.map(|t| t.package()).transpose()?;

        for name in names {
            info!(environment = name, image, "adding environment");
            let instance = self
                .provider
                .create(name, image, &self.config.instance)
                .await
                .map_err(|source| ArchonError::Provider {
                    environment: name.to_string(),
                    source,
                })?;
            self.instances.insert(name.to_string(), instance);
            let instance = &self.instances[*name];

            for resource in resources {
                debug!(environment = name, "uploading resource");
                artifact::upload(resource, instance)
                    .await
                    .map_err(|source| ArchonError::Transfer {
                        environment: name.to_string(),
                        source,
                    })?;
            }

            if let Some(packaged) = &provisioner {
                debug!(environment = name, "running provisioning payload");
                let staged = tempfile::NamedTempFile::with_prefix("cleanroom-provision-")
                    .and_then(|f| {
                        std::fs::write(f.path(), &packaged.script)?;
                        Ok(f)
                    })
                    .map_err(|e| ArchonError::Provider {
                        environment: name.to_string(),
                        source: e.into(),
                    })?;
                instance
                    .push(staged.path(), PROVISION_PATH.as_ref())
                    .await
                    .map_err(|source| ArchonError::Provider {
                        environment: name.to_string(),
                        source,
                    })?;

                let cmd = Command::new(packaged.interpreter.as_str())
                    .arg(PROVISION_PATH)
                    .envs(self.base_env())
                    .envs(packaged.env.clone());
                let output =
                    instance
                        .exec(&cmd)
                        .await
                        .map_err(|source| ArchonError::Provider {
                            environment: name.to_string(),
                            source,
                        })?;
                if !output.success() {
                    return Err(ArchonError::Provision {
                        environment: name.to_string(),
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    });
                }
            }

            let base_env = self.base_env();
            let failures =
                hooks::run_start_hooks(self.hooks.start_hooks(), instance, &base_env).await;
            if !failures.is_empty() {
                return Err(ArchonError::Hooks {
                    environment: name.to_string(),
                    failures,
                });
            }
        }

        Ok(())
    }

    /// Returns the resolved public address of a live environment.
    ///
    /// Resolution happens at call time, so an address that changed since
    /// creation is observed by later calls.
    ///
    /// # Errors
    ///
    /// [`ArchonError::UnknownEnvironment`] if the name was never created
    /// or has been destroyed.
    pub async fn get_public_address(&self, name: &str) -> Result<IpAddr, ArchonError> {
        let instance = self.instance(name)?;
        instance
            .resolve_address()
            .await
            .map_err(|source| ArchonError::Provider {
                environment: name.to_string(),
                source,
            })
    }

    /// Uploads an artifact into one or more live environments.
    pub async fn push(&self, names: &[&str], data: &Artifact) -> Result<(), ArchonError> {
        self.check_known(names)?;
        for name in names {
            artifact::upload(data, self.instance(name)?)
                .await
                .map_err(|source| ArchonError::Transfer {
                    environment: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Downloads an artifact from a live environment.
    pub async fn pull(&self, name: &str, data: &Artifact) -> Result<PathBuf, ArchonError> {
        artifact::download(data, self.instance(name)?)
            .await
            .map_err(|source| ArchonError::Transfer {
                environment: name.to_string(),
                source,
            })?;
        Ok(data.dest.clone())
    }

    /// Runs an arbitrary command on one or more live environments.
    ///
    /// The command string is split shell-style; it is not a packaged
    /// testlet. Used for out-of-band control such as restarting system
    /// services after configuration has been distributed. All names are
    /// validated before anything executes.
    pub async fn execute(
        &self,
        names: &[&str],
        command: &str,
    ) -> Result<HashMap<String, TestletResult>, ArchonError> {
        self.check_known(names)?;

        let words = shell_words::split(command)?;
        let Some((program, args)) = words.split_first() else {
            return Err(ArchonError::EmptyCommand);
        };

        let mut results = HashMap::new();
        for name in names {
            debug!(environment = name, command, "executing");
            let cmd = Command::new(program.as_str())
                .args(args.to_vec())
                .envs(self.base_env());
            let output = self
                .instance(name)?
                .exec(&cmd)
                .await
                .map_err(|source| ArchonError::Provider {
                    environment: name.to_string(),
                    source,
                })?;
            results.insert(name.to_string(), TestletResult::from_output(*name, output));
        }
        Ok(results)
    }

    /// Removes specific environments: stop hooks, then destruction.
    ///
    /// Stop-hook failures are logged and do not block destruction. A
    /// destruction failure aborts the removal; the failing environment
    /// stays tracked.
    pub async fn remove(&mut self, names: &[&str]) -> Result<(), ArchonError> {
        self.check_known(names)?;
        for name in names {
            let instance = self.instance(name)?;
            let (_, failures) = hooks::run_stop_hooks(self.hooks.stop_hooks(), instance).await;
            for failure in failures {
                warn!(environment = name, "stop hook failed: {failure}");
            }
            instance
                .destroy()
                .await
                .map_err(|source| ArchonError::Provider {
                    environment: name.to_string(),
                    source,
                })?;
            self.instances.remove(*name);
            info!(environment = name, "environment removed");
        }
        Ok(())
    }

    /// Tears down every environment this Archon created.
    ///
    /// Best-effort and order-unspecified: failures are collected and
    /// reported together rather than stopping at the first one. The
    /// session is empty afterwards either way.
    pub async fn destroy(&mut self) -> Result<(), ArchonError> {
        let mut failures = Vec::new();

        for (name, instance) in self.instances.drain() {
            let (_, hook_failures) =
                hooks::run_stop_hooks(self.hooks.stop_hooks(), &instance).await;
            for failure in hook_failures {
                warn!(environment = %name, "stop hook failed: {failure}");
            }
            if let Err(e) = instance.destroy().await {
                warn!(environment = %name, "failed to destroy: {e}");
                failures.push((name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ArchonError::Destroy(failures))
        }
    }

    fn instance(&self, name: &str) -> Result<&P::Instance, ArchonError> {
        self.instances
            .get(name)
            .ok_or_else(|| ArchonError::UnknownEnvironment(name.to_string()))
    }

    fn check_known(&self, names: &[&str]) -> Result<(), ArchonError> {
        for name in names {
            if !self.exists(name) {
                return Err(ArchonError::UnknownEnvironment(name.to_string()));
            }
        }
        Ok(())
    }

    fn base_env(&self) -> Vec<(String, String)> {
        self.config
            .engine
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::StopHook;
    use crate::provider::local::{LocalProvider, LocalProviderConfig};

    fn archon() -> Archon<LocalProvider> {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        Archon::new(provider, Config::default())
    }

    #[tokio::test]
    async fn test_add_then_resolve_address() {
        let mut archon = archon();
        archon.add(&["a"], "scratch", None, &[]).await.unwrap();

        assert!(archon.exists("a"));
        let addr = archon.get_public_address("a").await.unwrap();
        assert!(!addr.to_string().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_environment_rejected() {
        let archon = archon();
        let err = archon.get_public_address("b").await.unwrap_err();
        assert!(matches!(err, ArchonError::UnknownEnvironment(name) if name == "b"));
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected_before_provider_call() {
        let mut archon = archon();
        archon.add(&["dup"], "scratch", None, &[]).await.unwrap();

        let err = archon.add(&["dup"], "scratch", None, &[]).await.unwrap_err();
        assert!(matches!(err, ArchonError::DuplicateEnvironment(_)));

        // Only the original creation ever reached the provider.
        assert_eq!(archon.provider.created().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_one_call_rejected() {
        let mut archon = archon();
        let err = archon
            .add(&["x", "x"], "scratch", None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ArchonError::DuplicateEnvironment(_)));
        assert!(archon.provider.created().await.is_empty());
    }

    #[tokio::test]
    async fn test_provision_payload_runs_once_at_creation() {
        let mut archon = archon();
        let provision = Testlet::inline("stamp", "echo provisioned > /root/stamp");
        archon
            .add(&["p-0", "p-1"], "scratch", Some(&provision), &[])
            .await
            .unwrap();

        let results = archon
            .execute(&["p-0", "p-1"], "cat /root/stamp")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        for result in results.values() {
            assert_eq!(result.stdout.trim(), "provisioned");
        }
    }

    #[tokio::test]
    async fn test_failed_provision_aborts_and_leaves_environment_live() {
        let mut archon = archon();
        let broken = Testlet::inline("broken", "echo no >&2; exit 9");

        let err = archon
            .add(&["bad-0", "never-0"], "scratch", Some(&broken), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchonError::Provision { ref environment, exit_code: 9, .. } if environment == "bad-0"
        ));

        // The failed environment stays live for caller-driven cleanup;
        // construction never reached the second name.
        assert!(archon.exists("bad-0"));
        assert!(!archon.exists("never-0"));

        archon.destroy().await.unwrap();
        assert!(!archon.exists("bad-0"));
    }

    #[tokio::test]
    async fn test_execute_validates_names_first() {
        let mut archon = archon();
        archon.add(&["real"], "scratch", None, &[]).await.unwrap();

        let err = archon
            .execute(&["real", "ghost"], "true")
            .await
            .unwrap_err();
        assert!(matches!(err, ArchonError::UnknownEnvironment(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_execute_splits_shell_words() {
        let mut archon = archon();
        archon.add(&["sh-0"], "scratch", None, &[]).await.unwrap();

        let results = archon
            .execute(&["sh-0"], "sh -c 'printf %s \"one two\"'")
            .await
            .unwrap();
        assert_eq!(results["sh-0"].stdout, "one two");
    }

    #[tokio::test]
    async fn test_push_and_pull_live_environment() {
        let mut archon = archon();
        archon.add(&["data-0"], "scratch", None, &[]).await.unwrap();

        let host = tempfile::TempDir::new().unwrap();
        let src = host.path().join("munge.key");
        std::fs::write(&src, b"secret").unwrap();

        archon
            .push(
                &["data-0"],
                &Artifact::file(src.to_string_lossy(), "/etc/munge/munge.key").mode(0o600),
            )
            .await
            .unwrap();

        let dest = host.path().join("copy.key");
        let pulled = archon
            .pull(
                "data-0",
                &Artifact::file("/etc/munge/munge.key", &dest).overwrite(true),
            )
            .await
            .unwrap();
        assert_eq!(pulled, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"secret");
    }

    #[tokio::test]
    async fn test_topology_threads_addresses_into_later_environments() {
        let mut archon = archon();
        let host = tempfile::TempDir::new().unwrap();

        // Identity and storage first; dependency order is the caller's.
        archon
            .add(&["identity-0"], "scratch", None, &[])
            .await
            .unwrap();
        archon
            .add(&["storage-0"], "scratch", None, &[])
            .await
            .unwrap();

        let storage_addr = archon.get_public_address("storage-0").await.unwrap();
        let rendered = host.path().join("storage.conf");
        std::fs::write(&rendered, format!("storage = {storage_addr}\n")).unwrap();

        archon
            .add(
                &["compute-0", "compute-1", "compute-2"],
                "scratch",
                None,
                &[Artifact::file(
                    rendered.to_string_lossy(),
                    "/root/.init/storage.conf",
                )],
            )
            .await
            .unwrap();

        let results = archon
            .execute(
                &["compute-0", "compute-1", "compute-2"],
                "cat /root/.init/storage.conf",
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        for result in results.values() {
            assert!(result.stdout.contains(&storage_addr.to_string()));
        }
    }

    #[tokio::test]
    async fn test_destroy_tears_down_everything() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let mut archon = Archon::new(provider, Config::default());

        archon
            .add(&["d-0", "d-1", "d-2"], "scratch", None, &[])
            .await
            .unwrap();
        assert_eq!(archon.environments().len(), 3);

        archon.destroy().await.unwrap();
        assert!(archon.environments().is_empty());

        let err = archon.get_public_address("d-0").await.unwrap_err();
        assert!(matches!(err, ArchonError::UnknownEnvironment(_)));
    }

    #[tokio::test]
    async fn test_remove_runs_stop_hooks_and_forgets_name() {
        let host = tempfile::TempDir::new().unwrap();
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();

        let mut hooks = HookRegistry::new();
        hooks
            .register_stop(StopHook::new("collect").download(
                Artifact::file("/root/result", host.path().join("result")).overwrite(true),
            ))
            .unwrap();

        let mut archon = Archon::with_hooks(provider, Config::default(), hooks);
        let provision = Testlet::inline("result", "echo 42 > /root/result");
        archon
            .add(&["r-0", "keep-0"], "scratch", Some(&provision), &[])
            .await
            .unwrap();

        archon.remove(&["r-0"]).await.unwrap();
        assert!(!archon.exists("r-0"));
        assert!(archon.exists("keep-0"));
        assert_eq!(
            std::fs::read_to_string(host.path().join("result")).unwrap().trim(),
            "42"
        );
    }
}
