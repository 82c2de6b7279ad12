//! Local provider implementation.
//!
//! Realizes test environments as scratch directories on the host, with
//! commands run as child processes. There is no real isolation — the
//! instance "root filesystem" is just a directory — but the full provider
//! contract is honored, which makes this the reference backend for
//! development and for the engine's own test suite.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared kernel, filesystem, network) |
//! | Resource limits | Ignored |
//! | File transfer | Local copies into the instance directory |
//! | Address resolution | Always loopback |
//!
//! # Path mapping
//!
//! Remote paths are interpreted relative to the instance directory: a push
//! to `/root/testlet` lands in `<instance-dir>/root/testlet`. Commands run
//! with the instance directory as their working directory, and absolute
//! path *arguments* are rebased the same way, approximating a chroot well
//! enough for payloads that address their own files absolutely. Programs
//! themselves come from the host (`sh`, `tar`, `sha256sum`, ...). The
//! instance directory is also exported to commands as `$CLEANROOM_ROOT`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Command, ExecOutput, Instance, Provider, ProviderError, ProviderResult};
use crate::config::InstanceConfig;

/// Configuration for the local provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalProviderConfig {
    /// Shell used to run commands. Default: `/bin/sh`.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Directory under which instance directories are created.
    ///
    /// When unset, a temporary directory owned by the provider is used
    /// and removed when the provider is dropped.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            root: None,
        }
    }
}

/// Bookkeeping record for one created instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    /// Instance name.
    pub name: String,

    /// Creation time.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Provider that realizes instances as host directories.
pub struct LocalProvider {
    config: LocalProviderConfig,
    root: PathBuf,
    // Owns the scratch root when none was configured.
    _scratch: Option<tempfile::TempDir>,
    instances: Arc<Mutex<HashMap<String, InstanceRecord>>>,
}

impl LocalProvider {
    /// Creates a new local provider.
    ///
    /// # Errors
    ///
    /// Fails when the configured root (or a temporary fallback) cannot
    /// be created.
    pub fn new(config: LocalProviderConfig) -> ProviderResult<Self> {
        let (root, scratch) = match &config.root {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                (path.clone(), None)
            }
            None => {
                let dir = tempfile::TempDir::with_prefix("cleanroom-")?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        Ok(Self {
            config,
            root,
            _scratch: scratch,
            instances: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Returns bookkeeping records for every instance created so far.
    pub async fn created(&self) -> Vec<InstanceRecord> {
        self.instances.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    type Instance = LocalInstance;

    async fn create(
        &self,
        name: &str,
        image: &str,
        config: &InstanceConfig,
    ) -> ProviderResult<LocalInstance> {
        let dir = self.root.join(name);
        if dir.exists() {
            return Err(ProviderError::CreateFailed(format!(
                "instance directory already exists: {}",
                dir.display()
            )));
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

        debug!(name, image, "created local instance at {}", dir.display());

        let record = InstanceRecord {
            name: name.to_string(),
            created_at: chrono::Utc::now(),
        };
        self.instances.lock().await.insert(name.to_string(), record);

        Ok(LocalInstance {
            name: name.to_string(),
            root: dir,
            shell: self.config.shell.clone(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }
}

/// An instance backed by a host directory.
#[derive(Debug)]
pub struct LocalInstance {
    name: String,
    root: PathBuf,
    shell: String,
    env: Vec<(String, String)>,
}

impl LocalInstance {
    /// Maps a remote path into the instance directory.
    fn host_path(&self, remote: &Path) -> PathBuf {
        match remote.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(remote),
        }
    }

    /// Rebases absolute path arguments into the instance directory.
    fn rebase_arg(&self, arg: &str) -> String {
        if arg.starts_with('/') {
            self.root.join(&arg[1..]).to_string_lossy().into_owned()
        } else {
            arg.to_string()
        }
    }
}

#[async_trait]
impl Instance for LocalInstance {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, cmd: &Command) -> ProviderResult<ExecOutput> {
        let rebased = Command {
            program: cmd.program.clone(),
            args: cmd.args.iter().map(|a| self.rebase_arg(a)).collect(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        };
        let shell_cmd = rebased.to_shell_string();
        debug!(instance = %self.name, "exec: {shell_cmd}");

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&shell_cmd);
        process.current_dir(&self.root);
        process.env("CLEANROOM_ROOT", &self.root);

        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(self.host_path(Path::new(dir)));
        }

        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let start = Instant::now();
        let child = process
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let output = match cmd.timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(ProviderError::Timeout(format!(
                            "command exceeded {secs}s: {shell_cmd}"
                        )));
                    }
                }
            }
            None => child.wait_with_output().await,
        }
        .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }

    async fn push(&self, local: &Path, remote: &Path) -> ProviderResult<()> {
        let dest = self.host_path(remote);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::PushFailed(e.to_string()))?;
        }

        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| ProviderError::PushFailed(e.to_string()))?;

        Ok(())
    }

    async fn pull(&self, remote: &Path, local: &Path) -> ProviderResult<()> {
        let src = self.host_path(remote);

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::PullFailed(e.to_string()))?;
        }

        tokio::fs::copy(&src, local)
            .await
            .map_err(|e| ProviderError::PullFailed(e.to_string()))?;

        Ok(())
    }

    async fn resolve_address(&self) -> ProviderResult<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn destroy(&self) -> ProviderResult<()> {
        if self.root.exists() {
            debug!(instance = %self.name, "destroying local instance");
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn instance(provider: &LocalProvider, name: &str) -> LocalInstance {
        provider
            .create(name, "scratch", &InstanceConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "exec-0").await;

        let out = inst.exec(&Command::new("echo").arg("hello")).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");

        let out = inst
            .exec(&Command::new("sh").arg("-c").arg("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_exec_applies_command_env() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "env-0").await;

        let out = inst
            .exec(
                &Command::new("sh")
                    .arg("-c")
                    .arg("printf %s \"$GREETING\"")
                    .env("GREETING", "hi"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi");
    }

    #[tokio::test]
    async fn test_absolute_paths_rebased_into_instance() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "rebase-0").await;

        let host = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(host.path(), b"payload").unwrap();
        inst.push(host.path(), Path::new("/root/in.txt"))
            .await
            .unwrap();

        let out = inst
            .exec(&Command::new("cat").arg("/root/in.txt"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn test_push_pull_roundtrip() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "xfer-0").await;

        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"round trip").unwrap();
        inst.push(src.path(), Path::new("/data/blob")).await.unwrap();

        let dest = tempfile::TempDir::new().unwrap();
        let local = dest.path().join("blob");
        inst.pull(Path::new("/data/blob"), &local).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"round trip");
    }

    #[tokio::test]
    async fn test_pull_missing_file_fails() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "missing-0").await;

        let dest = tempfile::TempDir::new().unwrap();
        let err = inst
            .pull(Path::new("/no/such/file"), &dest.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::PullFailed(_)));
    }

    #[tokio::test]
    async fn test_timeout_enforced_when_requested() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "slow-0").await;

        let err = inst
            .exec(&Command::new("sleep").arg("5").timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "gone-0").await;

        inst.destroy().await.unwrap();
        inst.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let _first = instance(&provider, "dup-0").await;

        let err = provider
            .create("dup-0", "scratch", &InstanceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CreateFailed(_)));
        assert_eq!(provider.created().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_address_is_loopback() {
        let provider = LocalProvider::new(LocalProviderConfig::default()).unwrap();
        let inst = instance(&provider, "addr-0").await;
        let addr = inst.resolve_address().await.unwrap();
        assert!(addr.is_loopback());
    }
}
