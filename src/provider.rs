//! Provider Adapter traits for test environment backends.
//!
//! This module defines the capability boundary between the cleanroom engine
//! and whatever hypervisor actually realizes test environments. The engine
//! never talks to a container or VM API directly; it drives a [`Provider`]
//! that creates [`Instance`]s, and every lifecycle step (execute a command,
//! push a file, pull a file, resolve an address, destroy) goes through the
//! instance handle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Provider                              │
//! │  (realizes environments)                                    │
//! │                                                              │
//! │  create(name, image, config) ──────────► Instance           │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Instance                              │
//! │  (one live test environment)                                │
//! │                                                              │
//! │  exec(Command) ───► ExecOutput                              │
//! │  push(local, remote)                                        │
//! │  pull(remote, local)                                        │
//! │  resolve_address() ───► IpAddr                              │
//! │  destroy()                                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Directory-rooted pseudo-instances on the host |
//!
//! The local provider exists so the engine (and its test suite) can run
//! without a hypervisor. Any backend implementing this capability set —
//! LXD, Docker, a cloud VM API — is usable without changes to the engine.
//!
//! # Implementing a Custom Provider
//!
//! ```no_run
//! use std::net::IpAddr;
//! use std::path::Path;
//!
//! use async_trait::async_trait;
//! use cleanroom::config::InstanceConfig;
//! use cleanroom::provider::*;
//!
//! struct LxdInstance { /* ... */ }
//!
//! #[async_trait]
//! impl Instance for LxdInstance {
//!     fn name(&self) -> &str { todo!() }
//!     async fn exec(&self, cmd: &Command) -> ProviderResult<ExecOutput> { todo!() }
//!     async fn push(&self, local: &Path, remote: &Path) -> ProviderResult<()> { todo!() }
//!     async fn pull(&self, remote: &Path, local: &Path) -> ProviderResult<()> { todo!() }
//!     async fn resolve_address(&self) -> ProviderResult<IpAddr> { todo!() }
//!     async fn destroy(&self) -> ProviderResult<()> { todo!() }
//! }
//!
//! struct LxdProvider { /* ... */ }
//!
//! #[async_trait]
//! impl Provider for LxdProvider {
//!     type Instance = LxdInstance;
//!     async fn create(
//!         &self,
//!         name: &str,
//!         image: &str,
//!         config: &InstanceConfig,
//!     ) -> ProviderResult<Self::Instance> { todo!() }
//! }
//! ```
//!
//! # Error Handling
//!
//! All provider operations return [`ProviderResult<T>`], wrapping a
//! [`ProviderError`]. The engine treats these as opaque: a failed provider
//! call aborts the lifecycle step that issued it and is surfaced to the
//! caller with the phase it happened in.

pub mod local;

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::InstanceConfig;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// A command that runs but exits nonzero is NOT a provider error — it is a
/// normal [`ExecOutput`]. These variants indicate the operation itself
/// could not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Failed to realize a new environment instance.
    ///
    /// Common causes: unknown image, insufficient resources, auth failure.
    #[error("failed to create instance: {0}")]
    CreateFailed(String),

    /// Failed to start a command or communicate with a running one.
    #[error("failed to execute command: {0}")]
    ExecFailed(String),

    /// Failed to push a file into the instance.
    #[error("failed to push file: {0}")]
    PushFailed(String),

    /// Failed to pull a file out of the instance.
    #[error("failed to pull file: {0}")]
    PullFailed(String),

    /// The named instance does not exist (never created, or destroyed).
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Failed to establish or maintain a connection to the backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation exceeded a caller-imposed deadline.
    ///
    /// The engine imposes no deadline of its own; this only occurs when a
    /// [`Command`] carries an explicit timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The instance has no resolvable public address.
    #[error("no address available: {0}")]
    AddressUnavailable(String),

    /// I/O error during file operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific error not covered by other variants.
    #[error("provider error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A command to execute inside a test environment instance.
///
/// Built with a fluent API and rendered to a shell string by the provider.
///
/// # Example
///
/// ```
/// use cleanroom::provider::Command;
///
/// let cmd = Command::new("apt-get")
///     .arg("install")
///     .arg("-y")
///     .args(["curl", "jq"])
///     .env("DEBIAN_FRONTEND", "noninteractive");
///
/// assert_eq!(cmd.program, "apt-get");
/// assert_eq!(cmd.args.len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory inside the instance.
    ///
    /// If `None`, the instance's default working directory is used.
    pub working_dir: Option<String>,

    /// Environment variables set for this command.
    ///
    /// Merged with (and overriding) the instance's environment.
    pub env: Vec<(String, String)>,

    /// Optional deadline in seconds.
    ///
    /// The engine never sets this; a caller that wants bounded execution
    /// sets it explicitly and receives [`ProviderError::Timeout`] when it
    /// elapses.
    pub timeout_secs: Option<u64>,
}

impl Command {
    /// Creates a new command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Extends the command environment from an iterator of pairs.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets an execution deadline in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Renders the command as a shell-executable string.
    ///
    /// The program and arguments are escaped for shell execution.
    ///
    /// # Example
    ///
    /// ```
    /// use cleanroom::provider::Command;
    ///
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Captured outcome of one command executed inside an instance.
///
/// Exit code plus both output streams; enough to diagnose a failure
/// without inspecting the environment directly.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code of the command. By convention 0 means success.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took.
    pub duration: Duration,
}

impl ExecOutput {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One live test environment.
///
/// An instance is exclusively owned by the [`Harness`](crate::Harness) or
/// [`Archon`](crate::Archon) that created it; no two orchestration units
/// may operate on the same named instance concurrently. Every method is a
/// blocking I/O boundary — the calling task suspends until the backend
/// answers.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Returns the instance name, unique within one orchestration run.
    fn name(&self) -> &str;

    /// Executes a command and blocks until it completes.
    ///
    /// Captures the exit code and both output streams. A nonzero exit code
    /// is a successful `exec` — only a command that could not run at all
    /// is an error.
    async fn exec(&self, cmd: &Command) -> ProviderResult<ExecOutput>;

    /// Copies a single file from the host into the instance.
    ///
    /// Parent directories on the instance side are created as needed.
    /// Higher-level semantics (directories, overwrite policy, integrity)
    /// live in [`artifact`](crate::artifact), not here.
    async fn push(&self, local: &Path, remote: &Path) -> ProviderResult<()>;

    /// Copies a single file from the instance onto the host.
    async fn pull(&self, remote: &Path, local: &Path) -> ProviderResult<()>;

    /// Returns the instance's resolved public address.
    ///
    /// # Errors
    ///
    /// [`ProviderError::AddressUnavailable`] if the instance has not been
    /// assigned one (yet).
    async fn resolve_address(&self) -> ProviderResult<IpAddr>;

    /// Destroys the instance and releases its resources.
    ///
    /// Idempotent: destroying an already-destroyed instance is not an
    /// error.
    async fn destroy(&self) -> ProviderResult<()>;
}

/// Factory for test environment instances.
///
/// A `Provider` represents one backend (local directories, LXD, a cloud
/// API) and realizes [`Instance`]s on demand. Providers must be shareable
/// across tasks: the Parallel Runner drives one provider from several
/// workers at once.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The concrete instance type realized by this provider.
    type Instance: Instance;

    /// Creates a new instance from the given image.
    ///
    /// The instance is running and reachable when this returns.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::CreateFailed`] — the backend rejected the request
    /// - [`ProviderError::Connection`] — the backend is unreachable
    async fn create(
        &self,
        name: &str,
        image: &str,
        config: &InstanceConfig,
    ) -> ProviderResult<Self::Instance>;
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
