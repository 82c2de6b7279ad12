//! cleanroom: run test logic in ephemeral, disposable compute environments.
//!
//! This crate provisions container/VM test environments through a
//! pluggable provider, injects self-contained test payloads ("testlets")
//! into them, executes those payloads, and returns structured results —
//! letting you validate code against real operating-system state without
//! touching your own machine.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **[`testlet`]**: Package a unit of test logic into an injectable
//!   script
//! - **[`artifact`]**: Move files and directories between host and
//!   environment, with validation and integrity checks
//! - **[`hooks`]**: Named, ordered actions around an environment's start
//!   and stop transitions
//! - **[`provider`]**: The capability boundary any environment backend
//!   implements
//! - **[`harness`]**: Drive one environment through its full lifecycle
//!   for one testlet
//! - **[`runner`]**: Fan a harness out across many environments with
//!   bounded parallelism
//! - **[`archon`]**: Direct topologies of named, interdependent
//!   environments
//!
//! # Example
//!
//! ```no_run
//! use cleanroom::config::{Config, EnvironmentSpec};
//! use cleanroom::hooks::HookRegistry;
//! use cleanroom::provider::local::{LocalProvider, LocalProviderConfig};
//! use cleanroom::runner::Runner;
//! use cleanroom::testlet::Testlet;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = LocalProvider::new(LocalProviderConfig::default())?;
//!     let config = Config::default();
//!     let hooks = HookRegistry::new();
//!
//!     let runner = Runner::new(&provider, &config, &hooks);
//!     let results = runner
//!         .run(
//!             &Testlet::inline("smoke", "echo ok"),
//!             &EnvironmentSpec::per_image("smoke", ["jammy", "noble"]),
//!         )
//!         .await;
//!
//!     for (name, outcome) in results {
//!         println!("{name}: {:?}", outcome.map(|o| o.result.exit_code));
//!     }
//!     Ok(())
//! }
//! ```

pub mod archon;
pub mod artifact;
pub mod config;
pub mod harness;
pub mod hooks;
pub mod pkg;
pub mod provider;
pub mod runner;
pub mod testlet;

// Re-export commonly used types
pub use archon::Archon;
pub use artifact::{Artifact, ArtifactKind};
pub use config::{Config, EnvironmentSpec, load_config};
pub use harness::{Harness, HarnessError, HarnessOutcome, Phase};
pub use hooks::{HookRegistry, StartHook, StopHook};
pub use provider::{Instance, Provider};
pub use runner::Runner;
pub use testlet::{Testlet, TestletResult};
