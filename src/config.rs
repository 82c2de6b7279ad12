//! Configuration types for cleanroom orchestration runs.
//!
//! Every orchestration run owns its configuration as an explicit value:
//! there is no ambient registry or process-global state. A [`Config`] is
//! built in code or loaded from TOML and handed to the
//! [`Runner`](crate::Runner) or [`Archon`](crate::Archon) constructor.
//!
//! # TOML Structure
//!
//! ```toml
//! [engine]
//! max_workers = 4
//! preserve = false
//!
//! [engine.env]
//! CLEANROOM_TEST = "1"
//!
//! [instance]
//! privileged = true
//!
//! [instance.resources]
//! cpu = 1.0
//! memory = 8_000_000_000
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable consulted for the worker-pool size.
///
/// Read once, at [`Runner`](crate::Runner) construction.
pub const MAX_WORKERS_ENV: &str = "CLEANROOM_MAX_WORKERS";

/// Root configuration for one orchestration run.
///
/// # Example
///
/// ```
/// use cleanroom::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [engine]
///     preserve = true
/// "#).unwrap();
///
/// assert!(config.engine.preserve);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Engine settings (parallelism, preservation, shared environment).
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default instance settings applied to every environment.
    #[serde(default)]
    pub instance: InstanceConfig,
}

/// Core engine settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `max_workers` | unset (environment override, then host parallelism) |
/// | `preserve` | false |
/// | `env` | empty |
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum number of environments driven concurrently.
    ///
    /// When unset, the [`MAX_WORKERS_ENV`] environment variable is
    /// consulted, then the host's available parallelism.
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Keep environments alive after their terminal state.
    ///
    /// Preserved environments remain reachable by name for manual
    /// inspection; the caller is responsible for eventually destroying
    /// them.
    #[serde(default)]
    pub preserve: bool,

    /// Environment variables applied to every remote command.
    ///
    /// Merged beneath command-specific variables, which take precedence.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Configuration for a single environment instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Resource limits requested from the provider.
    #[serde(default)]
    pub resources: InstanceResources,

    /// Run the instance privileged.
    ///
    /// Required by some workloads (nested mounts, device access); what it
    /// means concretely is up to the provider.
    #[serde(default)]
    pub privileged: bool,

    /// Instance-level environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Resource limits for an environment instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstanceResources {
    /// CPU limit in cores (fractional allowed).
    #[serde(default)]
    pub cpu: Option<f64>,

    /// Memory limit in bytes.
    #[serde(default)]
    pub memory: Option<u64>,
}

/// Descriptor for one named environment.
///
/// Names are unique within a run; the provider realizes the image with
/// the attached [`InstanceConfig`].
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Name, unique within the orchestration run that owns it.
    pub name: String,

    /// Image reference understood by the provider.
    pub image: String,

    /// Instance configuration.
    pub config: InstanceConfig,
}

impl EnvironmentSpec {
    /// Creates a descriptor with default instance configuration.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            config: InstanceConfig::default(),
        }
    }

    /// Replaces the instance configuration.
    pub fn with_config(mut self, config: InstanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds one descriptor per image, named `<base>-<image>`.
    ///
    /// Convenience for fanning one testlet out across several
    /// distribution images.
    ///
    /// # Example
    ///
    /// ```
    /// use cleanroom::config::EnvironmentSpec;
    ///
    /// let envs = EnvironmentSpec::per_image("smoke", ["jammy", "noble"]);
    /// assert_eq!(envs[0].name, "smoke-jammy");
    /// assert_eq!(envs[1].image, "noble");
    /// ```
    pub fn per_image<I, S>(base: &str, images: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        images
            .into_iter()
            .map(|image| {
                let image = image.into();
                Self::new(format!("{base}-{image}"), image)
            })
            .collect()
    }
}

/// Resolves the worker-pool size for a run.
///
/// Precedence: an explicit configuration value, then [`MAX_WORKERS_ENV`],
/// then the host's available parallelism. Zero and unparseable values are
/// ignored.
pub fn worker_count(explicit: Option<usize>) -> usize {
    if let Some(n) = explicit {
        if n >= 1 {
            return n;
        }
    }
    if let Ok(value) = std::env::var(MAX_WORKERS_ENV) {
        if let Ok(n) = value.trim().parse::<usize>() {
            if n >= 1 {
                return n;
            }
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or
/// does not match the schema.
///
/// # Example
///
/// ```no_run
/// use cleanroom::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("cleanroom.toml"))?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// Useful for testing or embedding configuration programmatically.
///
/// # Example
///
/// ```
/// use cleanroom::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [engine]
///     max_workers = 2
/// "#)?;
///
/// assert_eq!(config.engine.max_workers, Some(2));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.engine.max_workers, None);
        assert!(!config.engine.preserve);
        assert!(config.engine.env.is_empty());
        assert!(!config.instance.privileged);
        assert!(config.instance.resources.cpu.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let config = load_config_str(
            r#"
            [engine]
            max_workers = 3
            preserve = true

            [engine.env]
            LANG = "C"

            [instance]
            privileged = true

            [instance.resources]
            cpu = 0.5
            memory = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.max_workers, Some(3));
        assert!(config.engine.preserve);
        assert_eq!(config.engine.env.get("LANG").unwrap(), "C");
        assert!(config.instance.privileged);
        assert_eq!(config.instance.resources.cpu, Some(0.5));
        assert_eq!(config.instance.resources.memory, Some(1048576));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(load_config_str("[engine\nmax_workers = ").is_err());
    }

    #[test]
    fn test_worker_count_explicit_wins() {
        assert_eq!(worker_count(Some(7)), 7);
    }

    #[test]
    fn test_worker_count_zero_ignored() {
        assert!(worker_count(Some(0)) >= 1);
    }

    #[test]
    fn test_per_image_naming() {
        let envs = EnvironmentSpec::per_image("test", ["jammy", "noble", "focal"]);
        assert_eq!(envs.len(), 3);
        assert_eq!(envs[0].name, "test-jammy");
        assert_eq!(envs[2].image, "focal");
    }
}
