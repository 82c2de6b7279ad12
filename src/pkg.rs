//! Package-install actions for start hooks.
//!
//! Installation runs as an ordinary remote command through the Provider
//! Adapter; the engine judges the outcome uniformly by exit code and has
//! no knowledge of the package manager beyond the command line it emits.

use serde::{Deserialize, Serialize};

use crate::provider::Command;

/// A package manager available inside a test environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian/Ubuntu `apt-get`.
    Apt,
    /// Snapcraft `snap`.
    Snap,
    /// Python `pip`, invoked through `python3 -m pip`.
    Pip,
    /// Fedora/RHEL `dnf`.
    Dnf,
    /// Arch `pacman`.
    Pacman,
}

/// A set of packages to install with one manager.
///
/// # Example
///
/// ```
/// use cleanroom::pkg::{Package, PackageManager};
///
/// let action = Package::new(PackageManager::Apt, ["slurmd", "munge"]);
/// assert_eq!(
///     action.install_command().to_shell_string(),
///     "apt-get install -y slurmd munge"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Package {
    /// Manager that performs the installation.
    pub manager: PackageManager,

    /// Package names, passed through verbatim.
    pub packages: Vec<String>,
}

impl Package {
    /// Creates an install action.
    pub fn new<I, S>(manager: PackageManager, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            manager,
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the remote command that performs the installation.
    ///
    /// Non-interactive flags are always passed; a hook that needs
    /// anything fancier should upload and run its own script instead.
    pub fn install_command(&self) -> Command {
        match self.manager {
            PackageManager::Apt => Command::new("apt-get")
                .arg("install")
                .arg("-y")
                .args(self.packages.clone())
                .env("DEBIAN_FRONTEND", "noninteractive"),
            PackageManager::Snap => Command::new("snap")
                .arg("install")
                .args(self.packages.clone()),
            PackageManager::Pip => Command::new("python3")
                .arg("-m")
                .arg("pip")
                .arg("install")
                .args(self.packages.clone()),
            PackageManager::Dnf => Command::new("dnf")
                .arg("install")
                .arg("-y")
                .args(self.packages.clone()),
            PackageManager::Pacman => Command::new("pacman")
                .arg("-S")
                .arg("--noconfirm")
                .args(self.packages.clone()),
        }
    }
}
