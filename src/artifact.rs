//! Artifact transfer between the host and test environments.
//!
//! An [`Artifact`] declares a source path, a destination path, a kind
//! (file or directory), and an overwrite policy. [`upload`] and
//! [`download`] validate the declaration against reality before any bytes
//! move: the source must exist and match the declared kind, and an
//! existing destination is fatal unless `overwrite` was requested.
//!
//! Directories travel as tar archives staged under `/root/.cleanroom`
//! inside the environment. Every transfer is integrity-checked: the
//! sending side computes a SHA-256 digest and the receiving side must
//! reproduce it, so a truncated or corrupted copy surfaces as
//! [`ArtifactError::ChecksumMismatch`] instead of a silently wrong file.
//!
//! # Example
//!
//! ```no_run
//! use cleanroom::artifact::{self, Artifact};
//! # async fn doc(instance: &impl cleanroom::provider::Instance) -> Result<(), artifact::ArtifactError> {
//! let conf = Artifact::file("./rendered/sssd.conf", "/root/.init/sssd.conf")
//!     .overwrite(true)
//!     .mode(0o600);
//! artifact::upload(&conf, instance).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::provider::{Command, Instance, ProviderError};

/// Remote staging directory for in-flight archives.
const STAGING_DIR: &str = "/root/.cleanroom";

/// What kind of filesystem object an artifact declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A single regular file.
    File,
    /// A directory tree, transferred recursively.
    Directory,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::File => write!(f, "file"),
            ArtifactKind::Directory => write!(f, "directory"),
        }
    }
}

/// Errors produced by artifact transfers.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The source does not exist.
    #[error("source {0} does not exist")]
    SourceMissing(PathBuf),

    /// The source's actual kind disagrees with the declared kind.
    #[error("{path} is not a {expected}")]
    TypeMismatch {
        /// Path whose kind was probed.
        path: PathBuf,
        /// Kind the artifact declared.
        expected: ArtifactKind,
    },

    /// The destination already exists and overwrite was not requested.
    #[error("{0} already exists and overwrite is disabled")]
    AlreadyExists(PathBuf),

    /// The received copy's digest does not match the sent digest.
    #[error("checksum mismatch transferring {0}")]
    ChecksumMismatch(PathBuf),

    /// Provider-level transfer failure, propagated without retry.
    #[error("transfer failed: {0}")]
    Transfer(#[from] ProviderError),

    /// Host-side I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file or directory transferable between host and environment.
///
/// The direction is decided by the operation ([`upload`] vs [`download`]),
/// not the artifact: `src` is always where the data is now, `dest` where
/// it should end up.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Source path (host side for uploads, environment side for
    /// downloads). `~` is expanded at construction.
    pub src: PathBuf,

    /// Destination path.
    pub dest: PathBuf,

    /// Declared kind; must match the source's actual kind at transfer
    /// time.
    pub kind: ArtifactKind,

    /// Allow replacing an existing destination.
    pub overwrite: bool,

    /// Mode bits applied to the destination after transfer.
    pub mode: Option<u32>,

    /// Owner applied to the destination after an upload.
    pub owner: Option<String>,

    /// Group applied to the destination after an upload.
    pub group: Option<String>,
}

impl Artifact {
    /// Declares a single-file artifact.
    pub fn file(src: impl AsRef<str>, dest: impl Into<PathBuf>) -> Self {
        Self::new(src, dest, ArtifactKind::File)
    }

    /// Declares a directory artifact.
    pub fn dir(src: impl AsRef<str>, dest: impl Into<PathBuf>) -> Self {
        Self::new(src, dest, ArtifactKind::Directory)
    }

    fn new(src: impl AsRef<str>, dest: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        let src = PathBuf::from(shellexpand::tilde(src.as_ref()).into_owned());
        Self {
            src,
            dest: dest.into(),
            kind,
            overwrite: false,
            mode: None,
            owner: None,
            group: None,
        }
    }

    /// Sets the overwrite policy.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Sets mode bits to apply after transfer.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the owner to apply after an upload.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Sets the group to apply after an upload.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Uploads an artifact from the host into an environment.
///
/// Validation happens before any bytes move: the source must exist on the
/// host and match the declared kind, and an existing destination inside
/// the environment fails with [`ArtifactError::AlreadyExists`] unless
/// overwrite was requested.
pub async fn upload<I: Instance + ?Sized>(
    artifact: &Artifact,
    instance: &I,
) -> Result<(), ArtifactError> {
    check_local_source(artifact)?;

    let dest = remote_str(&artifact.dest);
    if !artifact.overwrite && remote_exists(instance, &dest).await? {
        return Err(ArtifactError::AlreadyExists(artifact.dest.clone()));
    }

    debug!(
        src = %artifact.src.display(),
        dest = %dest,
        kind = %artifact.kind,
        "uploading artifact to {}",
        instance.name()
    );

    match artifact.kind {
        ArtifactKind::File => {
            let digest = sha256_file(&artifact.src)?;
            instance.push(&artifact.src, &artifact.dest).await?;
            let received = remote_sha256(instance, &dest).await?;
            if received != digest {
                return Err(ArtifactError::ChecksumMismatch(artifact.dest.clone()));
            }
        }
        ArtifactKind::Directory => {
            let archive = pack_dir(&artifact.src)?;
            let digest = sha256_file(archive.path())?;
            let staged = stage_path();

            instance.push(archive.path(), Path::new(&staged)).await?;
            let received = remote_sha256(instance, &staged).await?;
            if received != digest {
                return Err(ArtifactError::ChecksumMismatch(artifact.dest.clone()));
            }

            run_remote(
                instance,
                Command::new("mkdir").arg("-p").arg(dest.as_str()),
            )
            .await?;
            run_remote(
                instance,
                Command::new("tar").arg("-xf").arg(staged.as_str()).arg("-C").arg(dest.as_str()),
            )
            .await?;
            // Best-effort staging cleanup.
            let _ = instance.exec(&Command::new("rm").arg("-f").arg(staged.as_str())).await;
        }
    }

    apply_remote_attributes(artifact, instance, &dest).await
}

/// Downloads an artifact from an environment onto the host.
///
/// Validation happens before any bytes move: the source must exist inside
/// the environment and match the declared kind (probed with `test -f` /
/// `test -d` through the adapter), and an existing host destination fails
/// with [`ArtifactError::AlreadyExists`] unless overwrite was requested.
/// The received bytes are verified against the environment-side digest
/// before the destination is touched.
pub async fn download<I: Instance + ?Sized>(
    artifact: &Artifact,
    instance: &I,
) -> Result<(), ArtifactError> {
    let src = remote_str(&artifact.src);
    check_remote_source(artifact, instance, &src).await?;

    if artifact.dest.exists() && !artifact.overwrite {
        return Err(ArtifactError::AlreadyExists(artifact.dest.clone()));
    }

    debug!(
        src = %src,
        dest = %artifact.dest.display(),
        kind = %artifact.kind,
        "downloading artifact from {}",
        instance.name()
    );

    let scratch = tempfile::TempDir::with_prefix("cleanroom-pull-")?;

    match artifact.kind {
        ArtifactKind::File => {
            let expected = remote_sha256(instance, &src).await?;
            let staged = scratch.path().join("payload");
            instance.pull(&artifact.src, &staged).await?;
            if sha256_file(&staged)? != expected {
                return Err(ArtifactError::ChecksumMismatch(artifact.src.clone()));
            }
            if let Some(parent) = artifact.dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&staged, &artifact.dest)?;
        }
        ArtifactKind::Directory => {
            let remote_archive = stage_path();
            run_remote(
                instance,
                Command::new("mkdir").arg("-p").arg(STAGING_DIR),
            )
            .await?;
            run_remote(
                instance,
                Command::new("tar")
                    .arg("-cf")
                    .arg(remote_archive.as_str())
                    .arg("-C")
                    .arg(src.as_str())
                    .arg("."),
            )
            .await?;
            let expected = remote_sha256(instance, &remote_archive).await?;

            let staged = scratch.path().join("archive.tar");
            instance.pull(Path::new(&remote_archive), &staged).await?;
            let _ = instance
                .exec(&Command::new("rm").arg("-f").arg(remote_archive.as_str()))
                .await;

            if sha256_file(&staged)? != expected {
                return Err(ArtifactError::ChecksumMismatch(artifact.src.clone()));
            }

            std::fs::create_dir_all(&artifact.dest)?;
            unpack_dir(&staged, &artifact.dest)?;
        }
    }

    if let Some(mode) = artifact.mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&artifact.dest, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}

/// Validates the host-side source before an upload.
fn check_local_source(artifact: &Artifact) -> Result<(), ArtifactError> {
    if !artifact.src.exists() {
        return Err(ArtifactError::SourceMissing(artifact.src.clone()));
    }
    let matches = match artifact.kind {
        ArtifactKind::File => artifact.src.is_file(),
        ArtifactKind::Directory => artifact.src.is_dir(),
    };
    if !matches {
        return Err(ArtifactError::TypeMismatch {
            path: artifact.src.clone(),
            expected: artifact.kind,
        });
    }
    Ok(())
}

/// Validates the environment-side source before a download.
async fn check_remote_source<I: Instance + ?Sized>(
    artifact: &Artifact,
    instance: &I,
    src: &str,
) -> Result<(), ArtifactError> {
    let flag = match artifact.kind {
        ArtifactKind::File => "-f",
        ArtifactKind::Directory => "-d",
    };
    let probe = instance
        .exec(&Command::new("test").arg(flag).arg(src))
        .await?;
    if probe.success() {
        return Ok(());
    }
    if remote_exists(instance, src).await? {
        Err(ArtifactError::TypeMismatch {
            path: artifact.src.clone(),
            expected: artifact.kind,
        })
    } else {
        Err(ArtifactError::SourceMissing(artifact.src.clone()))
    }
}

async fn apply_remote_attributes<I: Instance + ?Sized>(
    artifact: &Artifact,
    instance: &I,
    dest: &str,
) -> Result<(), ArtifactError> {
    if let Some(mode) = artifact.mode {
        run_remote(
            instance,
            Command::new("chmod").arg("-R").arg(format!("{mode:o}")).arg(dest),
        )
        .await?;
    }
    if artifact.owner.is_some() || artifact.group.is_some() {
        let spec = format!(
            "{}:{}",
            artifact.owner.as_deref().unwrap_or(""),
            artifact.group.as_deref().unwrap_or("")
        );
        run_remote(
            instance,
            Command::new("chown").arg("-R").arg(spec).arg(dest),
        )
        .await?;
    }
    Ok(())
}

async fn remote_exists<I: Instance + ?Sized>(
    instance: &I,
    path: &str,
) -> Result<bool, ArtifactError> {
    let probe = instance
        .exec(&Command::new("test").arg("-e").arg(path))
        .await?;
    Ok(probe.success())
}

/// Runs a command inside the environment, treating nonzero exit as a
/// transfer failure.
async fn run_remote<I: Instance + ?Sized>(
    instance: &I,
    cmd: Command,
) -> Result<(), ArtifactError> {
    let rendered = cmd.to_shell_string();
    let output = instance.exec(&cmd).await?;
    if !output.success() {
        return Err(ArtifactError::Transfer(ProviderError::ExecFailed(format!(
            "{rendered} exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        ))));
    }
    Ok(())
}

/// Computes the digest of a file inside the environment.
async fn remote_sha256<I: Instance + ?Sized>(
    instance: &I,
    path: &str,
) -> Result<String, ArtifactError> {
    let output = instance
        .exec(&Command::new("sha256sum").arg(path))
        .await?;
    if !output.success() {
        return Err(ArtifactError::Transfer(ProviderError::ExecFailed(format!(
            "sha256sum {path} exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        ))));
    }
    output
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| {
            ArtifactError::Transfer(ProviderError::ExecFailed(format!(
                "sha256sum {path} produced no digest"
            )))
        })
}

fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Packs a directory into a plain tar archive on the host.
fn pack_dir(src: &Path) -> Result<tempfile::NamedTempFile, ArtifactError> {
    let archive = tempfile::NamedTempFile::with_prefix("cleanroom-push-")?;
    let mut builder = tar::Builder::new(archive.reopen()?);
    builder.append_dir_all(".", src)?;
    builder.finish()?;
    Ok(archive)
}

/// Unpacks a tar archive into a host directory.
fn unpack_dir(archive: &Path, dest: &Path) -> Result<(), ArtifactError> {
    let file = std::fs::File::open(archive)?;
    let mut reader = tar::Archive::new(file);
    reader.unpack(dest)?;
    Ok(())
}

/// Names a unique remote staging file.
fn stage_path() -> String {
    format!("{STAGING_DIR}/xfer-{}.tar", uuid::Uuid::new_v4())
}

fn remote_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
