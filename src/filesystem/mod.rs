// hanadiskbackup/src/filesystem/mod.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::errors::{BackupError, Result, Service};
use crate::utils::backoff::with_timeout;
use crate::utils::find_executable;

/// OS-level write suspension of a mount point.
#[async_trait]
pub trait FilesystemControl: Send + Sync {
    async fn freeze(&self, mount: &Path) -> Result<()>;
    async fn unfreeze(&self, mount: &Path) -> Result<()>;
}

/// `fsfreeze -f` / `fsfreeze -u`.
pub struct FsFreeze {
    binary: PathBuf,
}

impl FsFreeze {
    pub fn locate() -> Result<Self> {
        let binary = find_executable("fsfreeze").map_err(|e| BackupError::Precondition(e.to_string()))?;
        Ok(Self { binary })
    }

    async fn run(&self, flag: &str, mount: &Path) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg(flag)
            .arg(mount)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BackupError::external(
                    Service::Filesystem,
                    format!("Failed to execute {} {flag} {}: {e}", self.binary.display(), mount.display()),
                )
            })?;
        if !output.status.success() {
            return Err(BackupError::external(
                Service::Filesystem,
                format!(
                    "fsfreeze {flag} {} failed with status: {}\nStderr: {}",
                    mount.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FilesystemControl for FsFreeze {
    async fn freeze(&self, mount: &Path) -> Result<()> {
        self.run("-f", mount).await
    }

    /// EINVAL from `-u` means the mount is not frozen, which is the state
    /// a thaw wants.
    async fn unfreeze(&self, mount: &Path) -> Result<()> {
        match self.run("-u", mount).await {
            Err(BackupError::ExternalService { message, .. }) if message.contains("Invalid argument") => {
                warn!(mount = %mount.display(), "Filesystem was not frozen");
                Ok(())
            }
            other => other,
        }
    }
}

/// Tracks whether this run may hold a freeze on the mount, and for how long.
/// A freeze that failed or timed out still counts, since the kernel freeze
/// can take effect before the call returns.
pub struct FreezeController<'a> {
    control: &'a dyn FilesystemControl,
    mount: PathBuf,
    timeout: Duration,
    frozen_at: Option<Instant>,
}

impl<'a> FreezeController<'a> {
    pub fn new(control: &'a dyn FilesystemControl, mount: &Path, timeout: Duration) -> Self {
        Self {
            control,
            mount: mount.to_path_buf(),
            timeout,
            frozen_at: None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen_at.is_some()
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    pub async fn freeze(&mut self) -> Result<()> {
        info!(mount = %self.mount.display(), "Freezing filesystem");
        self.frozen_at = Some(Instant::now());
        with_timeout(Service::Filesystem, self.timeout, "filesystem freeze", self.control.freeze(&self.mount)).await
    }

    /// Thaws the mount if this controller tried to freeze it; returns the freeze
    /// window. A failed thaw leaves the controller frozen so a later
    /// attempt still runs.
    pub async fn unfreeze(&mut self) -> Result<Option<Duration>> {
        let Some(frozen_at) = self.frozen_at else {
            return Ok(None);
        };
        info!(mount = %self.mount.display(), "Unfreezing filesystem");
        match with_timeout(
            Service::Filesystem,
            self.timeout,
            "filesystem unfreeze",
            self.control.unfreeze(&self.mount),
        )
        .await
        {
            Ok(()) => {
                self.frozen_at = None;
                Ok(Some(frozen_at.elapsed()))
            }
            Err(e) => {
                error!(mount = %self.mount.display(), error = %e, "Failed to unfreeze filesystem");
                Err(e)
            }
        }
    }
}
