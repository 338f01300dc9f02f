//! Local mount and unmount operations.
//!
//! The node service mounts BeeGFS once per staged volume and bind-mounts
//! it into workloads; the controller mounts briefly to change ownership.
//! Both go through [`Mounter`] so tests can run without privileges.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use libcsi::CsiError;
use nix::mount::{MntFlags, MsFlags};
use tracing::{debug, info, instrument};

/// File system type registered by the BeeGFS client module.
pub const BEEGFS_FS_TYPE: &str = "beegfs";
/// The client module ignores the mount source.
const BEEGFS_SOURCE: &str = "beegfs_nodev";

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether `path` is a mount point.
    async fn is_mounted(&self, path: &Path) -> Result<bool, CsiError>;

    /// Mount the file system described by `conf_path` at `mount_point`.
    async fn mount_beegfs(
        &self,
        conf_path: &Path,
        mount_point: &Path,
        flags: &[String],
    ) -> Result<(), CsiError>;

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
    -> Result<(), CsiError>;

    async fn unmount(&self, path: &Path) -> Result<(), CsiError>;
}

/// [`Mounter`] backed by `mount(2)` and `/proc/self/mounts`.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    timeout: Duration,
}

impl SystemMounter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a blocking mount syscall off the runtime, bounded by the timeout.
    async fn run<F>(&self, path: &Path, op: F) -> Result<(), CsiError>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(op)).await {
            Ok(Ok(result)) => result.map_err(|reason| CsiError::MountFailed {
                path: path.display().to_string(),
                reason,
            }),
            Ok(Err(e)) => Err(CsiError::internal(e)),
            Err(_) => Err(CsiError::DeadlineExceeded(format!(
                "mount operation on {} after {:?}",
                path.display(),
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mounted(&self, path: &Path) -> Result<bool, CsiError> {
        let mounts = tokio::fs::read_to_string("/proc/self/mounts")
            .await
            .map_err(CsiError::internal)?;
        Ok(mount_table_contains(&mounts, path))
    }

    #[instrument(skip(self, flags), fields(conf = %conf_path.display(), mount_point = %mount_point.display()))]
    async fn mount_beegfs(
        &self,
        conf_path: &Path,
        mount_point: &Path,
        flags: &[String],
    ) -> Result<(), CsiError> {
        let (ms_flags, data) = mount_options(conf_path, flags);
        let target = mount_point.to_path_buf();
        debug!(%data, "mounting beegfs");
        self.run(mount_point, move || {
            nix::mount::mount(
                Some(BEEGFS_SOURCE),
                &target,
                Some(BEEGFS_FS_TYPE),
                ms_flags,
                Some(data.as_str()),
            )
            .map_err(|e| e.to_string())
        })
        .await?;
        info!("beegfs mounted");
        Ok(())
    }

    #[instrument(skip(self), fields(source = %source.display(), target = %target.display()))]
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let src = source.to_path_buf();
        let dst = target.to_path_buf();
        self.run(target, move || bind(&src, &dst, read_only)).await?;
        info!(read_only, "bind mount created");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        let target = path.to_path_buf();
        match tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || nix::mount::umount2(&target, MntFlags::empty())),
        )
        .await
        {
            Ok(Ok(Ok(()))) => {
                info!("unmounted");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(CsiError::UnmountFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(CsiError::internal(e)),
            Err(_) => Err(CsiError::DeadlineExceeded(format!(
                "unmount of {} after {:?}",
                path.display(),
                self.timeout
            ))),
        }
    }
}

fn bind(source: &Path, target: &Path, read_only: bool) -> Result<(), String> {
    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| e.to_string())?;
    // The kernel ignores MS_RDONLY on the initial bind.
    if read_only {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| format!("remount read-only: {e}"))?;
    }
    Ok(())
}

/// Split capability mount flags into kernel flags and file system options.
///
/// `cfgFile=` always comes first in the option string.
fn mount_options(conf_path: &Path, flags: &[String]) -> (MsFlags, String) {
    let mut ms_flags = MsFlags::empty();
    let mut data = format!("cfgFile={}", conf_path.display());
    for flag in flags {
        let known = match flag.as_str() {
            "ro" => Some(MsFlags::MS_RDONLY),
            "noatime" => Some(MsFlags::MS_NOATIME),
            "nodiratime" => Some(MsFlags::MS_NODIRATIME),
            "relatime" => Some(MsFlags::MS_RELATIME),
            "nosuid" => Some(MsFlags::MS_NOSUID),
            "nodev" => Some(MsFlags::MS_NODEV),
            "noexec" => Some(MsFlags::MS_NOEXEC),
            "rw" | "defaults" => Some(MsFlags::empty()),
            _ => None,
        };
        match known {
            Some(bit) => ms_flags |= bit,
            None => {
                data.push(',');
                data.push_str(flag);
            }
        }
    }
    (ms_flags, data)
}

/// Whether `/proc/self/mounts` content lists `path` as a mount point.
fn mount_table_contains(mounts: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    let wanted = match wanted.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|field| unescape_mount_field(field) == wanted)
}

/// Undo the octal escapes (`\040` for space, ...) used in the mount table.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        // One byte per escape: `\000` through `\377`.
        let escape = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\'
                && (b'0'..=b'3').contains(&digits[0])
                && digits[1..].iter().all(|d| (b'0'..=b'7').contains(d))
        });
        match escape {
            Some(digits) => {
                out.push(digits.iter().fold(0u8, |acc, d| acc * 8 + (d - b'0')));
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
