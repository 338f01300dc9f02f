//! Directory management through `beegfs-ctl`.
//!
//! Every call runs against a specific client configuration file and with
//! `--unmounted`, so the controller never needs the file system mounted to
//! create a directory or set its stripe pattern.  The tool reports failures
//! only as text; [`classify`] turns the two conditions callers recover from
//! into typed errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::params::StripePatternSpec;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CtlError {
    #[error("entry does not exist: {0}")]
    NotExist(String),
    #[error("entry exists already: {0}")]
    Exist(String),
    #[error("beegfs-ctl failed: {0}")]
    Failed(String),
    #[error("beegfs-ctl did not finish within {0:?}")]
    Timeout(Duration),
    #[error("spawn {binary}: {reason}")]
    Spawn { binary: String, reason: String },
}

/// Turn the output of a failed invocation into an error.
pub fn classify(output: &str) -> CtlError {
    let output = output.trim().to_owned();
    if output.contains("does not exist") {
        CtlError::NotExist(output)
    } else if output.contains("exists already") {
        CtlError::Exist(output)
    } else {
        CtlError::Failed(output)
    }
}

/// Runs `beegfs-ctl` with a given client configuration.
#[async_trait]
pub trait CtlExecutor: Send + Sync {
    /// Run the tool with `--cfgFile=<conf_path>` followed by `args` and
    /// return its standard output.
    async fn execute(&self, conf_path: &Path, args: &[String]) -> Result<String, CtlError>;
}

/// [`CtlExecutor`] that spawns the real binary.
#[derive(Debug, Clone)]
pub struct BeegfsCtl {
    binary: PathBuf,
    timeout: Duration,
}

impl BeegfsCtl {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CtlExecutor for BeegfsCtl {
    #[instrument(skip(self, conf_path), fields(conf = %conf_path.display()))]
    async fn execute(&self, conf_path: &Path, args: &[String]) -> Result<String, CtlError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("--cfgFile={}", conf_path.display()))
            .args(args)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CtlError::Spawn {
                    binary: self.binary.display().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(CtlError::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            debug!("beegfs-ctl succeeded");
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, %stderr, "beegfs-ctl failed");
        Err(classify(&format!("{stdout}\n{stderr}")))
    }
}

fn args<const N: usize>(fixed: [&str; N]) -> Vec<String> {
    fixed.iter().map(|arg| (*arg).to_owned()).collect()
}

/// Whether `path` exists on the file system behind `conf_path`.
pub async fn entry_exists(
    exec: &dyn CtlExecutor,
    conf_path: &Path,
    path: &str,
) -> Result<bool, CtlError> {
    match exec
        .execute(conf_path, &args(["--unmounted", "--getentryinfo", path]))
        .await
    {
        Ok(_) => Ok(true),
        Err(CtlError::NotExist(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create `target` and any missing ancestor.
///
/// Directories below `base` get the `rwx` bits of `mode`; `base` and its
/// ancestors are created with the tool's default.  An ancestor created by a
/// concurrent caller is not an error.
#[instrument(skip(exec, conf_path), fields(volume = %name, host = %host))]
pub async fn create_volume_tree(
    exec: &dyn CtlExecutor,
    name: &str,
    host: &str,
    conf_path: &Path,
    target: &str,
    base: &str,
    mode: u32,
) -> Result<(), CtlError> {
    if entry_exists(exec, conf_path, target).await? {
        debug!(%target, "volume directory already exists");
        return Ok(());
    }

    let base = base.trim_end_matches('/');
    for dir in ancestors(target) {
        let mut cmd = args(["--unmounted", "--createdir"]);
        if is_below(&dir, base) {
            cmd.push(format!("--access={:04o}", mode & 0o777));
        }
        cmd.push(dir.clone());
        match exec.execute(conf_path, &cmd).await {
            Ok(_) => debug!(%dir, "directory created"),
            Err(CtlError::Exist(_)) => debug!(%dir, "directory already present"),
            Err(e) => return Err(e),
        }
    }
    info!(%target, "volume directory created");
    Ok(())
}

/// `beegfs-ctl --setpattern` flags for `spec`, and whether a call is needed.
pub fn stripe_pattern_args(spec: &StripePatternSpec) -> (Vec<String>, bool) {
    let mut cmd = vec!["--setpattern".to_owned()];
    if let Some(pool) = &spec.storage_pool_id {
        cmd.push(format!("--storagepoolid={pool}"));
    }
    if let Some(chunk) = &spec.chunk_size {
        cmd.push(format!("--chunksize={chunk}"));
    }
    if let Some(targets) = &spec.num_targets {
        cmd.push(format!("--numtargets={targets}"));
    }
    (cmd, spec.needs_action())
}

pub async fn set_stripe_pattern(
    exec: &dyn CtlExecutor,
    conf_path: &Path,
    path: &str,
    spec: &StripePatternSpec,
) -> Result<(), CtlError> {
    let (mut cmd, needed) = stripe_pattern_args(spec);
    if !needed {
        return Ok(());
    }
    cmd.push("--unmounted".to_owned());
    cmd.push(path.to_owned());
    exec.execute(conf_path, &cmd).await?;
    info!(%path, ?spec, "stripe pattern set");
    Ok(())
}

/// `ls -l` style rendering of a directory mode, e.g. `drwxr-xr-x`.
///
/// Set setuid, setgid and sticky bits add a `u`, `g` or `t` after the `d`.
pub fn symbolic_mode(mode: u32) -> String {
    let mut out = String::from("d");
    for (bit, flag) in [(0o4000, 'u'), (0o2000, 'g'), (0o1000, 't')] {
        if mode & bit != 0 {
            out.push(flag);
        }
    }
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
fn ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    let mut out = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        out.push(current.clone());
    }
    out
}

fn is_below(dir: &str, base: &str) -> bool {
    dir.strip_prefix(base)
        .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
}
