//! Controller service: creates and deletes volume directories.
//!
//! Directory work goes through `beegfs-ctl` against a client configuration
//! generated into a per-volume scratch directory under the plugin's data
//! directory.  Ownership changes and deletion need the file system mounted,
//! which happens at `<scratch>/mount` for the duration of the call.
//!
//! Each volume moves from absent to created to deleted.  The ledger records
//! completed transitions so retries return without touching the file system;
//! a deleted volume is never created again by this process.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libcsi::{
    ControllerCapability, CreateVolumeRequest, CsiController, CsiError,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume, VolumeId,
};
use nix::unistd::{Gid, Uid};
use tracing::{debug, info, instrument, warn};

use crate::client_conf::{remove_client_files, write_client_files};
use crate::config::{ResolvedPluginConfig, squash_for_host};
use crate::ctl::{self, CtlExecutor};
use crate::guard::{KeyGuard, KeyLock, StatusLedger, VolumeStatus};
use crate::mount::Mounter;
use crate::params::{self, PermissionsSpec, VolumeParams};
use crate::volume_id::{self, BeegfsVolume};

const MOUNT_DIR: &str = "mount";

pub struct ControllerService {
    config: Arc<ResolvedPluginConfig>,
    data_dir: PathBuf,
    client_conf_template: PathBuf,
    ctl: Arc<dyn CtlExecutor>,
    mounter: Arc<dyn Mounter>,
    locks: KeyLock,
    ledger: StatusLedger,
}

impl ControllerService {
    pub fn new(
        config: Arc<ResolvedPluginConfig>,
        data_dir: impl Into<PathBuf>,
        client_conf_template: impl Into<PathBuf>,
        ctl: Arc<dyn CtlExecutor>,
        mounter: Arc<dyn Mounter>,
        locks: KeyLock,
    ) -> Self {
        Self {
            config,
            data_dir: data_dir.into(),
            client_conf_template: client_conf_template.into(),
            ctl,
            mounter,
            locks,
            ledger: StatusLedger::new(),
        }
    }

    fn lock(&self, id: &VolumeId) -> Result<KeyGuard, CsiError> {
        self.locks
            .try_lock(id.as_str())
            .ok_or_else(|| CsiError::AlreadyInProgress(id.to_string()))
    }

    fn scratch_dir(&self, id: &VolumeId) -> PathBuf {
        self.data_dir.join(volume_id::sanitize(id.as_str()))
    }

    async fn provision(
        &self,
        scratch: &Path,
        name: &str,
        volume: &BeegfsVolume,
        params: &VolumeParams,
    ) -> Result<(), CsiError> {
        let host = &volume.sys_mgmtd_host;
        let mut config = squash_for_host(host, &self.config);
        params::apply_client_conf(&mut config, &params.client_conf);
        let files = write_client_files(host, scratch, &self.client_conf_template, &config).await?;

        ctl::create_volume_tree(
            self.ctl.as_ref(),
            name,
            host,
            &files.conf_path,
            &volume.path,
            &params.vol_dir_base_path,
            params.permissions.mode,
        )
        .await?;
        ctl::set_stripe_pattern(self.ctl.as_ref(), &files.conf_path, &volume.path, &params.stripe)
            .await?;

        if params.permissions.needs_mount() {
            let mount_point = self.mount_scratch(scratch, &files.conf_path).await?;
            let target = mount_point.join(volume.relative_path());
            let applied = apply_permissions(target, params.permissions).await;
            let unmounted = self.unmount_scratch(&mount_point).await;
            applied?;
            unmounted?;
        }
        Ok(())
    }

    /// Remove the volume directory if it is still there.
    async fn deprovision(&self, scratch: &Path, volume: &BeegfsVolume) -> Result<(), CsiError> {
        let host = &volume.sys_mgmtd_host;
        let config = squash_for_host(host, &self.config);
        let files = write_client_files(host, scratch, &self.client_conf_template, &config).await?;

        if !ctl::entry_exists(self.ctl.as_ref(), &files.conf_path, &volume.path).await? {
            debug!(path = %volume.path, "volume directory already gone");
            return Ok(());
        }

        let mount_point = self.mount_scratch(scratch, &files.conf_path).await?;
        let target = mount_point.join(volume.relative_path());
        let removed = match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::backend(format!("remove {}: {e}", target.display()))),
        };
        let unmounted = self.unmount_scratch(&mount_point).await;
        removed?;
        unmounted
    }

    async fn mount_scratch(&self, scratch: &Path, conf_path: &Path) -> Result<PathBuf, CsiError> {
        let mount_point = scratch.join(MOUNT_DIR);
        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: mount_point.display().to_string(),
                reason: e.to_string(),
            })?;
        if !self.mounter.is_mounted(&mount_point).await? {
            self.mounter
                .mount_beegfs(conf_path, &mount_point, &[])
                .await?;
        }
        Ok(mount_point)
    }

    async fn unmount_scratch(&self, mount_point: &Path) -> Result<(), CsiError> {
        if self.mounter.is_mounted(mount_point).await? {
            self.mounter.unmount(mount_point).await?;
        }
        Ok(())
    }

    /// Remove what provisioning left in `scratch`.
    ///
    /// Only empty directories are removed, so a mount that failed to detach
    /// is never recursed into.
    async fn cleanup_scratch(&self, scratch: &Path) {
        if let Err(e) = remove_client_files(scratch).await {
            warn!(error = %e, "failed to remove scratch client files");
        }
        for dir in [scratch.join(MOUNT_DIR), scratch.to_path_buf()] {
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove scratch directory"),
            }
        }
    }
}

/// Set owner, group and mode of `target`.  Mode goes last because `chown`
/// clears setuid and setgid.
async fn apply_permissions(target: PathBuf, perms: PermissionsSpec) -> Result<(), CsiError> {
    info!(
        path = %target.display(),
        uid = perms.uid,
        gid = perms.gid,
        mode = %ctl::symbolic_mode(perms.mode),
        "applying volume permissions"
    );
    tokio::task::spawn_blocking(move || {
        if perms.has_non_default_owner_or_group() {
            nix::unistd::chown(
                &target,
                Some(Uid::from_raw(perms.uid)),
                Some(Gid::from_raw(perms.gid)),
            )
            .map_err(|e| CsiError::backend(format!("chown {}: {e}", target.display())))?;
        }
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(perms.mode))
            .map_err(|e| CsiError::backend(format!("chmod {}: {e}", target.display())))
    })
    .await
    .map_err(CsiError::internal)?
}

fn validate_name(name: &str) -> Result<(), CsiError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(CsiError::InvalidArgument(format!(
            "volume name {name:?} is not a valid directory name"
        )));
    }
    Ok(())
}

/// Refuse identifiers whose path could escape into the rest of the file
/// system when joined onto a mount point.
fn validate_volume_path(volume: &BeegfsVolume) -> Result<(), CsiError> {
    let rel = volume.relative_path();
    if rel.is_empty() || rel.split('/').any(|part| part == "..") {
        return Err(CsiError::InvalidArgument(format!(
            "volume path {:?} is not a volume directory",
            volume.path
        )));
    }
    Ok(())
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        validate_name(&req.name)?;
        params::validate_capabilities(&req.volume_capabilities)?;
        let params = VolumeParams::parse(&req.parameters)?;

        let volume = BeegfsVolume::new(&params.sys_mgmtd_host, params.volume_path(&req.name));
        validate_volume_path(&volume)?;
        let id = volume.id();
        let response = Volume {
            volume_id: id.clone(),
            capacity_bytes: req.capacity_bytes,
            volume_context: req.parameters.clone(),
        };

        let _guard = self.lock(&id)?;
        match self.ledger.read(id.as_str()).await {
            Some(VolumeStatus::Created(prior)) => {
                if prior.volume_context != response.volume_context
                    || prior.capacity_bytes != response.capacity_bytes
                {
                    return Err(CsiError::AlreadyExists(format!(
                        "volume {id} was created with different parameters"
                    )));
                }
                debug!(volume_id = %id, "volume already created");
                return Ok(prior);
            }
            Some(VolumeStatus::Deleted) => {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {id} was deleted and cannot be created again"
                )));
            }
            None => {}
        }

        let scratch = self.scratch_dir(&id);
        let result = self.provision(&scratch, &req.name, &volume, &params).await;
        self.cleanup_scratch(&scratch).await;
        result?;

        self.ledger
            .write(id.as_str(), VolumeStatus::Created(response.clone()))
            .await;
        info!(volume_id = %id, "volume created");
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let volume = volume_id::decode(volume_id)?;
        validate_volume_path(&volume)?;

        let _guard = self.lock(volume_id)?;
        if self.ledger.read(volume_id.as_str()).await == Some(VolumeStatus::Deleted) {
            debug!("volume already deleted");
            return Ok(());
        }

        let scratch = self.scratch_dir(volume_id);
        let result = self.deprovision(&scratch, &volume).await;
        self.cleanup_scratch(&scratch).await;
        result?;

        self.ledger.write(volume_id.as_str(), VolumeStatus::Deleted).await;
        info!("volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        volume_id::decode(&req.volume_id)?;
        Ok(match params::unsupported_capability(&req.volume_capabilities) {
            Some(message) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            },
            None => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(req.volume_capabilities),
                message: String::new(),
            },
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![ControllerCapability::CreateDeleteVolume])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_names() {
        for name in ["", ".", "..", "a/b"] {
            assert!(validate_name(name).is_err(), "{name:?}");
        }
        assert!(validate_name("pvc-1234").is_ok());
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_volume_path(&BeegfsVolume::new("mgmt", "/")).is_err());
        assert!(validate_volume_path(&BeegfsVolume::new("mgmt", "/export/../etc")).is_err());
        assert!(validate_volume_path(&BeegfsVolume::new("mgmt", "/export/vol")).is_ok());
    }
}
