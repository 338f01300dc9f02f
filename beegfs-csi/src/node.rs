//! Node service: mounts volumes for workloads on this host.
//!
//! Staging mounts the whole file system once per volume under
//! `<staging_target_path>/<sanitized volume id>/mount`, next to the client
//! configuration used for it.  Publishing bind-mounts the volume's directory
//! inside that mount into the workload's target path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libcsi::{
    CsiError, CsiNode, NodeCapability, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId,
};
use tracing::{debug, info, instrument};

use crate::client_conf::{remove_client_files, write_client_files};
use crate::config::{ResolvedPluginConfig, squash_for_host};
use crate::guard::{KeyGuard, KeyLock};
use crate::mount::Mounter;
use crate::params;
use crate::volume_id::{self, BeegfsVolume};

const MOUNT_DIR: &str = "mount";

pub struct NodeService {
    node_id: String,
    config: Arc<ResolvedPluginConfig>,
    client_conf_template: PathBuf,
    mounter: Arc<dyn Mounter>,
    locks: KeyLock,
}

/// Per-volume directory below the orchestrator's staging path.
pub fn staging_dir(staging_target_path: &str, volume_id: &VolumeId) -> PathBuf {
    Path::new(staging_target_path).join(volume_id::sanitize(volume_id.as_str()))
}

/// Where the file system is mounted for a staged volume.
pub fn staging_mount_point(staging_target_path: &str, volume_id: &VolumeId) -> PathBuf {
    staging_dir(staging_target_path, volume_id).join(MOUNT_DIR)
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        config: Arc<ResolvedPluginConfig>,
        client_conf_template: impl Into<PathBuf>,
        mounter: Arc<dyn Mounter>,
        locks: KeyLock,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            client_conf_template: client_conf_template.into(),
            mounter,
            locks,
        }
    }

    fn lock(&self, key: &str) -> Result<KeyGuard, CsiError> {
        self.locks
            .try_lock(key)
            .ok_or_else(|| CsiError::AlreadyInProgress(key.to_owned()))
    }

    /// Publish and unpublish hold both the volume key and the target path.
    fn lock_target(&self, volume_id: &VolumeId, target: &str) -> Result<Vec<KeyGuard>, CsiError> {
        self.locks
            .try_lock_all(&[volume_id.as_str(), target])
            .ok_or_else(|| CsiError::AlreadyInProgress(format!("{volume_id} at {target}")))
    }
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

async fn remove_dir_if_present(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CsiError::internal(format!("remove {}: {e}", path.display()))),
    }
}

fn decode(volume_id: &VolumeId) -> Result<BeegfsVolume, CsiError> {
    let volume = volume_id::decode(volume_id)?;
    if volume.relative_path().split('/').any(|part| part == "..") {
        return Err(CsiError::InvalidArgument(format!(
            "volume path {:?} leaves the file system",
            volume.path
        )));
    }
    Ok(volume)
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        let volume = decode(&req.volume_id)?;
        require(&req.staging_target_path, "staging_target_path")?;
        params::validate_capabilities(std::slice::from_ref(&req.volume_capability))?;
        let overrides = params::client_conf_overrides(&req.volume_context)?;

        let _guard = self.lock(req.volume_id.as_str())?;

        let dir = staging_dir(&req.staging_target_path, &req.volume_id);
        let mount_point = dir.join(MOUNT_DIR);
        let host = &volume.sys_mgmtd_host;
        let mut config = squash_for_host(host, &self.config);
        params::apply_client_conf(&mut config, &overrides);
        let files = write_client_files(host, &dir, &self.client_conf_template, &config).await?;

        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: mount_point.display().to_string(),
                reason: e.to_string(),
            })?;

        if self.mounter.is_mounted(&mount_point).await? {
            if !files.changed {
                debug!("volume already staged");
                return Ok(());
            }
            info!("client configuration changed, remounting");
            self.mounter.unmount(&mount_point).await?;
        }
        self.mounter
            .mount_beegfs(
                &files.conf_path,
                &mount_point,
                req.volume_capability.mount_flags(),
            )
            .await?;
        info!(mount_point = %mount_point.display(), "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        decode(volume_id)?;
        require(staging_target_path, "staging_target_path")?;
        let _guard = self.lock(volume_id.as_str())?;

        let dir = staging_dir(staging_target_path, volume_id);
        let mount_point = dir.join(MOUNT_DIR);
        if self.mounter.is_mounted(&mount_point).await? {
            self.mounter.unmount(&mount_point).await?;
        }
        remove_dir_if_present(&mount_point).await?;
        remove_client_files(&dir).await?;
        remove_dir_if_present(&dir).await?;
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let volume = decode(&req.volume_id)?;
        require(&req.staging_target_path, "staging_target_path")?;
        require(&req.target_path, "target_path")?;
        params::validate_capabilities(std::slice::from_ref(&req.volume_capability))?;

        let _guards = self.lock_target(&req.volume_id, &req.target_path)?;

        let target = Path::new(&req.target_path);
        if self.mounter.is_mounted(target).await? {
            debug!("target already mounted");
            return Ok(());
        }

        let mount_point = staging_mount_point(&req.staging_target_path, &req.volume_id);
        if !self.mounter.is_mounted(&mount_point).await? {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is not staged at {}",
                req.volume_id, req.staging_target_path
            )));
        }

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: e.to_string(),
            })?;
        let source = mount_point.join(volume.relative_path());
        self.mounter
            .bind_mount(&source, target, req.read_only)
            .await?;
        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        decode(volume_id)?;
        require(target_path, "target_path")?;
        let _guards = self.lock_target(volume_id, target_path)?;

        let target = Path::new(target_path);
        if self.mounter.is_mounted(target).await? {
            self.mounter.unmount(target).await?;
        }
        remove_dir_if_present(target).await?;
        info!("volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: 0,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }
}
