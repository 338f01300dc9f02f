//! The three services a plugin exposes.
//!
//! A plugin binary may serve all of them or only some; the transport only
//! needs one value implementing every trait, so a plugin answers calls for a
//! service it does not run with [`CsiError::Unimplemented`].
//!
//! Volume lifecycle, with the service responsible for each step:
//!
//! ```text
//! CreateVolume (controller) -> NodeStageVolume -> NodePublishVolume
//!                                                        |
//! DeleteVolume (controller) <- NodeUnstageVolume <- NodeUnpublishVolume
//! ```
//!
//! Every mutating call may be retried by the orchestrator after a timeout
//! or crash, so implementations must treat a repeat of a completed call as
//! success.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateVolumeRequest, NodeCapability, NodeInfo,
    NodePublishVolumeRequest, NodeStageVolumeRequest, PluginCapability, PluginInfo,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume, VolumeId,
};

/// Discovery and health.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `Ok(true)` once the plugin can take requests.
    async fn probe(&self) -> Result<bool, CsiError>;

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}

/// Cluster-wide volume provisioning.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume for `req.name`.
    ///
    /// The returned `volume_context` travels with the volume to every node
    /// call, which is the only way parameters reach the node side.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Deprovision a volume.  A volume that no longer exists is not an error.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Report whether the volume can be used with the given capabilities.
    /// Never changes state.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}

/// Host-local mounting, one instance per worker.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Make the volume available below `req.staging_target_path`.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Undo [`CsiNode::stage_volume`].
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Expose a staged volume at `req.target_path` for one workload.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Undo [`CsiNode::publish_volume`].
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
