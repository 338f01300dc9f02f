//! Composition of the three services into one plugin.
//!
//! The same binary runs as the cluster-wide controller, as the per-host node
//! plugin, or as both.  A service that is not enabled answers every call with
//! `Unimplemented`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use libcsi::{
    ControllerCapability, CreateVolumeRequest, CsiController, CsiError, CsiIdentity, CsiNode,
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, PluginCapability,
    PluginInfo, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeId,
};
use tracing::info;

use crate::config::ResolvedPluginConfig;
use crate::controller::ControllerService;
use crate::ctl::CtlExecutor;
use crate::guard::KeyLock;
use crate::identity::IdentityService;
use crate::mount::Mounter;
use crate::node::NodeService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Controller,
    Node,
    All,
}

impl RunMode {
    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

/// Everything the services need besides their external collaborators.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub node_id: String,
    pub mode: RunMode,
    pub config: ResolvedPluginConfig,
    /// Scratch space for controller-side client configurations and mounts.
    pub data_dir: PathBuf,
    pub client_conf_template: PathBuf,
}

pub struct BeegfsDriver {
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl BeegfsDriver {
    pub fn new(
        settings: DriverSettings,
        ctl: Arc<dyn CtlExecutor>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let DriverSettings {
            node_id,
            mode,
            config,
            data_dir,
            client_conf_template,
        } = settings;
        let config = Arc::new(config);
        // One held-set for both services.
        let locks = KeyLock::new();

        let controller = mode.runs_controller().then(|| {
            ControllerService::new(
                Arc::clone(&config),
                data_dir,
                client_conf_template.clone(),
                ctl,
                Arc::clone(&mounter),
                locks.clone(),
            )
        });
        let node = mode
            .runs_node()
            .then(|| NodeService::new(node_id, config, client_conf_template, mounter, locks));

        info!(?mode, "BeeGFS driver initialised");
        Self {
            identity: IdentityService::new(controller.is_some()),
            controller,
            node,
        }
    }

    fn controller(&self) -> Result<&ControllerService, CsiError> {
        self.controller.as_ref().ok_or_else(|| {
            CsiError::Unimplemented("controller service is not enabled on this instance".into())
        })
    }

    fn node(&self) -> Result<&NodeService, CsiError> {
        self.node.as_ref().ok_or_else(|| {
            CsiError::Unimplemented("node service is not enabled on this instance".into())
        })
    }
}

#[async_trait]
impl CsiIdentity for BeegfsDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        self.identity.get_plugin_info().await
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        self.identity.probe().await
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        self.identity.get_plugin_capabilities().await
    }
}

#[async_trait]
impl CsiController for BeegfsDriver {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.controller()?.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller()?.delete_volume(volume_id).await
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        self.controller()?.validate_volume_capabilities(req).await
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        CsiController::get_capabilities(self.controller()?).await
    }
}

#[async_trait]
impl CsiNode for BeegfsDriver {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node()?.stage_volume(req).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.node()?
            .unstage_volume(volume_id, staging_target_path)
            .await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node()?.publish_volume(req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.node()?.unpublish_volume(volume_id, target_path).await
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        self.node()?.get_info().await
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        CsiNode::get_capabilities(self.node()?).await
    }
}
