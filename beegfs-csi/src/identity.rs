//! Identity service.

use async_trait::async_trait;
use libcsi::{CsiError, CsiIdentity, PluginCapability, PluginInfo};

/// Name the plugin registers under.
pub const DRIVER_NAME: &str = "beegfs.csi.rk8s.io";

#[derive(Debug, Clone, Copy)]
pub struct IdentityService {
    controller_enabled: bool,
}

impl IdentityService {
    pub fn new(controller_enabled: bool) -> Self {
        Self { controller_enabled }
    }
}

#[async_trait]
impl CsiIdentity for IdentityService {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = Vec::new();
        if self.controller_enabled {
            caps.push(PluginCapability::ControllerService);
        }
        Ok(caps)
    }
}
