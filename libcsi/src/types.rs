//! Request and response payloads.
//!
//! Field names follow the CSI protobuf definitions so the JSON produced here
//! reads like the gRPC messages it stands in for.  Optional repeated and map
//! fields default to empty when missing from the input.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Plugin-chosen volume handle.  Callers never look inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// `VolumeCapability.AccessMode.Mode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// File system or raw device access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    Mount {
        /// Empty lets the plugin pick.
        #[serde(default)]
        fs_type: String,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    Block,
}

impl Default for AccessType {
    fn default() -> Self {
        Self::Mount {
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

/// How a workload intends to use a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    /// Missing means a mounted file system.
    #[serde(default)]
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// Extra mount options; always empty for block access.
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::default(),
        }
    }
}

/// `CreateVolume` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// `0` when the plugin does not track capacity.
    pub capacity_bytes: u64,
    /// Handed back verbatim on every node call for this volume.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-chosen and stable across retries.
    pub name: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// Echo of the supported capabilities, `None` if any is unsupported.
    pub confirmed: Option<Vec<VolumeCapability>>,
    /// Why confirmation was refused.
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Directory reserved for this volume on this node.
    pub staging_target_path: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// Same path the volume was staged at.
    pub staging_target_path: String,
    /// Path inside the workload's volume directory.
    pub target_path: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Reverse-domain plugin name.
    pub name: String,
    pub vendor_version: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    /// `0` means unlimited.
    pub max_volumes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_is_transparent_text() {
        let id = VolumeId::from("beegfs://mgmt/k8s/vol-abc");
        assert_eq!(id.to_string(), "beegfs://mgmt/k8s/vol-abc");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            r#""beegfs://mgmt/k8s/vol-abc""#
        );
    }

    #[test]
    fn capability_defaults_to_mounted_writer() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::SingleNodeWriter);
        assert!(matches!(cap.access_type, AccessType::Mount { .. }));
        assert!(cap.mount_flags().is_empty());
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let cap: VolumeCapability =
            serde_json::from_str(r#"{"access_mode":"MultiNodeMultiWriter"}"#).unwrap();
        assert_eq!(cap.access_mode, AccessMode::MultiNodeMultiWriter);
        assert_eq!(cap.access_type, AccessType::default());

        let req: CreateVolumeRequest = serde_json::from_str(r#"{"name":"pvc-1"}"#).unwrap();
        assert_eq!(req.name, "pvc-1");
        assert!(req.volume_capabilities.is_empty());
        assert!(req.parameters.is_empty());
    }

    #[test]
    fn block_access_has_no_mount_flags() {
        let cap = VolumeCapability {
            access_type: AccessType::Block,
            ..Default::default()
        };
        assert!(cap.mount_flags().is_empty());
    }
}
