//! Requests and responses as they travel over a connection.
//!
//! Each frame holds one [`Envelope`]: a client-chosen id plus a [`CsiMessage`].
//! Responses reuse the id of their request, which lets a connection carry
//! several requests at once and answer them in completion order.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// A message tagged with the id of the request it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Chosen by the client; echoed by the server on the response.
    pub id: u64,
    /// The request or response.
    pub message: CsiMessage,
}

/// Every request and response the transport carries.
///
/// Requests are grouped by the service that answers them.  Each request has
/// exactly one success variant; any request may instead be answered with
/// [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // controller
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ControllerGetCapabilities,

    // node
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    GetNodeInfo,
    NodeGetCapabilities,

    // identity
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    /// Answer to `CreateVolume`.
    VolumeCreated(Volume),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    ControllerCapabilities(Vec<ControllerCapability>),
    NodeCapabilities(Vec<NodeCapability>),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),
    /// Answer to calls that return nothing (delete, stage, publish, ...).
    Ok,
    ProbeResult(bool),
    Error(CsiError),
}

impl CsiMessage {
    /// Turn an [`CsiMessage::Error`] response into `Err`, passing every other
    /// message through.
    pub fn into_result(self) -> Result<Self, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    /// Variant name, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateVolume(_) => "CreateVolume",
            Self::DeleteVolume(_) => "DeleteVolume",
            Self::ValidateVolumeCapabilities(_) => "ValidateVolumeCapabilities",
            Self::ControllerGetCapabilities => "ControllerGetCapabilities",
            Self::StageVolume(_) => "StageVolume",
            Self::UnstageVolume { .. } => "UnstageVolume",
            Self::PublishVolume(_) => "PublishVolume",
            Self::UnpublishVolume { .. } => "UnpublishVolume",
            Self::GetNodeInfo => "GetNodeInfo",
            Self::NodeGetCapabilities => "NodeGetCapabilities",
            Self::Probe => "Probe",
            Self::GetPluginInfo => "GetPluginInfo",
            Self::GetPluginCapabilities => "GetPluginCapabilities",
            Self::VolumeCreated(_) => "VolumeCreated",
            Self::CapabilitiesValidated(_) => "CapabilitiesValidated",
            Self::ControllerCapabilities(_) => "ControllerCapabilities",
            Self::NodeCapabilities(_) => "NodeCapabilities",
            Self::PluginInfoResponse(_) => "PluginInfoResponse",
            Self::PluginCapabilitiesResponse(_) => "PluginCapabilitiesResponse",
            Self::NodeInfoResponse(_) => "NodeInfoResponse",
            Self::Ok => "Ok",
            Self::ProbeResult(_) => "ProbeResult",
            Self::Error(_) => "Error",
        }
    }

    /// The volume a request or response refers to.
    pub fn volume_id(&self) -> Option<&VolumeId> {
        match self {
            Self::DeleteVolume(id)
            | Self::UnstageVolume { volume_id: id, .. }
            | Self::UnpublishVolume { volume_id: id, .. } => Some(id),
            Self::ValidateVolumeCapabilities(req) => Some(&req.volume_id),
            Self::StageVolume(req) => Some(&req.volume_id),
            Self::PublishVolume(req) => Some(&req.volume_id),
            Self::VolumeCreated(vol) => Some(&vol.volume_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())?;
        match (self, self.volume_id()) {
            (Self::CreateVolume(req), _) => write!(f, "(name={})", req.name),
            (Self::Error(e), _) => write!(f, "({}: {e})", e.code()),
            (_, Some(id)) => write!(f, "({id})"),
            _ => Ok(()),
        }
    }
}
