//! Conversions from plugin errors into [`CsiError`]s returned to callers.

use libcsi::CsiError;

use crate::client_conf::ClientConfError;
use crate::config::ConfigError;
use crate::ctl::CtlError;
use crate::volume_id::VolumeIdError;

impl From<VolumeIdError> for CsiError {
    fn from(e: VolumeIdError) -> Self {
        CsiError::InvalidArgument(e.to_string())
    }
}

impl From<CtlError> for CsiError {
    fn from(e: CtlError) -> Self {
        match e {
            CtlError::NotExist(_) => CsiError::NotFound(e.to_string()),
            CtlError::Exist(_) => CsiError::AlreadyExists(e.to_string()),
            CtlError::Timeout(_) => CsiError::DeadlineExceeded(e.to_string()),
            CtlError::Failed(_) | CtlError::Spawn { .. } => CsiError::Unavailable(e.to_string()),
        }
    }
}

impl From<ClientConfError> for CsiError {
    fn from(e: ClientConfError) -> Self {
        CsiError::Internal(e.to_string())
    }
}

impl From<ConfigError> for CsiError {
    fn from(e: ConfigError) -> Self {
        CsiError::Internal(e.to_string())
    }
}
