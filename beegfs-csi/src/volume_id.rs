//! Volume identifiers.
//!
//! A BeeGFS volume is a directory on a particular file system, so its
//! identifier is the pair (management host, absolute directory path) written
//! as `beegfs://<sysMgmtdHost>/<path>`.  The orchestrator treats the string as
//! opaque and hands it back on every later RPC.

use libcsi::VolumeId;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Scheme prefix of every identifier produced by this plugin.
pub const SCHEME: &str = "beegfs://";

/// Sanitized names longer than this are replaced by a digest.
const MAX_SANITIZED_LEN: usize = 128;

/// Decoded form of a [`VolumeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BeegfsVolume {
    /// Management host identity of the file system.
    pub sys_mgmtd_host: String,
    /// Absolute path of the volume directory inside the file system.
    pub path: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeIdError {
    #[error("volume id {0:?} does not start with beegfs://")]
    WrongScheme(String),
    #[error("volume id {0:?} has no management host")]
    MissingHost(String),
    #[error("volume id {0:?} has no absolute path")]
    MissingPath(String),
}

impl BeegfsVolume {
    pub fn new(sys_mgmtd_host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            sys_mgmtd_host: sys_mgmtd_host.into(),
            path: path.into(),
        }
    }

    /// Encode as an opaque identifier.
    pub fn id(&self) -> VolumeId {
        encode(&self.sys_mgmtd_host, &self.path)
    }

    /// Volume path relative to the file system root, for joining onto a
    /// local mount point.
    pub fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

/// Encode `(host, path)` as `beegfs://host/path`.
pub fn encode(sys_mgmtd_host: &str, path: &str) -> VolumeId {
    if path.starts_with('/') {
        VolumeId(format!("{SCHEME}{sys_mgmtd_host}{path}"))
    } else {
        VolumeId(format!("{SCHEME}{sys_mgmtd_host}/{path}"))
    }
}

/// Decode an identifier produced by [`encode`].
pub fn decode(id: &VolumeId) -> Result<BeegfsVolume, VolumeIdError> {
    let raw = id.as_str();
    let rest = raw
        .strip_prefix(SCHEME)
        .ok_or_else(|| VolumeIdError::WrongScheme(raw.to_owned()))?;
    let slash = rest
        .find('/')
        .ok_or_else(|| VolumeIdError::MissingPath(raw.to_owned()))?;
    let (host, path) = rest.split_at(slash);
    if host.is_empty() {
        return Err(VolumeIdError::MissingHost(raw.to_owned()));
    }
    Ok(BeegfsVolume::new(host, path))
}

/// Derive a name that is safe to use as a single local directory or file name.
///
/// Underscores are doubled before slashes become single underscores, so short
/// identifiers stay readable and distinct.  Names that would grow past
/// [`MAX_SANITIZED_LEN`] bytes are replaced by the hex SHA-256 digest of the
/// input.
pub fn sanitize(id: &str) -> String {
    let name = id.replace('_', "__").replace('/', "_");
    if name.len() > MAX_SANITIZED_LEN {
        hex::encode(Sha256::digest(id.as_bytes()))
    } else {
        name
    }
}
