//! Storage-class parameters and capability checks for `CreateVolume`.

use std::collections::{BTreeMap, HashMap};

use libcsi::{AccessMode, AccessType, CsiError, VolumeCapability};
use tracing::warn;

use crate::client_conf::RESERVED_KEYS;
use crate::config::FilesystemConfig;

pub const SYS_MGMTD_HOST: &str = "sysMgmtdHost";
pub const VOL_DIR_BASE_PATH: &str = "volDirBasePath";
pub const STRIPE_STORAGE_POOL_ID: &str = "stripePattern/storagePoolID";
pub const STRIPE_CHUNK_SIZE: &str = "stripePattern/chunkSize";
pub const STRIPE_NUM_TARGETS: &str = "stripePattern/numTargets";
pub const PERMISSIONS_UID: &str = "permissions/uid";
pub const PERMISSIONS_GID: &str = "permissions/gid";
pub const PERMISSIONS_MODE: &str = "permissions/mode";
/// Prefix of parameters copied into `beegfs-client.conf`.
pub const CLIENT_CONF_PREFIX: &str = "beegfsClientConf/";
/// Parameters the orchestrator adds on its own; never meant for the plugin.
const ORCHESTRATOR_PREFIX: &str = "csi.storage.k8s.io/";

pub const DEFAULT_MODE: u32 = 0o777;

/// Stripe settings applied to a new volume directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripePatternSpec {
    pub storage_pool_id: Option<String>,
    pub chunk_size: Option<String>,
    pub num_targets: Option<String>,
}

impl StripePatternSpec {
    pub fn needs_action(&self) -> bool {
        self.storage_pool_id.is_some() || self.chunk_size.is_some() || self.num_targets.is_some()
    }
}

/// Ownership and mode of a new volume directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionsSpec {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Default for PermissionsSpec {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: DEFAULT_MODE,
        }
    }
}

impl PermissionsSpec {
    pub fn has_non_default_owner_or_group(&self) -> bool {
        self.uid != 0 || self.gid != 0
    }

    /// setuid, setgid or sticky bit requested.
    pub fn has_special_permissions(&self) -> bool {
        self.mode & 0o7000 != 0
    }

    /// Whether owner or special bits require mounting the file system;
    /// plain mode bits are set by `beegfs-ctl` at creation.
    pub fn needs_mount(&self) -> bool {
        self.has_non_default_owner_or_group() || self.has_special_permissions()
    }
}

/// Parsed `CreateVolume` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParams {
    pub sys_mgmtd_host: String,
    pub vol_dir_base_path: String,
    pub stripe: StripePatternSpec,
    pub permissions: PermissionsSpec,
    pub client_conf: BTreeMap<String, String>,
}

impl VolumeParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let sys_mgmtd_host = required(params, SYS_MGMTD_HOST)?;
        if sys_mgmtd_host.contains('/') {
            return Err(CsiError::InvalidArgument(format!(
                "{SYS_MGMTD_HOST} {sys_mgmtd_host:?} may not contain '/'"
            )));
        }
        let vol_dir_base_path = required(params, VOL_DIR_BASE_PATH)?;
        if !vol_dir_base_path.starts_with('/') {
            return Err(CsiError::InvalidArgument(format!(
                "{VOL_DIR_BASE_PATH} {vol_dir_base_path:?} must be absolute"
            )));
        }

        let stripe = StripePatternSpec {
            storage_pool_id: optional(params, STRIPE_STORAGE_POOL_ID),
            chunk_size: optional(params, STRIPE_CHUNK_SIZE),
            num_targets: optional(params, STRIPE_NUM_TARGETS),
        };

        let mut permissions = PermissionsSpec::default();
        if let Some(uid) = optional(params, PERMISSIONS_UID) {
            permissions.uid = parse_id(PERMISSIONS_UID, &uid)?;
        }
        if let Some(gid) = optional(params, PERMISSIONS_GID) {
            permissions.gid = parse_id(PERMISSIONS_GID, &gid)?;
        }
        if let Some(mode) = optional(params, PERMISSIONS_MODE) {
            permissions.mode = parse_mode(&mode)?;
        }

        let client_conf = client_conf_overrides(params)?;

        for key in params.keys() {
            let known = [
                SYS_MGMTD_HOST,
                VOL_DIR_BASE_PATH,
                STRIPE_STORAGE_POOL_ID,
                STRIPE_CHUNK_SIZE,
                STRIPE_NUM_TARGETS,
                PERMISSIONS_UID,
                PERMISSIONS_GID,
                PERMISSIONS_MODE,
            ]
            .contains(&key.as_str());
            if !known
                && !key.starts_with(CLIENT_CONF_PREFIX)
                && !key.starts_with(ORCHESTRATOR_PREFIX)
            {
                warn!(parameter = %key, "ignoring unknown parameter");
            }
        }

        Ok(Self {
            sys_mgmtd_host,
            vol_dir_base_path,
            stripe,
            permissions,
            client_conf,
        })
    }

    /// Absolute path of the volume named `name`.
    pub fn volume_path(&self, name: &str) -> String {
        format!("{}/{name}", self.vol_dir_base_path.trim_end_matches('/'))
    }
}

/// `beegfsClientConf/<key>` entries of `params`, prefix stripped.
pub fn client_conf_overrides(
    params: &HashMap<String, String>,
) -> Result<BTreeMap<String, String>, CsiError> {
    let mut overrides = BTreeMap::new();
    for (key, value) in params {
        let Some(name) = key.strip_prefix(CLIENT_CONF_PREFIX) else {
            continue;
        };
        if name.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "parameter {key:?} names no client setting"
            )));
        }
        if RESERVED_KEYS.contains(&name) {
            return Err(CsiError::InvalidArgument(format!(
                "parameter {key:?} sets a client setting managed by the plugin"
            )));
        }
        overrides.insert(name.to_owned(), value.clone());
    }
    Ok(overrides)
}

/// Overlay request-level client settings onto a squashed configuration.
pub fn apply_client_conf(config: &mut FilesystemConfig, overrides: &BTreeMap<String, String>) {
    for (key, value) in overrides {
        config.beegfs_client_conf.insert(key.clone(), value.clone());
    }
}

/// Reject capability sets this plugin cannot honour.
pub fn validate_capabilities(caps: &[VolumeCapability]) -> Result<(), CsiError> {
    match unsupported_capability(caps) {
        Some(reason) => Err(CsiError::InvalidArgument(reason)),
        None => Ok(()),
    }
}

/// Why `caps` cannot be satisfied, if they cannot.
pub fn unsupported_capability(caps: &[VolumeCapability]) -> Option<String> {
    if caps.is_empty() {
        return Some("no volume capabilities given".to_owned());
    }
    for cap in caps {
        if matches!(cap.access_type, AccessType::Block) {
            return Some("block access is not supported".to_owned());
        }
        if !matches!(
            cap.access_mode,
            AccessMode::SingleNodeWriter | AccessMode::MultiNodeMultiWriter
        ) {
            return Some(format!("access mode {:?} is not supported", cap.access_mode));
        }
    }
    None
}

fn required(params: &HashMap<String, String>, key: &str) -> Result<String, CsiError> {
    optional(params, key)
        .ok_or_else(|| CsiError::InvalidArgument(format!("parameter {key} is required")))
}

fn optional(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn parse_id(key: &str, value: &str) -> Result<u32, CsiError> {
    value
        .parse()
        .map_err(|e| CsiError::InvalidArgument(format!("parameter {key} {value:?}: {e}")))
}

fn parse_mode(value: &str) -> Result<u32, CsiError> {
    let digits = value.strip_prefix("0o").unwrap_or(value);
    let mode = u32::from_str_radix(digits, 8).map_err(|e| {
        CsiError::InvalidArgument(format!("parameter {PERMISSIONS_MODE} {value:?}: {e}"))
    })?;
    if mode > 0o7777 {
        return Err(CsiError::InvalidArgument(format!(
            "parameter {PERMISSIONS_MODE} {value:?} is out of range"
        )));
    }
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn parse_full_parameter_set() {
        let parsed = VolumeParams::parse(&params(&[
            (SYS_MGMTD_HOST, "10.0.0.1"),
            (VOL_DIR_BASE_PATH, "/export/"),
            (STRIPE_STORAGE_POOL_ID, "2"),
            (STRIPE_CHUNK_SIZE, "2m"),
            (STRIPE_NUM_TARGETS, ""),
            (PERMISSIONS_UID, "1000"),
            (PERMISSIONS_MODE, "2755"),
            ("beegfsClientConf/connMgmtdPortTCP", "9008"),
            ("csi.storage.k8s.io/pvc/name", "data"),
        ]))
        .unwrap();

        assert_eq!(parsed.sys_mgmtd_host, "10.0.0.1");
        assert_eq!(parsed.volume_path("vol1"), "/export/vol1");
        assert_eq!(parsed.stripe.storage_pool_id.as_deref(), Some("2"));
        assert_eq!(parsed.stripe.num_targets, None);
        assert!(parsed.stripe.needs_action());
        assert_eq!(parsed.permissions.uid, 1000);
        assert_eq!(parsed.permissions.gid, 0);
        assert_eq!(parsed.permissions.mode, 0o2755);
        assert!(parsed.permissions.has_special_permissions());
        assert!(parsed.permissions.needs_mount());
        assert_eq!(parsed.client_conf["connMgmtdPortTCP"], "9008");
    }

    #[test]
    fn defaults_need_no_extra_work() {
        let parsed = VolumeParams::parse(&params(&[
            (SYS_MGMTD_HOST, "mgmt"),
            (VOL_DIR_BASE_PATH, "/"),
        ]))
        .unwrap();
        assert_eq!(parsed.volume_path("v"), "/v");
        assert!(!parsed.stripe.needs_action());
        assert_eq!(parsed.permissions, PermissionsSpec::default());
        assert!(!parsed.permissions.needs_mount());
    }

    #[test]
    fn missing_or_bad_parameters_are_invalid() {
        let cases = [
            params(&[(VOL_DIR_BASE_PATH, "/export")]),
            params(&[(SYS_MGMTD_HOST, "mgmt")]),
            params(&[(SYS_MGMTD_HOST, "mgmt"), (VOL_DIR_BASE_PATH, "relative")]),
            params(&[
                (SYS_MGMTD_HOST, "mgmt"),
                (VOL_DIR_BASE_PATH, "/export"),
                (PERMISSIONS_MODE, "999"),
            ]),
            params(&[
                (SYS_MGMTD_HOST, "mgmt"),
                (VOL_DIR_BASE_PATH, "/export"),
                (PERMISSIONS_MODE, "17777"),
            ]),
            params(&[
                (SYS_MGMTD_HOST, "mgmt"),
                (VOL_DIR_BASE_PATH, "/export"),
                (PERMISSIONS_GID, "-1"),
            ]),
            params(&[
                (SYS_MGMTD_HOST, "mgmt"),
                (VOL_DIR_BASE_PATH, "/export"),
                ("beegfsClientConf/connAuthFile", "/tmp/x"),
            ]),
        ];
        for case in cases {
            assert!(
                matches!(VolumeParams::parse(&case), Err(CsiError::InvalidArgument(_))),
                "{case:?}"
            );
        }
    }

    #[test]
    fn capability_checks() {
        let writer = VolumeCapability::default();
        let multi = VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            ..Default::default()
        };
        assert!(validate_capabilities(&[writer.clone(), multi]).is_ok());
        assert!(validate_capabilities(&[]).is_err());

        let reader = VolumeCapability {
            access_mode: AccessMode::MultiNodeReaderOnly,
            ..Default::default()
        };
        assert!(validate_capabilities(&[writer.clone(), reader]).is_err());

        let block = VolumeCapability {
            access_type: AccessType::Block,
            ..writer
        };
        assert!(unsupported_capability(&[block]).is_some());
    }
}
