//! Plugin configuration and its resolution for the local node.
//!
//! The configuration file has three layers:
//!
//! ```yaml
//! config:                      # default for every file system
//!   connInterfaces: [ib0]
//!   beegfsClientConf:
//!     connMgmtdPortTCP: "9008"
//! fileSystemSpecificConfigs:   # overrides for one management host
//!   - sysMgmtdHost: 10.0.0.1
//!     config:
//!       connNetFilter: [10.0.0.0/24]
//! nodeSpecificConfigs:         # overrides for the listed nodes only
//!   - nodeList: [node-a, node-b]
//!     config: {...}
//!     fileSystemSpecificConfigs: [...]
//! ```
//!
//! [`resolve`] folds the node-specific layer into the other two once at
//! startup; [`squash_for_host`] then produces the single effective
//! [`FilesystemConfig`] for one file system on every request.
//!
//! Every field of [`FilesystemConfig`] distinguishes "absent" from "set", so
//! an override only replaces what it explicitly names, and an explicitly
//! empty value is a real override.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::client_conf::RESERVED_KEYS;

/// Connection-authentication secret.  Never printed or serialized.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The cleartext value, for writing the `connAuthFile`.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(******)")
    }
}

/// Client settings for one BeeGFS file system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilesystemConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_interfaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_net_filter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_tcp_only_filter: Option<Vec<String>>,
    /// Raw `beegfs-client.conf` settings, merged key by key.
    #[serde(
        default,
        deserialize_with = "scalar_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub beegfs_client_conf: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub conn_auth: Option<Secret>,
}

impl FilesystemConfig {
    /// Apply `over` on top of `self`, field by field.
    ///
    /// Lists and the secret are replaced wholesale when `over` sets them;
    /// client-conf entries are merged key by key, empty values included.
    pub fn overlay(&mut self, over: &FilesystemConfig) {
        if let Some(list) = &over.conn_interfaces {
            self.conn_interfaces = Some(list.clone());
        }
        if let Some(list) = &over.conn_net_filter {
            self.conn_net_filter = Some(list.clone());
        }
        if let Some(list) = &over.conn_tcp_only_filter {
            self.conn_tcp_only_filter = Some(list.clone());
        }
        for (key, value) in &over.beegfs_client_conf {
            self.beegfs_client_conf.insert(key.clone(), value.clone());
        }
        if let Some(secret) = &over.conn_auth {
            self.conn_auth = Some(secret.clone());
        }
    }

    pub fn conn_interfaces(&self) -> &[String] {
        self.conn_interfaces.as_deref().unwrap_or(&[])
    }

    pub fn conn_net_filter(&self) -> &[String] {
        self.conn_net_filter.as_deref().unwrap_or(&[])
    }

    pub fn conn_tcp_only_filter(&self) -> &[String] {
        self.conn_tcp_only_filter.as_deref().unwrap_or(&[])
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self
            .beegfs_client_conf
            .keys()
            .find(|key| RESERVED_KEYS.contains(&key.as_str()))
        {
            Some(key) => Err(ConfigError::ReservedKey { key: key.clone() }),
            None => Ok(()),
        }
    }
}

/// A [`FilesystemConfig`] bound to one management host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileSystemSpecificConfig {
    pub sys_mgmtd_host: String,
    #[serde(default)]
    pub config: FilesystemConfig,
}

/// Overrides that apply only on the nodes in `node_list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeSpecificConfig {
    #[serde(default)]
    pub node_list: Vec<String>,
    #[serde(default)]
    pub config: FilesystemConfig,
    #[serde(default)]
    pub file_system_specific_configs: Vec<FileSystemSpecificConfig>,
}

/// The configuration file as written by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginConfig {
    #[serde(default)]
    pub config: FilesystemConfig,
    #[serde(default)]
    pub file_system_specific_configs: Vec<FileSystemSpecificConfig>,
    #[serde(default)]
    pub node_specific_configs: Vec<NodeSpecificConfig>,
}

impl PluginConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        parse_yaml(content, "<inline>")
    }

    /// Reject settings the plugin manages itself and entries without a host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()?;
        validate_file_systems(&self.file_system_specific_configs)?;
        for node_config in &self.node_specific_configs {
            node_config.config.validate()?;
            validate_file_systems(&node_config.file_system_specific_configs)?;
        }
        Ok(())
    }
}

fn validate_file_systems(entries: &[FileSystemSpecificConfig]) -> Result<(), ConfigError> {
    for entry in entries {
        if entry.sys_mgmtd_host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        entry.config.validate()?;
    }
    Ok(())
}

/// The configuration in effect on this node for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPluginConfig {
    pub default_config: FilesystemConfig,
    pub file_system_specific_configs: Vec<FileSystemSpecificConfig>,
}

impl ResolvedPluginConfig {
    fn overlay_file_system(&mut self, over: &FileSystemSpecificConfig) {
        match self
            .file_system_specific_configs
            .iter_mut()
            .find(|entry| entry.sys_mgmtd_host == over.sys_mgmtd_host)
        {
            Some(existing) => existing.config.overlay(&over.config),
            None => self.file_system_specific_configs.push(over.clone()),
        }
    }

    /// Attach connection-authentication secrets to their file systems.
    pub fn apply_conn_auth(&mut self, entries: Vec<ConnAuthConfig>) {
        for entry in entries {
            debug!(sys_mgmtd_host = %entry.sys_mgmtd_host, "applying connAuth secret");
            self.overlay_file_system(&FileSystemSpecificConfig {
                sys_mgmtd_host: entry.sys_mgmtd_host,
                config: FilesystemConfig {
                    conn_auth: Some(entry.conn_auth),
                    ..Default::default()
                },
            });
        }
    }
}

/// One entry of the connection-authentication file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnAuthConfig {
    pub sys_mgmtd_host: String,
    pub conn_auth: Secret,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("beegfsClientConf may not set {key:?}, the plugin manages it")]
    ReservedKey { key: String },
    #[error("fileSystemSpecificConfigs entry without sysMgmtdHost")]
    MissingHost,
}

/// Fold every node-specific block that lists `node_id` into the default and
/// filesystem-specific layers, in file order.
pub fn resolve(raw: PluginConfig, node_id: &str) -> Result<ResolvedPluginConfig, ConfigError> {
    raw.validate()?;

    let PluginConfig {
        config,
        file_system_specific_configs,
        node_specific_configs,
    } = raw;
    let mut resolved = ResolvedPluginConfig {
        default_config: config,
        file_system_specific_configs,
    };

    for (index, node_config) in node_specific_configs.iter().enumerate() {
        if !node_config.node_list.iter().any(|name| name == node_id) {
            continue;
        }
        debug!(node_id, index, "applying node-specific configuration");
        resolved.default_config.overlay(&node_config.config);
        for over in &node_config.file_system_specific_configs {
            resolved.overlay_file_system(over);
        }
    }
    Ok(resolved)
}

/// The effective configuration for the file system managed by `host`.
pub fn squash_for_host(host: &str, resolved: &ResolvedPluginConfig) -> FilesystemConfig {
    let mut config = resolved.default_config.clone();
    for entry in resolved
        .file_system_specific_configs
        .iter()
        .filter(|entry| entry.sys_mgmtd_host == host)
    {
        config.overlay(&entry.config);
    }
    config
}

pub fn load_plugin_config(path: &Path) -> Result<PluginConfig, ConfigError> {
    let content = read_file(path)?;
    parse_yaml(&content, &path.display().to_string())
}

pub fn load_conn_auth(path: &Path) -> Result<Vec<ConnAuthConfig>, ConfigError> {
    let content = read_file(path)?;
    parse_yaml(&content, &path.display().to_string())
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_yaml<T: DeserializeOwned + Default>(content: &str, origin: &str) -> Result<T, ConfigError> {
    // An empty document is a valid "no configuration".
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
        origin: origin.to_owned(),
        source,
    })
}

/// Accept any YAML scalar as a client-conf value; `~` means "empty".
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::String(s) => s,
            _ => {
                return Err(D::Error::custom(format!(
                    "beegfsClientConf value for {key:?} must be a scalar"
                )));
            }
        };
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
config:
  connInterfaces: [ib0]
  beegfsClientConf:
    connMgmtdPortTCP: 8008
    connUseRDMA: true
    quotaEnabled: "false"
fileSystemSpecificConfigs:
  - sysMgmtdHost: 10.0.0.1
    config:
      connNetFilter: [10.0.0.0/24]
      beegfsClientConf:
        connMgmtdPortTCP: "9008"
nodeSpecificConfigs:
  - nodeList: [node-a]
    config:
      connInterfaces: [ib1]
      beegfsClientConf:
        quotaEnabled: ""
    fileSystemSpecificConfigs:
      - sysMgmtdHost: 10.0.0.1
        config:
          connTcpOnlyFilter: [10.0.0.5]
      - sysMgmtdHost: 10.0.0.2
        config:
          connInterfaces: [eth9]
  - nodeList: [node-b, node-a]
    config:
      connNetFilter: []
"#;

    fn sample() -> PluginConfig {
        PluginConfig::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn scalars_become_strings() {
        let raw = sample();
        assert_eq!(raw.config.beegfs_client_conf["connMgmtdPortTCP"], "8008");
        assert_eq!(raw.config.beegfs_client_conf["connUseRDMA"], "true");
        assert_eq!(raw.config.conn_net_filter, None);
    }

    #[test]
    fn no_matching_node_leaves_config_untouched() {
        let raw = sample();
        let resolved = resolve(raw.clone(), "node-z").unwrap();
        assert_eq!(resolved.default_config, raw.config);
        assert_eq!(
            resolved.file_system_specific_configs,
            raw.file_system_specific_configs
        );
    }

    #[test]
    fn matching_node_blocks_apply_in_order() {
        let resolved = resolve(sample(), "node-a").unwrap();
        let default = &resolved.default_config;
        assert_eq!(default.conn_interfaces(), ["ib1"]);
        // An explicitly empty value wins over the file default.
        assert_eq!(default.beegfs_client_conf["quotaEnabled"], "");
        // Untouched keys survive.
        assert_eq!(default.beegfs_client_conf["connUseRDMA"], "true");
        // The second block applies on top of the first.
        assert_eq!(default.conn_net_filter, Some(vec![]));

        assert_eq!(resolved.file_system_specific_configs.len(), 2);
        let first = &resolved.file_system_specific_configs[0].config;
        assert_eq!(first.conn_net_filter(), ["10.0.0.0/24"]);
        assert_eq!(first.conn_tcp_only_filter(), ["10.0.0.5"]);
        assert_eq!(
            resolved.file_system_specific_configs[1].sys_mgmtd_host,
            "10.0.0.2"
        );
    }

    #[test]
    fn squash_prefers_file_system_specific_values() {
        let resolved = resolve(sample(), "node-x").unwrap();
        let squashed = squash_for_host("10.0.0.1", &resolved);
        assert_eq!(squashed.conn_interfaces(), ["ib0"]);
        assert_eq!(squashed.conn_net_filter(), ["10.0.0.0/24"]);
        assert_eq!(squashed.beegfs_client_conf["connMgmtdPortTCP"], "9008");
        assert_eq!(squashed.beegfs_client_conf["quotaEnabled"], "false");

        let other = squash_for_host("10.9.9.9", &resolved);
        assert_eq!(other, resolved.default_config);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let raw = PluginConfig::from_yaml(
            "config:\n  beegfsClientConf:\n    connInterfacesFile: /tmp/x\n",
        )
        .unwrap();
        assert!(matches!(
            resolve(raw, "node-a"),
            Err(ConfigError::ReservedKey { key }) if key == "connInterfacesFile"
        ));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        assert!(matches!(
            PluginConfig::from_yaml("config: [unterminated"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            PluginConfig::from_yaml("bogusSection: {}"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(PluginConfig::from_yaml("  \n").unwrap(), PluginConfig::default());
    }

    #[test]
    fn conn_auth_is_never_serialized() {
        let mut resolved = resolve(sample(), "node-x").unwrap();
        let auth: Vec<ConnAuthConfig> = serde_yaml::from_str(
            "- sysMgmtdHost: 10.0.0.1\n  connAuth: hunter2\n- sysMgmtdHost: 10.0.0.3\n  connAuth: s3cret\n",
        )
        .unwrap();
        resolved.apply_conn_auth(auth);

        let squashed = squash_for_host("10.0.0.1", &resolved);
        assert_eq!(squashed.conn_auth.as_ref().map(Secret::expose), Some("hunter2"));
        assert_eq!(resolved.file_system_specific_configs.len(), 2);

        let yaml = serde_yaml::to_string(&resolved).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!yaml.contains("s3cret"));
        assert!(!format!("{resolved:?}").contains("hunter2"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load_plugin_config(Path::new("/nonexistent/beegfs-csi.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
