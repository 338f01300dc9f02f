//! Generation of `beegfs-client.conf` and its side files.
//!
//! A file system is mounted (or driven through `beegfs-ctl`) with a client
//! configuration derived from an operator-supplied template.  The template
//! is copied line by line; settings the plugin manages are rewritten in
//! place, or appended when the template does not mention them.  List-valued
//! settings live in side files next to the main file, one entry per line.
//!
//! Files are only rewritten when their content changes, and the caller is
//! told whether anything changed so it can decide to remount.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::config::FilesystemConfig;

pub const CLIENT_CONF_NAME: &str = "beegfs-client.conf";

pub const SYS_MGMTD_HOST: &str = "sysMgmtdHost";
pub const CONN_INTERFACES_FILE: &str = "connInterfacesFile";
pub const CONN_NET_FILTER_FILE: &str = "connNetFilterFile";
pub const CONN_TCP_ONLY_FILTER_FILE: &str = "connTcpOnlyFilterFile";
pub const CONN_AUTH_FILE: &str = "connAuthFile";

/// Client settings owned by the plugin; overrides may not set them.
pub const RESERVED_KEYS: [&str; 5] = [
    SYS_MGMTD_HOST,
    CONN_INTERFACES_FILE,
    CONN_NET_FILTER_FILE,
    CONN_TCP_ONLY_FILTER_FILE,
    CONN_AUTH_FILE,
];

const SIDE_FILE_MODE: u32 = 0o644;
const SECRET_FILE_MODE: u32 = 0o600;

/// Result of [`write_client_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfFiles {
    /// Absolute path of the generated `beegfs-client.conf`.
    pub conf_path: PathBuf,
    /// Whether any generated file was created or rewritten.
    pub changed: bool,
}

#[derive(Debug, Error)]
pub enum ClientConfError {
    #[error("client configuration template {} does not exist", path.display())]
    TemplateMissing { path: PathBuf },
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Materialize the client configuration for `host` inside `target_dir`.
#[instrument(skip(config), fields(target_dir = %target_dir.display()))]
pub async fn write_client_files(
    host: &str,
    target_dir: &Path,
    template_path: &Path,
    config: &FilesystemConfig,
) -> Result<ClientConfFiles, ClientConfError> {
    let template = match fs::read_to_string(template_path).await {
        Ok(template) => template,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ClientConfError::TemplateMissing {
                path: template_path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(ClientConfError::Read {
                path: template_path.to_path_buf(),
                source,
            });
        }
    };

    fs::create_dir_all(target_dir)
        .await
        .map_err(|source| ClientConfError::Write {
            path: target_dir.to_path_buf(),
            source,
        })?;

    let mut settings = vec![(SYS_MGMTD_HOST.to_owned(), host.to_owned())];
    let mut changed = false;

    let lists = [
        (CONN_INTERFACES_FILE, config.conn_interfaces()),
        (CONN_NET_FILTER_FILE, config.conn_net_filter()),
        (CONN_TCP_ONLY_FILTER_FILE, config.conn_tcp_only_filter()),
    ];
    for (key, entries) in lists {
        if entries.is_empty() {
            continue;
        }
        let path = target_dir.join(key);
        let mut content = entries.join("\n");
        content.push('\n');
        changed |= write_if_changed(&path, content.as_bytes(), SIDE_FILE_MODE).await?;
        settings.push((key.to_owned(), path.display().to_string()));
    }

    if let Some(secret) = &config.conn_auth {
        let path = target_dir.join(CONN_AUTH_FILE);
        changed |= write_if_changed(&path, secret.expose().as_bytes(), SECRET_FILE_MODE).await?;
        settings.push((CONN_AUTH_FILE.to_owned(), path.display().to_string()));
    }

    for (key, value) in &config.beegfs_client_conf {
        settings.push((key.clone(), value.clone()));
    }

    let conf_path = target_dir.join(CLIENT_CONF_NAME);
    let rendered = render(&template, &settings);
    changed |= write_if_changed(&conf_path, rendered.as_bytes(), SIDE_FILE_MODE).await?;

    debug!(conf_path = %conf_path.display(), changed, "client configuration written");
    Ok(ClientConfFiles { conf_path, changed })
}

/// Delete every file [`write_client_files`] may have created in `target_dir`.
pub async fn remove_client_files(target_dir: &Path) -> Result<(), ClientConfError> {
    let names = [
        CLIENT_CONF_NAME,
        CONN_INTERFACES_FILE,
        CONN_NET_FILTER_FILE,
        CONN_TCP_ONLY_FILTER_FILE,
        CONN_AUTH_FILE,
    ];
    for name in names {
        let path = target_dir.join(name);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed client file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(ClientConfError::Remove { path, source }),
        }
    }
    Ok(())
}

/// Apply `settings` to `template`.
///
/// Uncommented `key = value` lines whose key is in `settings` are rewritten
/// when the value differs.  Settings the template lacks are appended in the
/// order given.
fn render(template: &str, settings: &[(String, String)]) -> String {
    let mut seen = HashSet::new();
    let mut out = String::with_capacity(template.len());

    for line in template.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            if let Some((key, value)) = trimmed.split_once('=') {
                let key = key.trim();
                if let Some((_, wanted)) = settings.iter().find(|(name, _)| name == key) {
                    seen.insert(key.to_owned());
                    if value.trim() != wanted {
                        out.push_str(&format!("{key} = {wanted}\n"));
                        continue;
                    }
                }
            }
        }
        out.push_str(line);
        out.push('\n');
    }

    for (key, value) in settings {
        if !seen.contains(key) {
            out.push_str(&format!("{key} = {value}\n"));
        }
    }
    out
}

/// Write `content` to `path` unless the file already holds exactly that.
async fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> Result<bool, ClientConfError> {
    match fs::read(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ClientConfError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let write_err = |source| ClientConfError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
        .map_err(write_err)?;
    file.write_all(content).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;

    // `mode` only applies on creation.
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(write_err)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    const TEMPLATE: &str = "# BeeGFS client config\n\
        sysMgmtdHost =\n\
        connInterfacesFile =\n\
        \n\
        connMgmtdPortTCP = 8008\n\
        # connMaxInternodeNum = 12\n\
        quotaEnabled=false\n";

    async fn setup() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let template = tmp.path().join("template.conf");
        fs::write(&template, TEMPLATE).await.unwrap();
        (tmp, template)
    }

    #[tokio::test]
    async fn rewrites_managed_keys_and_appends_missing_ones() {
        let (tmp, template) = setup().await;
        let target = tmp.path().join("fs");
        let mut config = FilesystemConfig::default();
        config.conn_interfaces = Some(vec!["ib0".into(), "eth0".into()]);
        config
            .beegfs_client_conf
            .insert("connMgmtdPortTCP".into(), "9008".into());
        config
            .beegfs_client_conf
            .insert("connUseRDMA".into(), "false".into());

        let files = write_client_files("10.0.0.1", &target, &template, &config)
            .await
            .unwrap();
        assert!(files.changed);
        assert_eq!(files.conf_path, target.join(CLIENT_CONF_NAME));

        let conf = fs::read_to_string(&files.conf_path).await.unwrap();
        let iface_path = target.join(CONN_INTERFACES_FILE);
        let expected = format!(
            "# BeeGFS client config\n\
             sysMgmtdHost = 10.0.0.1\n\
             connInterfacesFile = {}\n\
             \n\
             connMgmtdPortTCP = 9008\n\
             # connMaxInternodeNum = 12\n\
             quotaEnabled=false\n\
             connUseRDMA = false\n",
            iface_path.display()
        );
        assert_eq!(conf, expected);
        assert_eq!(
            fs::read_to_string(&iface_path).await.unwrap(),
            "ib0\neth0\n"
        );
        assert!(!target.join(CONN_NET_FILTER_FILE).exists());
    }

    #[tokio::test]
    async fn second_write_reports_unchanged() {
        let (tmp, template) = setup().await;
        let target = tmp.path().join("fs");
        let mut config = FilesystemConfig::default();
        config.conn_net_filter = Some(vec!["10.0.0.0/24".into()]);

        let first = write_client_files("mgmt", &target, &template, &config)
            .await
            .unwrap();
        let before = fs::read(&first.conf_path).await.unwrap();
        let second = write_client_files("mgmt", &target, &template, &config)
            .await
            .unwrap();
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(before, fs::read(&second.conf_path).await.unwrap());

        config.conn_net_filter = Some(vec!["10.1.0.0/16".into()]);
        let third = write_client_files("mgmt", &target, &template, &config)
            .await
            .unwrap();
        assert!(third.changed);
    }

    #[tokio::test]
    async fn conn_auth_file_is_private() {
        let (tmp, template) = setup().await;
        let target = tmp.path().join("fs");
        let config = FilesystemConfig {
            conn_auth: Some(Secret::new("hunter2")),
            ..Default::default()
        };

        let files = write_client_files("mgmt", &target, &template, &config)
            .await
            .unwrap();
        let auth_path = target.join(CONN_AUTH_FILE);
        let meta = fs::metadata(&auth_path).await.unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&auth_path).await.unwrap(), "hunter2");

        let conf = fs::read_to_string(&files.conf_path).await.unwrap();
        assert!(conf.contains(&format!("connAuthFile = {}", auth_path.display())));
        assert!(!conf.contains("hunter2"));
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let err = write_client_files(
            "mgmt",
            tmp.path(),
            &tmp.path().join("absent.conf"),
            &FilesystemConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientConfError::TemplateMissing { .. }));
    }

    #[tokio::test]
    async fn remove_tolerates_missing_files() {
        let (tmp, template) = setup().await;
        let target = tmp.path().join("fs");
        let mut config = FilesystemConfig::default();
        config.conn_tcp_only_filter = Some(vec!["10.0.0.9".into()]);
        write_client_files("mgmt", &target, &template, &config)
            .await
            .unwrap();

        remove_client_files(&target).await.unwrap();
        remove_client_files(&target).await.unwrap();
        let mut entries = fs::read_dir(&target).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[test]
    fn render_keeps_matching_values() {
        let settings = vec![("quotaEnabled".to_owned(), "false".to_owned())];
        assert_eq!(render("quotaEnabled=false\n", &settings), "quotaEnabled=false\n");
    }
}
