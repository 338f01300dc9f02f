#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beegfs_csi::config::{PluginConfig, resolve};
use beegfs_csi::ctl::{CtlError, classify};
use beegfs_csi::{BeegfsDriver, CtlExecutor, DriverSettings, Mounter, RunMode};
use libcsi::{CsiError, VolumeCapability};

pub const TEMPLATE: &str = "# BeeGFS client config\n\
    sysMgmtdHost =\n\
    connInterfacesFile =\n\
    connNetFilterFile =\n\
    connTcpOnlyFilterFile =\n\
    connAuthFile =\n\
    connMgmtdPortTCP = 8008\n";

pub const HOST: &str = "10.0.0.1";

/// `beegfs-ctl` stand-in: directories are paths in a set, mirrored into a
/// local directory that plays the BeeGFS root.
#[derive(Default)]
pub struct FakeCtl {
    pub existing: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<Vec<String>>>,
    pub delay: Option<Duration>,
    pub root: Option<PathBuf>,
    /// `--createdir` reports success without creating anything.
    pub phantom_dirs: bool,
}

impl FakeCtl {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_phantom_dirs() -> Self {
        Self {
            phantom_dirs: true,
            ..Default::default()
        }
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.iter().any(|arg| arg == op))
            .count()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.existing.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl CtlExecutor for FakeCtl {
    async fn execute(&self, conf_path: &Path, args: &[String]) -> Result<String, CtlError> {
        assert!(conf_path.exists(), "beegfs-ctl called without a config file");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(args.to_vec());

        let path = args.last().cloned().unwrap_or_default();
        let mut existing = self.existing.lock().unwrap();
        if args.iter().any(|arg| arg == "--getentryinfo") {
            if existing.contains(&path) {
                return Ok(format!("Path: {path}\n"));
            }
            return Err(classify(&format!("Path does not exist: {path}")));
        }
        if args.iter().any(|arg| arg == "--createdir") {
            if !existing.insert(path.clone()) {
                return Err(classify(&format!("Entry exists already: {path}")));
            }
            if let Some(root) = self.root.as_ref().filter(|_| !self.phantom_dirs) {
                std::fs::create_dir_all(root.join(path.trim_start_matches('/'))).unwrap();
            }
        }
        Ok(String::new())
    }
}

/// Records mount state without touching the kernel.
///
/// A BeeGFS mount replaces the (empty) mount point with a symlink to the
/// fake file system root, so code below the mount point sees the volume
/// directories `FakeCtl` created.  Unmounting restores the empty directory.
pub struct FakeMounter {
    pub root: PathBuf,
    pub mounted: Mutex<HashMap<PathBuf, PathBuf>>,
    pub mounts: Mutex<usize>,
    pub unmounts: Mutex<usize>,
}

impl FakeMounter {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            mounted: Mutex::default(),
            mounts: Mutex::default(),
            unmounts: Mutex::default(),
        }
    }

    pub fn mount_count(&self) -> usize {
        *self.mounts.lock().unwrap()
    }

    pub fn unmount_count(&self) -> usize {
        *self.unmounts.lock().unwrap()
    }

    pub fn source_of(&self, target: &Path) -> Option<PathBuf> {
        self.mounted.lock().unwrap().get(target).cloned()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_mounted(&self, path: &Path) -> Result<bool, CsiError> {
        Ok(self.mounted.lock().unwrap().contains_key(path))
    }

    async fn mount_beegfs(
        &self,
        conf_path: &Path,
        mount_point: &Path,
        _flags: &[String],
    ) -> Result<(), CsiError> {
        assert!(conf_path.exists(), "mount without a client config");
        std::fs::remove_dir(mount_point).unwrap();
        std::os::unix::fs::symlink(&self.root, mount_point).unwrap();
        self.mounted
            .lock()
            .unwrap()
            .insert(mount_point.to_path_buf(), conf_path.to_path_buf());
        *self.mounts.lock().unwrap() += 1;
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        _read_only: bool,
    ) -> Result<(), CsiError> {
        self.mounted
            .lock()
            .unwrap()
            .insert(target.to_path_buf(), source.to_path_buf());
        *self.mounts.lock().unwrap() += 1;
        Ok(())
    }

    async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        let is_link = std::fs::symlink_metadata(path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            std::fs::remove_file(path).unwrap();
            std::fs::create_dir(path).unwrap();
        }
        self.mounted.lock().unwrap().remove(path);
        *self.unmounts.lock().unwrap() += 1;
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub ctl: Arc<FakeCtl>,
    pub mounter: Arc<FakeMounter>,
    pub driver: Arc<BeegfsDriver>,
}

impl Harness {
    pub fn new(mode: RunMode) -> Self {
        Self::with_ctl(mode, FakeCtl::default(), "")
    }

    pub fn with_ctl(mode: RunMode, ctl: FakeCtl, config_yaml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("beegfs-client.conf.template");
        std::fs::write(&template, TEMPLATE).unwrap();

        let root = dir.path().join("beegfs");
        std::fs::create_dir(&root).unwrap();

        let config = resolve(PluginConfig::from_yaml(config_yaml).unwrap(), "node-a").unwrap();
        let ctl = Arc::new(FakeCtl {
            root: Some(root.clone()),
            ..ctl
        });
        let mounter = Arc::new(FakeMounter::new(root));
        let driver = BeegfsDriver::new(
            DriverSettings {
                node_id: "node-a".into(),
                mode,
                config,
                data_dir: dir.path().join("data"),
                client_conf_template: template,
            },
            Arc::clone(&ctl) as Arc<dyn CtlExecutor>,
            Arc::clone(&mounter) as Arc<dyn Mounter>,
        );
        Self {
            dir,
            ctl,
            mounter,
            driver: Arc::new(driver),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Local view of a BeeGFS path.
    pub fn remote(&self, path: &str) -> PathBuf {
        self.dir.path().join("beegfs").join(path.trim_start_matches('/'))
    }
}

pub fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

pub fn volume_params() -> HashMap<String, String> {
    params(&[("sysMgmtdHost", HOST), ("volDirBasePath", "/export")])
}

pub fn writer() -> Vec<VolumeCapability> {
    vec![VolumeCapability::default()]
}
