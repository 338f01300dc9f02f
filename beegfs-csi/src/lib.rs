//! # beegfs-csi: BeeGFS storage plugin for RK8s
//!
//! Exposes BeeGFS directories as volumes through the [`libcsi`] services.
//! The controller creates and deletes directories with `beegfs-ctl`; the
//! node plugin mounts the file system and bind-mounts volume directories
//! into workloads.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`volume_id`] | `beegfs://<host>/<path>` identifiers and local name sanitizing. |
//! | [`config`] | Plugin configuration file and its per-node resolution. |
//! | [`client_conf`] | Generated `beegfs-client.conf` and side files. |
//! | [`ctl`] | `beegfs-ctl` invocation and directory-tree creation. |
//! | [`guard`] | Per-volume key lock and status ledger. |
//! | [`params`] | Storage-class parameters and capability checks. |
//! | [`mount`] | Mount, bind-mount and unmount. |
//! | [`controller`] / [`node`] / [`identity`] | The CSI services. |
//! | [`driver`] | Run modes and composition of the services. |

pub mod client_conf;
pub mod config;
pub mod controller;
pub mod ctl;
pub mod driver;
mod error;
pub mod guard;
pub mod identity;
pub mod mount;
pub mod node;
pub mod params;
pub mod volume_id;

pub use config::{ResolvedPluginConfig, resolve};
pub use ctl::{BeegfsCtl, CtlExecutor};
pub use driver::{BeegfsDriver, DriverSettings, RunMode};
pub use mount::{Mounter, SystemMounter};
