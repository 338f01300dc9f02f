use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use beegfs_csi::config::{self, ResolvedPluginConfig};
use beegfs_csi::{BeegfsCtl, BeegfsDriver, DriverSettings, RunMode, SystemMounter};
use clap::Parser;
use libcsi::{CsiServer, Endpoint};
use tracing::info;

/// BeeGFS CSI plugin
#[derive(Parser, Debug)]
#[command(name = "beegfs-csi", version, about = "BeeGFS CSI plugin")]
struct Args {
    /// Socket to serve on: unix:///path or tcp://host:port
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Name of this node, matched against nodeSpecificConfigs
    #[arg(long, env = "KUBE_NODE_NAME")]
    node_id: String,

    #[arg(long, value_enum, default_value_t = RunMode::All)]
    mode: RunMode,

    /// Plugin configuration file (YAML)
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Connection-authentication file (YAML)
    #[arg(long)]
    connauth_path: Option<PathBuf>,

    /// Template every generated beegfs-client.conf starts from
    #[arg(long, default_value = "/etc/beegfs/beegfs-client.conf")]
    client_conf_template: PathBuf,

    /// Scratch directory for controller-side mounts
    #[arg(long, default_value = "/var/lib/kubelet/plugins/beegfs.csi.rk8s.io")]
    data_dir: PathBuf,

    #[arg(long, default_value = "beegfs-ctl")]
    ctl_path: PathBuf,

    #[arg(long, default_value_t = 60)]
    ctl_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    mount_timeout_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<ResolvedPluginConfig> {
    let raw = match &args.config_path {
        Some(path) => config::load_plugin_config(path)?,
        None => Default::default(),
    };
    let mut resolved = config::resolve(raw, &args.node_id)?;
    if let Some(path) = &args.connauth_path {
        resolved.apply_conn_auth(config::load_conn_auth(path)?);
    }
    Ok(resolved)
}

async fn shutdown_signal() {
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), mode = ?args.mode, node_id = %args.node_id, "beegfs-csi starting");

    let resolved = load_config(&args).context("invalid plugin configuration")?;
    if !tokio::fs::try_exists(&args.client_conf_template)
        .await
        .unwrap_or(false)
    {
        bail!(
            "client configuration template {} does not exist",
            args.client_conf_template.display()
        );
    }
    if args.mode.runs_controller() {
        tokio::fs::create_dir_all(&args.data_dir)
            .await
            .with_context(|| format!("create {}", args.data_dir.display()))?;
    }

    let endpoint: Endpoint = args.endpoint.parse()?;
    let driver = BeegfsDriver::new(
        DriverSettings {
            node_id: args.node_id.clone(),
            mode: args.mode,
            config: resolved,
            data_dir: args.data_dir.clone(),
            client_conf_template: args.client_conf_template.clone(),
        },
        Arc::new(BeegfsCtl::new(
            &args.ctl_path,
            Duration::from_secs(args.ctl_timeout_secs),
        )),
        Arc::new(SystemMounter::new(Duration::from_secs(
            args.mount_timeout_secs,
        ))),
    );

    let server = CsiServer::bind(&endpoint, Arc::new(driver)).await?;
    server.serve_with_shutdown(shutdown_signal()).await?;
    info!("beegfs-csi stopped");
    Ok(())
}
