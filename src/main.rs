//! ClusterVol - Cluster-wide Named Volumes
//!
//! Volume plugin daemon and operator commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clustervol::api::PluginServer;
use clustervol::config::ClusterVolConfig;
use clustervol::driver::VolumeDriver;

/// ClusterVol - named volumes on a shared clustered filesystem
#[derive(Parser)]
#[command(name = "clustervol")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "clustervol.toml")]
    config: PathBuf,

    /// Default root for new volumes (overrides cluster.mount)
    #[arg(long, global = true)]
    clustermount: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the volume plugin
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "clustervol.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration and the resolved default location
    Info,

    /// List volumes with their current paths
    List,

    /// List hosts in the host registry
    Hosts,

    /// Repair the registries against the volume directories on disk
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
        return run_init(output, cli.clustermount.as_ref());
    }

    let loaded = ClusterVolConfig::load(&cli.config, cli.clustermount.clone());

    // Initialize logging
    match &loaded {
        Ok(config) => init_logging(
            cli.log_level.as_deref().unwrap_or(&config.logging.level),
            &config.logging.format,
        ),
        Err(_) => init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty"),
    }

    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", cli.config, e);
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Start => run_start(config).await,
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Validate => run_validate(&config),
        Commands::Info => run_info(&config),
        Commands::List => run_list(&config),
        Commands::Hosts => run_hosts(&config),
        Commands::Reconcile => run_reconcile(&config),
    }
}

/// Initialize logging; output goes to stderr so command output stays clean
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn open_driver(config: &ClusterVolConfig) -> anyhow::Result<VolumeDriver> {
    VolumeDriver::from_config(config).with_context(|| {
        format!(
            "cannot resolve default volume location {}",
            config.cluster.mount.display()
        )
    })
}

/// Start the volume plugin
async fn run_start(config: ClusterVolConfig) -> anyhow::Result<()> {
    tracing::info!("Starting ClusterVol plugin...");

    let driver = open_driver(&config)?;
    let hostname = driver.register_host().context("cannot update host registry")?;
    tracing::info!(
        "Host {} active on filesystem {}",
        hostname,
        driver.default_location().fs_label
    );

    if config.cluster.reconcile_on_start {
        match driver.reconcile() {
            Ok(report) if !report.is_clean() => {
                tracing::warn!("Startup reconcile repaired registries: {:?}", report);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Startup reconcile failed: {}", e),
        }
    }

    let server = PluginServer::new(
        config.socket_path(),
        config.plugin.bind_address.clone(),
        Arc::new(driver),
    );

    let result = tokio::select! {
        result = server.start() => result,
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    server.cleanup();
    if let Err(e) = &result {
        tracing::error!("Plugin server error: {}", e);
    }
    Ok(result?)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

/// Initialize configuration file
fn run_init(output: &PathBuf, clustermount: Option<&PathBuf>) -> anyhow::Result<()> {
    let mount = clustermount
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/mnt/ocfs2".to_string());

    let config_content = format!(r#"# ClusterVol Configuration
# Generated configuration file

[cluster]
# Default root for new volumes; must be on a labelled clustered filesystem
mount = "{mount}"
plugin_data_dir = ".clustervol"
reconcile_on_start = true

[plugin]
name = "clusterfs"
socket_dir = "/run/docker/plugins"
# bind_address = "127.0.0.1:9876"

[registry]
# Advisory locks around registry updates; the filesystem must support
# cluster-wide flock for this to protect against other hosts
lock = true
host_file = "hosts.json"
global_file = "global.json"
local_file = "local.json"

[resolver]
mountinfo = "/proc/self/mountinfo"
by_label = "/dev/disk/by-label"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(output, config_content)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point cluster.mount at your clustered filesystem.");
    println!("Then start with: clustervol --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config: &ClusterVolConfig) -> anyhow::Result<()> {
    println!("✓ Configuration is valid");
    println!("  Cluster Mount:  {}", config.cluster.mount.display());
    println!("  Plugin Socket:  {}", config.socket_path().display());
    println!("  Registry Lock:  {}", config.registry.lock);
    Ok(())
}

/// Show configuration and resolved default location
fn run_info(config: &ClusterVolConfig) -> anyhow::Result<()> {
    println!("ClusterVol Plugin Information");
    println!("=============================");
    println!();
    println!("Cluster Mount:    {}", config.cluster.mount.display());
    println!("Plugin Data Dir:  {}", config.cluster.plugin_data_dir);
    println!("Plugin Socket:    {}", config.socket_path().display());
    if let Some(address) = &config.plugin.bind_address {
        println!("TCP Listener:     {}", address);
    }
    println!("Registry Lock:    {}", config.registry.lock);
    println!();

    let driver = open_driver(config)?;
    let default = driver.default_location();
    println!("Default Location:");
    println!("  Filesystem:     {}", default.fs_label);
    println!("  Path on FS:     {}", default.fs_local_path);

    Ok(())
}

/// List volumes
fn run_list(config: &ClusterVolConfig) -> anyhow::Result<()> {
    let volumes = open_driver(config)?.list()?;

    if volumes.is_empty() {
        println!("No volumes");
        return Ok(());
    }

    println!("{:<30} MOUNTPOINT", "NAME");
    for volume in volumes {
        println!("{:<30} {}", volume.name, volume.mountpoint.display());
    }
    Ok(())
}

/// List hosts
fn run_hosts(config: &ClusterVolConfig) -> anyhow::Result<()> {
    let hosts = open_driver(config)?.host_registry()?.hosts()?;

    println!("{:<30} STATUS", "HOST");
    for (hostname, status) in hosts {
        println!("{:<30} {}", hostname, status);
    }
    Ok(())
}

/// Run the reconcile pass and print what changed
fn run_reconcile(config: &ClusterVolConfig) -> anyhow::Result<()> {
    let report = open_driver(config)?.reconcile()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
