//! ClusterVol Configuration
//!
//! This module provides configuration structures for the ClusterVol
//! volume plugin.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Main ClusterVol configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterVolConfig {
    /// Clustered filesystem configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Plugin endpoint configuration
    #[serde(default)]
    pub plugin: PluginConfig,

    /// Registry storage configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Mount table and label sources
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Clustered filesystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Default root for new volumes; must live on a labelled clustered filesystem
    #[serde(default)]
    pub mount: PathBuf,

    /// Hidden directory created under each filesystem root for plugin data
    #[serde(default = "default_plugin_data_dir")]
    pub plugin_data_dir: String,

    /// Run the crash-recovery pass when the plugin starts
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,
}

/// Plugin endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin name; the socket is `<socket_dir>/<name>.sock`
    #[serde(default = "default_plugin_name")]
    pub name: String,

    /// Directory the container engine scans for plugin sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Optional TCP listener in addition to the Unix socket
    #[serde(default)]
    pub bind_address: Option<String>,
}

/// Registry storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Take an advisory lock around every registry read-modify-write
    #[serde(default = "default_true")]
    pub lock: bool,

    /// Host registry file inside the plugin data directory
    #[serde(default = "default_host_file")]
    pub host_file: String,

    /// Global volume registry file inside the plugin data directory
    #[serde(default = "default_global_file")]
    pub global_file: String,

    /// Per-filesystem volume registry file inside the plugin data directory
    #[serde(default = "default_local_file")]
    pub local_file: String,
}

/// Mount table and label sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Kernel mount table
    #[serde(default = "default_mountinfo")]
    pub mountinfo: PathBuf,

    /// Directory of filesystem-label symlinks maintained by udev
    #[serde(default = "default_by_label")]
    pub by_label: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_plugin_data_dir() -> String {
    ".clustervol".to_string()
}

fn default_true() -> bool {
    true
}

fn default_host_file() -> String {
    "hosts.json".to_string()
}

fn default_global_file() -> String {
    "global.json".to_string()
}

fn default_local_file() -> String {
    "local.json".to_string()
}

fn default_plugin_name() -> String {
    "clusterfs".to_string()
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/docker/plugins")
}

fn default_mountinfo() -> PathBuf {
    PathBuf::from("/proc/self/mountinfo")
}

fn default_by_label() -> PathBuf {
    PathBuf::from("/dev/disk/by-label")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mount: PathBuf::new(),
            plugin_data_dir: default_plugin_data_dir(),
            reconcile_on_start: true,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: default_plugin_name(),
            socket_dir: default_socket_dir(),
            bind_address: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock: true,
            host_file: default_host_file(),
            global_file: default_global_file(),
            local_file: default_local_file(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mountinfo: default_mountinfo(),
            by_label: default_by_label(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterVolConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterVolConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClusterVolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if present, apply the command-line mount override, validate
    pub fn load(path: &Path, mount_override: Option<PathBuf>) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else if mount_override.is_some() {
            ClusterVolConfig::default()
        } else {
            return Err(Error::Config(format!(
                "{} does not exist and no --clustermount given",
                path.display()
            )));
        };

        if let Some(mount) = mount_override {
            config.cluster.mount = mount;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster.mount.as_os_str().is_empty() {
            return Err(Error::Config("cluster.mount cannot be empty".into()));
        }

        let names = [
            ("cluster.plugin_data_dir", &self.cluster.plugin_data_dir),
            ("registry.host_file", &self.registry.host_file),
            ("registry.global_file", &self.registry.global_file),
            ("registry.local_file", &self.registry.local_file),
        ];
        for (key, name) in names {
            if !is_plain_name(name) {
                return Err(Error::Config(format!("{} must be a single relative file name", key)));
            }
        }

        let files = [
            &self.registry.host_file,
            &self.registry.global_file,
            &self.registry.local_file,
        ];
        if files[0] == files[1] || files[0] == files[2] || files[1] == files[2] {
            return Err(Error::Config("registry file names must differ".into()));
        }

        if self.plugin.name.is_empty() || self.plugin.name.contains('/') {
            return Err(Error::Config("plugin.name must be a non-empty file name".into()));
        }

        Ok(())
    }

    /// Get the Unix socket path the plugin listens on
    pub fn socket_path(&self) -> PathBuf {
        self.plugin
            .socket_dir
            .join(format!("{}.sock", self.plugin.name))
    }
}

/// One normal path component, no separators or `.`/`..`
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == name
    )
}
