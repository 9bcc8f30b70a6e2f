//! Where plugin data lives on each clustered filesystem

use std::path::{Path, PathBuf};

use crate::config::ClusterVolConfig;

const FILESYSTEM_REGISTRY_FILE: &str = "filesystems.json";

/// Hidden plugin-data directory under a filesystem's mount root and the
/// documents inside it. Only the default filesystem carries the host, global
/// and filesystem registries; every filesystem that stores volumes carries a
/// local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    dir_name: String,
    host_file: String,
    global_file: String,
    local_file: String,
}

impl Layout {
    pub fn new(dir_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
            host_file: "hosts.json".to_string(),
            global_file: "global.json".to_string(),
            local_file: "local.json".to_string(),
        }
    }

    /// Directory and registry file names as configured
    pub fn from_config(config: &ClusterVolConfig) -> Self {
        Self {
            dir_name: config.cluster.plugin_data_dir.clone(),
            host_file: config.registry.host_file.clone(),
            global_file: config.registry.global_file.clone(),
            local_file: config.registry.local_file.clone(),
        }
    }

    pub fn plugin_data(&self, mountpoint: &Path) -> PathBuf {
        mountpoint.join(&self.dir_name)
    }

    pub fn host_registry(&self, mountpoint: &Path) -> PathBuf {
        self.plugin_data(mountpoint).join(&self.host_file)
    }

    pub fn global_registry(&self, mountpoint: &Path) -> PathBuf {
        self.plugin_data(mountpoint).join(&self.global_file)
    }

    pub fn local_registry(&self, mountpoint: &Path) -> PathBuf {
        self.plugin_data(mountpoint).join(&self.local_file)
    }

    /// Labels of every filesystem that has held a volume
    pub fn filesystem_registry(&self, mountpoint: &Path) -> PathBuf {
        self.plugin_data(mountpoint).join(FILESYSTEM_REGISTRY_FILE)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(".clustervol")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_file_names() {
        let config = ClusterVolConfig::from_str(
            r#"
[cluster]
mount = "/mnt/ocfs2"
plugin_data_dir = ".ocfs2plugindata"

[registry]
host_file = ".global_hosts.json"
global_file = ".global.json"
local_file = ".local.json"
"#,
        )
        .unwrap();

        let layout = Layout::from_config(&config);
        let mnt = Path::new("/mnt/ocfs2");
        assert_eq!(
            layout.global_registry(mnt),
            PathBuf::from("/mnt/ocfs2/.ocfs2plugindata/.global.json")
        );
        assert_eq!(
            layout.local_registry(mnt),
            PathBuf::from("/mnt/ocfs2/.ocfs2plugindata/.local.json")
        );
        assert_eq!(
            layout.host_registry(mnt),
            PathBuf::from("/mnt/ocfs2/.ocfs2plugindata/.global_hosts.json")
        );
    }

    #[test]
    fn test_default_matches_default_config() {
        let mut config = ClusterVolConfig::default();
        config.cluster.mount = PathBuf::from("/mnt/ocfs2");
        assert_eq!(Layout::from_config(&config), Layout::default());
    }
}
