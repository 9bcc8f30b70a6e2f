//! Volume Operations Façade
//!
//! The fixed operation set the container engine calls. Every call holds one
//! process-wide lock for its whole read-compute-write sequence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::info;

use crate::config::ClusterVolConfig;
use crate::error::{Error, Result};
use crate::hosts::{self, HostRegistry};
use crate::layout::Layout;
use crate::registry::{DefaultLocation, ReconcileReport, VolumeRegistry};
use crate::resolver::{LabelResolver, SystemResolver};

/// Create option redirecting the volume to an existing directory
pub const PATH_OPTION: &str = "path";

/// Name and live path of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: PathBuf,
}

/// Visibility of the volumes this driver manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Every host reaching the clustered filesystem sees the same volumes
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub scope: Scope,
}

/// Volume driver backed by the volume registry
pub struct VolumeDriver {
    registry: VolumeRegistry,
    resolver: Arc<dyn LabelResolver>,
    layout: Layout,
    lock_registries: bool,
    lock: Mutex<()>,
}

impl VolumeDriver {
    pub fn new(
        resolver: Arc<dyn LabelResolver>,
        default: DefaultLocation,
        layout: Layout,
        lock_registries: bool,
    ) -> Self {
        let registry = VolumeRegistry::new(
            Arc::clone(&resolver),
            default,
            layout.clone(),
            lock_registries,
        );
        Self {
            registry,
            resolver,
            layout,
            lock_registries,
            lock: Mutex::new(()),
        }
    }

    /// Build a driver against the live system from configuration
    pub fn from_config(config: &ClusterVolConfig) -> Result<Self> {
        let resolver: Arc<dyn LabelResolver> = Arc::new(SystemResolver::new(&config.resolver));
        let default = DefaultLocation::discover(resolver.as_ref(), &config.cluster.mount)?;
        Ok(Self::new(
            resolver,
            default,
            Layout::from_config(config),
            config.registry.lock,
        ))
    }

    pub fn default_location(&self) -> &DefaultLocation {
        self.registry.default_location()
    }

    /// Host registry on the default filesystem
    pub fn host_registry(&self) -> Result<HostRegistry> {
        HostRegistry::open(
            self.resolver.as_ref(),
            self.registry.default_location(),
            &self.layout,
            self.lock_registries,
        )
    }

    /// Merge this host into the host registry as active
    pub fn register_host(&self) -> Result<String> {
        let hostname = hosts::local_hostname()?;
        self.host_registry()?.register(&hostname)?;
        Ok(hostname)
    }

    pub fn create(&self, name: &str, options: &HashMap<String, String>) -> Result<()> {
        let _guard = self.guard();

        let unknown: Vec<&str> = options
            .keys()
            .map(String::as_str)
            .filter(|key| *key != PATH_OPTION)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "unsupported options: {}",
                unknown.join(", ")
            )));
        }

        let path = options
            .get(PATH_OPTION)
            .filter(|p| !p.is_empty())
            .map(Path::new);
        self.registry.create(name, path)?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<VolumeInfo>> {
        let _guard = self.guard();
        Ok(self
            .registry
            .list()?
            .into_iter()
            .map(|resolved| VolumeInfo {
                name: resolved.volume.name,
                mountpoint: resolved.path,
            })
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        let _guard = self.guard();
        let resolved = self.registry.get(name)?;
        Ok(VolumeInfo {
            name: resolved.volume.name,
            mountpoint: resolved.path,
        })
    }

    /// Removing an unknown volume succeeds
    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.guard();
        self.registry.remove(name)?;
        Ok(())
    }

    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let _guard = self.guard();
        self.registry.path(name)
    }

    /// The clustered filesystem is already mounted; mounting only checks the
    /// volume directory is there
    pub fn mount(&self, name: &str, id: &str) -> Result<PathBuf> {
        let path = self.path(name)?;
        info!("Mount {} for {}: {}", name, id, path.display());
        Ok(path)
    }

    /// The operating system owns the filesystem mount; nothing to undo
    pub fn unmount(&self, name: &str, id: &str) -> Result<()> {
        info!("Unmount {} for {}", name, id);
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: Scope::Global,
        }
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.guard();
        self.registry.reconcile()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data; a panicked holder leaves nothing inconsistent
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resolver::fixture::Fixture;

    pub(crate) fn driver(fx: &Fixture, root: &Path) -> VolumeDriver {
        let resolver: Arc<dyn LabelResolver> = Arc::new(fx.resolver.clone());
        let default = DefaultLocation::discover(resolver.as_ref(), root).unwrap();
        VolumeDriver::new(resolver, default, Layout::default(), true)
    }

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_then_get() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let driver = driver(&fx, &mnt);

        driver.create("data", &HashMap::new()).unwrap();
        assert_eq!(
            driver.get("data").unwrap(),
            VolumeInfo {
                name: "data".into(),
                mountpoint: mnt.join("data"),
            }
        );
        assert_eq!(
            driver.list().unwrap(),
            vec![VolumeInfo {
                name: "data".into(),
                mountpoint: mnt.join("data"),
            }]
        );
    }

    #[test]
    fn test_create_with_path_option() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let other = fx.add_filesystem("OTHERFS", "sdc1");
        let driver = driver(&fx, &mnt);

        let path = other.to_str().unwrap();
        driver.create("data2", &opts(&[("path", path)])).unwrap();
        assert_eq!(driver.get("data2").unwrap().mountpoint, other.join("data2"));

        // An empty path falls back to the default location
        driver.create("data3", &opts(&[("path", "")])).unwrap();
        assert_eq!(driver.get("data3").unwrap().mountpoint, mnt.join("data3"));
    }

    #[test]
    fn test_create_rejects_unknown_options() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let driver = driver(&fx, &mnt);

        let err = driver.create("data", &opts(&[("size", "10G")])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!mnt.join("data").exists());
    }

    #[test]
    fn test_remove_then_get() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let driver = driver(&fx, &mnt);

        driver.create("data", &HashMap::new()).unwrap();
        driver.remove("data").unwrap();
        assert!(driver.get("data").unwrap_err().is_not_found());
        assert!(!mnt.join("data").exists());

        driver.remove("data").unwrap();
    }

    #[test]
    fn test_mount_and_unmount() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let driver = driver(&fx, &mnt);

        assert!(driver.mount("data", "c1").unwrap_err().is_not_found());
        driver.unmount("data", "c1").unwrap();

        driver.create("data", &HashMap::new()).unwrap();
        assert_eq!(driver.mount("data", "c1").unwrap(), mnt.join("data"));
        assert_eq!(driver.path("data").unwrap(), mnt.join("data"));
        driver.unmount("data", "c1").unwrap();
        // Unmount leaves the directory alone
        assert!(mnt.join("data").is_dir());
    }

    #[test]
    fn test_capabilities_are_global() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let scope = driver(&fx, &mnt).capabilities().scope;
        assert_eq!(scope, Scope::Global);
        assert_eq!(scope.as_str(), "global");
        assert_eq!(serde_json::to_string(&scope).unwrap(), "\"global\"");
    }

    #[test]
    fn test_register_host() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let driver = driver(&fx, &mnt);

        let hostname = driver.register_host().unwrap();
        let hosts = driver.host_registry().unwrap().hosts().unwrap();
        assert_eq!(hosts.get(&hostname), Some(&crate::hosts::HostStatus::Active));
    }

    #[test]
    fn test_from_config_requires_labelled_root() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");

        let mut config = ClusterVolConfig::default();
        config.resolver.mountinfo = fx.root().join("mountinfo");
        config.resolver.by_label = fx.root().join("by-label");

        config.cluster.mount = mnt.clone();
        let driver = VolumeDriver::from_config(&config).unwrap();
        assert_eq!(driver.default_location().fs_label, "CLUSTERFS");

        config.cluster.mount = mnt.join("missing");
        assert!(matches!(
            VolumeDriver::from_config(&config),
            Err(Error::InvalidArgument(_))
        ));

        // Unlabelled filesystem
        config.cluster.mount = fx.root().to_path_buf();
        assert!(matches!(
            VolumeDriver::from_config(&config),
            Err(e) if e.is_not_found()
        ));
    }
}
