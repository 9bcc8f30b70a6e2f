//! Volume Registry
//!
//! The global registry on the default filesystem is the one cluster-wide list
//! of volumes. Every filesystem that holds volume directories also keeps a
//! local registry mirroring the entries stored on it, used to rebuild the
//! global one after a crash or a lost update.
//!
//! Entries store a filesystem label plus a path relative to that
//! filesystem's root; the live path is re-resolved on every read.
//!
//! Write order is directory first, then global registry, then local registry.
//! Removal deletes the directory first. Whatever a crash leaves behind is
//! repaired by [`VolumeRegistry::reconcile`], which treats the directories on
//! disk as ground truth.

mod reconcile;

use std::collections::BTreeSet;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::resolver::{join_on_mount, LabelResolver};
use crate::store::{Document, DocumentStore};

pub use reconcile::ReconcileReport;

const VOLUME_DIR_MODE: u32 = 0o750;

/// A named volume as persisted in the registries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    /// Unique volume name
    pub name: String,
    /// Label of the filesystem holding the volume directory
    pub fs_label: String,
    /// Parent directory of the volume, relative to the filesystem root
    pub fs_local_path: String,
    /// Reserved
    #[serde(default)]
    pub status: String,
}

impl Volume {
    pub fn new(name: impl Into<String>, location: &DefaultLocation) -> Self {
        Self {
            name: name.into(),
            fs_label: location.fs_label.clone(),
            fs_local_path: location.fs_local_path.clone(),
            status: String::new(),
        }
    }

    /// Volume directory given the live mount point of its filesystem
    pub fn path_on(&self, mountpoint: &Path) -> PathBuf {
        join_on_mount(mountpoint, &self.fs_local_path).join(&self.name)
    }
}

/// Global or local registry document: `{"Revision": n, "Volumes": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeDocument {
    #[serde(default)]
    pub revision: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub volumes: Vec<Volume>,
}

impl VolumeDocument {
    pub fn find(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Remove `name`; returns whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.volumes.len();
        self.volumes.retain(|v| v.name != name);
        self.volumes.len() != before
    }
}

impl Document for VolumeDocument {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Labels of every filesystem that has ever held a volume. Lets reconcile
/// find all local registries even when the global registry is lost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilesystemDocument {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl Document for FilesystemDocument {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Older writers emit `"Volumes": null` for an empty list
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Volume>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Volume>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Filesystem and sub-path new volumes land in when no path is given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultLocation {
    pub fs_label: String,
    pub fs_local_path: String,
}

impl DefaultLocation {
    /// Derive the default location from the operator-supplied root path
    pub fn discover(resolver: &dyn LabelResolver, root: &Path) -> Result<Self> {
        if fs::symlink_metadata(root).is_err() {
            return Err(Error::InvalidArgument(format!(
                "cluster mount {} does not exist",
                root.display()
            )));
        }

        let location = resolver.resolve_location(root)?;
        info!(
            "Default volume location: {} on filesystem {} (mounted at {})",
            location.relative_path,
            location.label,
            location.mountpoint.display()
        );

        Ok(Self {
            fs_label: location.label,
            fs_local_path: location.relative_path,
        })
    }
}

/// A volume together with its live directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    pub volume: Volume,
    pub path: PathBuf,
}

/// Cluster-wide volume registry plus per-filesystem recovery copies
pub struct VolumeRegistry {
    resolver: Arc<dyn LabelResolver>,
    default: DefaultLocation,
    layout: Layout,
    lock: bool,
}

impl VolumeRegistry {
    pub fn new(
        resolver: Arc<dyn LabelResolver>,
        default: DefaultLocation,
        layout: Layout,
        lock: bool,
    ) -> Self {
        Self {
            resolver,
            default,
            layout,
            lock,
        }
    }

    pub fn default_location(&self) -> &DefaultLocation {
        &self.default
    }

    /// The global registry, found through the default filesystem's live mount point
    pub fn global_store(&self) -> Result<DocumentStore<VolumeDocument>> {
        let mountpoint = self.resolver.resolve_mountpoint(&self.default.fs_label)?;
        Ok(DocumentStore::new(self.layout.global_registry(&mountpoint), self.lock))
    }

    /// The local registry of the filesystem mounted at `mountpoint`
    fn local_store(&self, mountpoint: &Path) -> DocumentStore<VolumeDocument> {
        DocumentStore::new(self.layout.local_registry(mountpoint), self.lock)
    }

    /// Live directory of a registered volume
    pub fn volume_path(&self, volume: &Volume) -> Result<PathBuf> {
        let mountpoint = self.resolver.resolve_mountpoint(&volume.fs_label)?;
        Ok(volume.path_on(&mountpoint))
    }

    /// Create the volume directory and register it globally and locally.
    /// `path` redirects the volume to an existing directory, possibly on
    /// another clustered filesystem.
    pub fn create(&self, name: &str, path: Option<&Path>) -> Result<Volume> {
        validate_name(name)?;

        let location = match path {
            None => self.default.clone(),
            Some(path) => {
                if fs::symlink_metadata(path).is_err() {
                    return Err(Error::InvalidArgument(format!(
                        "given path {} does not exist",
                        path.display()
                    )));
                }
                let location = self.resolver.resolve_location(path)?;
                DefaultLocation {
                    fs_label: location.label,
                    fs_local_path: location.relative_path,
                }
            }
        };

        let global = self.global_store()?;
        if global.load_or_default()?.contains(name) {
            return Err(Error::AlreadyExists(format!("volume {} already exists", name)));
        }

        let volume = Volume::new(name, &location);
        let mountpoint = self.resolver.resolve_mountpoint(&volume.fs_label)?;
        let target = volume.path_on(&mountpoint);

        self.remember_filesystems([volume.fs_label.clone()])?;
        create_dirs(&self.layout.plugin_data(&mountpoint))?;
        if let Some(parent) = target.parent() {
            create_dirs(parent)?;
        }
        // Non-recursive: of several hosts creating the same name, exactly one
        // gets the directory
        match DirBuilder::new().mode(VOLUME_DIR_MODE).create(&target) {
            Ok(()) => debug!("Created volume directory {}", target.display()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!(
                    "volume directory {} already exists",
                    target.display()
                )));
            }
            Err(e) => return Err(Error::io_failure(&target, e)),
        }

        let registered = global.update(|doc| {
            if doc.contains(name) {
                return Err(Error::AlreadyExists(format!("volume {} already exists", name)));
            }
            doc.volumes.push(volume.clone());
            Ok(())
        });
        if let Err(e) = registered {
            // This call created the directory and nothing references it yet
            if let Err(rm) = fs::remove_dir(&target) {
                warn!("Could not roll back {}: {}", target.display(), rm);
            }
            return Err(e);
        }

        self.mirror_local(&mountpoint, |doc| {
            if !doc.contains(name) {
                doc.volumes.push(volume.clone());
            }
        });

        info!(
            "Created volume {} at {} ({}:{})",
            name,
            target.display(),
            volume.fs_label,
            volume.fs_local_path
        );
        Ok(volume)
    }

    /// Every registered volume with its live path. A missing or unreadable
    /// global registry lists as empty; volumes on filesystems this host
    /// cannot currently see are left out.
    pub fn list(&self) -> Result<Vec<ResolvedVolume>> {
        let global = self.global_store()?;
        let doc = match global.load() {
            Ok(doc) => doc.unwrap_or_default(),
            Err(e) => {
                warn!("Global registry {} unreadable: {}", global.path().display(), e);
                return Ok(Vec::new());
            }
        };

        let mut volumes = Vec::with_capacity(doc.volumes.len());
        for volume in doc.volumes {
            match self.volume_path(&volume) {
                Ok(path) => volumes.push(ResolvedVolume { volume, path }),
                Err(e) if e.is_not_found() => {
                    warn!("Skipping volume {}: {}", volume.name, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(volumes)
    }

    /// One registered volume with its live path
    pub fn get(&self, name: &str) -> Result<ResolvedVolume> {
        let global = self.global_store()?;
        let doc = global
            .load()?
            .ok_or_else(|| Error::NotFound("global volumes data unavailable".into()))?;

        if doc.volumes.is_empty() {
            return Err(Error::NotFound("no volumes present".into()));
        }

        let volume = doc
            .find(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("volume {} not found", name)))?;
        let path = self.volume_path(&volume)?;
        Ok(ResolvedVolume { volume, path })
    }

    /// Live path of a volume whose directory must currently exist
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let resolved = self.get(name)?;
        if fs::symlink_metadata(&resolved.path).is_err() {
            return Err(Error::MissingDirectory {
                name: name.to_string(),
                path: resolved.path,
            });
        }
        Ok(resolved.path)
    }

    /// Delete the volume directory, then drop the volume from the global and
    /// local registries. Returns `false` if no such volume was registered.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let global = self.global_store()?;
        let volume = match global.load()?.and_then(|doc| doc.find(name).cloned()) {
            Some(volume) => volume,
            None => {
                debug!("Remove of unknown volume {} ignored", name);
                return Ok(false);
            }
        };

        let mountpoint = self.resolver.resolve_mountpoint(&volume.fs_label)?;
        let path = volume.path_on(&mountpoint);
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Volume directory {} already gone", path.display());
            }
            Err(e) => return Err(Error::io_failure(&path, e)),
        }

        global.update(|doc| {
            doc.remove(name);
            Ok(())
        })?;

        self.mirror_local(&mountpoint, |doc| {
            doc.remove(name);
        });

        info!("Removed volume {} ({})", name, path.display());
        Ok(true)
    }

    /// List of filesystems that have held volumes, next to the global registry
    fn filesystem_store(&self) -> Result<DocumentStore<FilesystemDocument>> {
        let mountpoint = self.resolver.resolve_mountpoint(&self.default.fs_label)?;
        Ok(DocumentStore::new(self.layout.filesystem_registry(&mountpoint), self.lock))
    }

    /// Add labels to the filesystem list; no write if all are already there
    fn remember_filesystems(&self, labels: impl IntoIterator<Item = String>) -> Result<()> {
        self.filesystem_store()?.update(|doc| {
            doc.labels.extend(labels);
            Ok(())
        })
    }

    /// Apply a change to a local registry. Local registries are recovery
    /// copies, so a failure here is logged and left for reconcile.
    fn mirror_local(&self, mountpoint: &Path, change: impl FnOnce(&mut VolumeDocument)) {
        let local = self.local_store(mountpoint);
        let result = local.update(|doc| {
            change(doc);
            Ok(())
        });
        if let Err(e) = result {
            warn!(
                "Local registry {} not updated ({}); run reconcile to repair",
                local.path().display(),
                e
            );
        }
    }
}

/// Volume names become directory names: one plain path component
fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(()),
        _ => Err(Error::InvalidArgument(format!(
            "invalid volume name {:?}",
            name
        ))),
    }
}

fn create_dirs(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(VOLUME_DIR_MODE)
        .create(path)
        .map_err(|e| Error::io_failure(path, e))
}
