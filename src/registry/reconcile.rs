//! Crash recovery for the volume registries
//!
//! Directories on disk are ground truth:
//! - a global entry whose filesystem is mounted but whose directory is gone
//!   is dropped (a removal that crashed before updating metadata)
//! - a global entry missing from its filesystem's local registry is added there
//! - a local entry with a live directory but no global entry is restored
//!   into the global registry (lost update, or a rebuilt global registry)
//! - a local entry with neither is dropped
//!
//! Local registries are found through the filesystem list kept next to the
//! global registry, so volumes on every filesystem survive a lost global
//! registry. Filesystems whose label does not resolve on this host are left
//! alone.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use super::{VolumeDocument, VolumeRegistry};
use crate::error::{Error, Result};

/// What a reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Dropped from the global registry: directory missing
    pub pruned: Vec<String>,
    /// Re-added to the global registry from a local registry
    pub restored: Vec<String>,
    /// Added to a local registry from the global registry
    pub mirrored: Vec<String>,
    /// Dropped from a local registry: not registered and no directory
    pub dropped_local: Vec<String>,
    /// Labels that could not be resolved on this host
    pub skipped_labels: Vec<String>,
    /// Where an unreadable global registry was moved to, if any
    pub quarantined: Option<PathBuf>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.pruned.is_empty()
            && self.restored.is_empty()
            && self.mirrored.is_empty()
            && self.dropped_local.is_empty()
            && self.quarantined.is_none()
    }
}

impl VolumeRegistry {
    /// Bring the global and local registries back in line with the volume
    /// directories present on disk
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let global = self.global_store()?;

        let snapshot = match global.load() {
            Ok(doc) => doc.unwrap_or_default(),
            Err(Error::Serialization(e)) => {
                warn!(
                    "Global registry {} is corrupt ({}); rebuilding from local registries",
                    global.path().display(),
                    e
                );
                report.quarantined = Some(global.quarantine()?);
                VolumeDocument::default()
            }
            Err(e) => return Err(e),
        };

        let filesystems = self.filesystem_store()?;
        let known = match filesystems.load() {
            Ok(doc) => doc.unwrap_or_default().labels,
            Err(Error::Serialization(e)) => {
                warn!(
                    "Filesystem list {} is corrupt ({}); rebuilding from the global registry",
                    filesystems.path().display(),
                    e
                );
                filesystems.quarantine()?;
                BTreeSet::new()
            }
            Err(e) => return Err(e),
        };

        let labels: BTreeSet<String> = snapshot
            .volumes
            .iter()
            .map(|v| v.fs_label.clone())
            .chain(known)
            .chain(std::iter::once(self.default.fs_label.clone()))
            .collect();
        // Registries written before the list existed only name their
        // filesystems in the global registry
        self.remember_filesystems(labels.iter().cloned())?;

        let mut mounted = BTreeMap::new();
        for label in labels {
            match self.resolver.resolve_mountpoint(&label) {
                Ok(mountpoint) => {
                    mounted.insert(label, mountpoint);
                }
                Err(e) if e.is_not_found() => {
                    warn!("Not reconciling filesystem {}: {}", label, e);
                    report.skipped_labels.push(label);
                }
                Err(e) => return Err(e),
            }
        }

        global.update(|doc| {
            doc.volumes.retain(|volume| match mounted.get(&volume.fs_label) {
                Some(mountpoint) if !volume.path_on(mountpoint).exists() => {
                    report.pruned.push(volume.name.clone());
                    false
                }
                _ => true,
            });

            for (label, mountpoint) in &mounted {
                self.local_store(mountpoint).update(|local| {
                    local.volumes.retain(|volume| {
                        if doc.contains(&volume.name) {
                            return true;
                        }
                        if report.pruned.contains(&volume.name) {
                            return false;
                        }
                        if volume.path_on(mountpoint).exists() {
                            doc.volumes.push(volume.clone());
                            report.restored.push(volume.name.clone());
                            true
                        } else {
                            report.dropped_local.push(volume.name.clone());
                            false
                        }
                    });

                    for volume in doc.volumes.iter().filter(|v| &v.fs_label == label) {
                        if !local.contains(&volume.name) {
                            local.volumes.push(volume.clone());
                            report.mirrored.push(volume.name.clone());
                        }
                    }
                    Ok(())
                })?;
            }
            Ok(())
        })?;

        if report.is_clean() {
            info!("Registries consistent");
        } else {
            info!(
                "Reconciled registries: {} pruned, {} restored, {} mirrored, {} dropped from local",
                report.pruned.len(),
                report.restored.len(),
                report.mirrored.len(),
                report.dropped_local.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::registry::{DefaultLocation, FilesystemDocument, Volume};
    use crate::resolver::fixture::Fixture;
    use crate::resolver::LabelResolver;
    use crate::store::DocumentStore;
    use std::path::Path;
    use std::sync::Arc;

    fn registry(fx: &Fixture, root: &Path) -> VolumeRegistry {
        let resolver: Arc<dyn LabelResolver> = Arc::new(fx.resolver.clone());
        let default = DefaultLocation::discover(resolver.as_ref(), root).unwrap();
        VolumeRegistry::new(resolver, default, Layout::default(), true)
    }

    fn local(mountpoint: &Path) -> DocumentStore<VolumeDocument> {
        DocumentStore::new(mountpoint.join(".clustervol/local.json"), false)
    }

    fn names(doc: &VolumeDocument) -> Vec<&str> {
        let mut names: Vec<_> = doc.volumes.iter().map(|v| v.name.as_str()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_consistent_registries_are_untouched() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let reg = registry(&fx, &mnt);
        reg.create("a", None).unwrap();

        let global_path = reg.global_store().unwrap().path().to_path_buf();
        let before = fs::read(&global_path).unwrap();

        let report = reg.reconcile().unwrap();
        assert!(report.is_clean());
        assert_eq!(fs::read(&global_path).unwrap(), before);
    }

    #[test]
    fn test_prunes_entries_without_directory() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let reg = registry(&fx, &mnt);
        reg.create("a", None).unwrap();
        reg.create("b", None).unwrap();

        // Crash after deleting the directory, before touching metadata
        fs::remove_dir(mnt.join("a")).unwrap();

        let report = reg.reconcile().unwrap();
        assert_eq!(report.pruned, vec!["a"]);
        assert!(reg.get("a").unwrap_err().is_not_found());
        assert_eq!(names(&local(&mnt).load().unwrap().unwrap()), vec!["b"]);
    }

    #[test]
    fn test_mirrors_missing_local_entries() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let other = fx.add_filesystem("OTHERFS", "sdc1");
        let reg = registry(&fx, &mnt);
        reg.create("a", Some(&other)).unwrap();

        // Crash between the global and the local write
        fs::remove_file(other.join(".clustervol/local.json")).unwrap();

        let report = reg.reconcile().unwrap();
        assert_eq!(report.mirrored, vec!["a"]);
        assert_eq!(names(&local(&other).load().unwrap().unwrap()), vec!["a"]);
    }

    #[test]
    fn test_restores_lost_global_entries() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let reg = registry(&fx, &mnt);
        reg.create("a", None).unwrap();
        reg.create("b", None).unwrap();

        // Another host overwrote the global registry without "b"
        reg.global_store()
            .unwrap()
            .update(|doc| {
                doc.remove("b");
                Ok(())
            })
            .unwrap();
        // And a stale local entry whose directory is long gone
        local(&mnt)
            .update(|doc| {
                doc.volumes.push(Volume {
                    name: "ghost".into(),
                    fs_label: "CLUSTERFS".into(),
                    fs_local_path: "/".into(),
                    status: String::new(),
                });
                Ok(())
            })
            .unwrap();

        let report = reg.reconcile().unwrap();
        assert_eq!(report.restored, vec!["b"]);
        assert_eq!(report.dropped_local, vec!["ghost"]);
        assert_eq!(reg.get("b").unwrap().path, mnt.join("b"));
        assert_eq!(names(&local(&mnt).load().unwrap().unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_rebuilds_corrupt_global_registry() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let reg = registry(&fx, &mnt);
        reg.create("a", None).unwrap();

        let global_path = reg.global_store().unwrap().path().to_path_buf();
        fs::write(&global_path, "{\"Volumes\": [{\"Na").unwrap();

        let report = reg.reconcile().unwrap();
        assert!(report.quarantined.is_some());
        assert_eq!(report.restored, vec!["a"]);
        assert_eq!(reg.get("a").unwrap().path, mnt.join("a"));
    }

    #[test]
    fn test_rebuild_covers_every_filesystem() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let other = fx.add_filesystem("OTHERFS", "sdc1");
        let reg = registry(&fx, &mnt);
        reg.create("a", None).unwrap();
        reg.create("data2", Some(&other)).unwrap();

        let global_path = reg.global_store().unwrap().path().to_path_buf();
        fs::write(&global_path, "{\"Volumes\": [{\"Na").unwrap();

        let mut report = reg.reconcile().unwrap();
        report.restored.sort();
        assert!(report.quarantined.is_some());
        assert_eq!(report.restored, vec!["a", "data2"]);
        assert_eq!(reg.get("a").unwrap().path, mnt.join("a"));
        assert_eq!(reg.get("data2").unwrap().path, other.join("data2"));
    }

    #[test]
    fn test_backfills_filesystem_list() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let other = fx.add_filesystem("OTHERFS", "sdc1");
        let reg = registry(&fx, &mnt);
        reg.create("data2", Some(&other)).unwrap();

        // Deployment from before the filesystem list existed
        let list_path = mnt.join(".clustervol/filesystems.json");
        fs::remove_file(&list_path).unwrap();

        assert!(reg.reconcile().unwrap().is_clean());
        let list: DocumentStore<FilesystemDocument> = DocumentStore::new(&list_path, false);
        let labels: Vec<_> = list.load().unwrap().unwrap().labels.into_iter().collect();
        assert_eq!(labels, vec!["CLUSTERFS", "OTHERFS"]);

        // Now a lost global registry no longer hides OTHERFS
        fs::remove_file(reg.global_store().unwrap().path()).unwrap();
        let report = reg.reconcile().unwrap();
        assert_eq!(report.restored, vec!["data2"]);
    }

    #[test]
    fn test_corrupt_filesystem_list_is_rebuilt() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let other = fx.add_filesystem("OTHERFS", "sdc1");
        let reg = registry(&fx, &mnt);
        reg.create("data2", Some(&other)).unwrap();

        let list_path = mnt.join(".clustervol/filesystems.json");
        fs::write(&list_path, "{\"Labels\": [").unwrap();

        reg.reconcile().unwrap();
        assert!(mnt.join(".clustervol/filesystems.json.corrupt").is_file());
        let list: DocumentStore<FilesystemDocument> = DocumentStore::new(&list_path, false);
        assert!(list.load().unwrap().unwrap().labels.contains("OTHERFS"));

        // Creates work again
        reg.create("data3", Some(&other)).unwrap();
    }

    #[test]
    fn test_skips_unmounted_filesystems() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        let other = fx.add_filesystem("OTHERFS", "sdc1");
        let reg = registry(&fx, &mnt);
        reg.create("far", Some(&other)).unwrap();

        fx.unmount(&other);

        let report = reg.reconcile().unwrap();
        assert_eq!(report.skipped_labels, vec!["OTHERFS"]);
        assert!(report.pruned.is_empty());

        let global = reg.global_store().unwrap().load().unwrap().unwrap();
        assert!(global.contains("far"));
    }
}
