//! Resolver backed by the kernel mount table and the udev by-label directory

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{relative_to_mount, LabelResolver, Location};
use crate::config::ResolverConfig;
use crate::error::{Error, Result};

/// One line of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    /// Root of the mount within its filesystem (not `/` for bind mounts)
    root: String,
    mount_point: PathBuf,
    source: String,
}

/// Queries live mount state on every call
#[derive(Debug, Clone)]
pub struct SystemResolver {
    mountinfo: PathBuf,
    by_label: PathBuf,
}

impl SystemResolver {
    /// Create a resolver from configuration
    pub fn new(config: &ResolverConfig) -> Self {
        Self::with_paths(config.mountinfo.clone(), config.by_label.clone())
    }

    /// Create a resolver reading the given mount table and label directory
    pub fn with_paths(mountinfo: impl Into<PathBuf>, by_label: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
            by_label: by_label.into(),
        }
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.mountinfo).map_err(|e| {
            Error::ExternalTool(format!("cannot read {}: {}", self.mountinfo.display(), e))
        })?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                parse_mountinfo_line(line).ok_or_else(|| {
                    Error::ExternalTool(format!("unparsable mount table line: {:?}", line))
                })
            })
            .collect()
    }

    /// All (label, device) pairs currently advertised
    fn labelled_devices(&self) -> Result<Vec<(String, PathBuf)>> {
        let entries = match fs::read_dir(&self.by_label) {
            Ok(entries) => entries,
            // No labelled filesystem on this host at all
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::ExternalTool(format!(
                    "cannot read {}: {}",
                    self.by_label.display(),
                    e
                )))
            }
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::ExternalTool(e.to_string()))?;
            let label = unescape_label(&entry.file_name().to_string_lossy());
            // Dangling links belong to devices that went away
            if let Ok(device) = fs::canonicalize(entry.path()) {
                devices.push((label, device));
            }
        }
        // read_dir order is unspecified
        devices.sort();
        Ok(devices)
    }

    fn device_of_label(&self, label: &str) -> Result<PathBuf> {
        self.labelled_devices()?
            .into_iter()
            .find(|(l, _)| l == label)
            .map(|(_, device)| device)
            .ok_or_else(|| Error::NotFound(format!("no device carries label {}", label)))
    }

    fn label_of_device(&self, device: &Path) -> Result<Option<String>> {
        Ok(self
            .labelled_devices()?
            .into_iter()
            .find(|(_, d)| d == device)
            .map(|(label, _)| label))
    }
}

impl LabelResolver for SystemResolver {
    fn resolve_mountpoint(&self, label: &str) -> Result<PathBuf> {
        let device = self.device_of_label(label)?;
        let table = self.mount_table()?;

        let mounted: Vec<&MountEntry> = table
            .iter()
            .filter(|entry| canonical_source(&entry.source) == device)
            .collect();

        // Prefer a mount of the filesystem root over bind mounts of subtrees
        let chosen = mounted
            .iter()
            .find(|entry| entry.root == "/")
            .or_else(|| mounted.first())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "device {} carrying label {} is not mounted",
                    device.display(),
                    label
                ))
            })?;

        debug!(
            "Label {} -> {} mounted at {}",
            label,
            device.display(),
            chosen.mount_point.display()
        );
        Ok(chosen.mount_point.clone())
    }

    fn resolve_location(&self, path: &Path) -> Result<Location> {
        let path = fs::canonicalize(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotFound(format!("{} does not exist", path.display())),
            _ => Error::io_failure(path, e),
        })?;

        let table = self.mount_table()?;
        // Longest covering mount point wins; later entries shadow earlier ones
        let entry = table
            .iter()
            .filter(|entry| path.starts_with(&entry.mount_point))
            // max_by_key keeps the last of equal maxima
            .max_by_key(|entry| entry.mount_point.as_os_str().len())
            .ok_or_else(|| {
                Error::ExternalTool(format!("no mount table entry covers {}", path.display()))
            })?;

        let device = canonical_source(&entry.source);
        let label = self.label_of_device(&device)?.ok_or_else(|| {
            Error::NotFound(format!("filesystem on {} has no label", entry.source))
        })?;

        let relative_path = relative_to_mount(&path, &entry.mount_point)?;
        debug!(
            "{} is {} on {} ({})",
            path.display(),
            relative_path,
            label,
            entry.mount_point.display()
        );

        Ok(Location {
            label,
            mountpoint: entry.mount_point.clone(),
            relative_path,
        })
    }
}

fn canonical_source(source: &str) -> PathBuf {
    fs::canonicalize(source).unwrap_or_else(|_| PathBuf::from(source))
}

/// Parse one mount table line:
/// `id parent major:minor root mount-point options [optional...] - fstype source super-options`
fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }

    let separator = fields.iter().skip(6).position(|f| *f == "-")? + 6;
    let source = fields.get(separator + 2)?;

    Some(MountEntry {
        root: unescape_octal(fields[3]),
        mount_point: PathBuf::from(unescape_octal(fields[4])),
        source: unescape_octal(source),
    })
}

/// Mount table fields escape space, tab, newline and backslash as `\ooo`
fn unescape_octal(field: &str) -> String {
    unescape(field, |bytes| {
        let digits = bytes.get(1..4)?;
        let value = u8::from_str_radix(std::str::from_utf8(digits).ok()?, 8).ok()?;
        Some((value, 4))
    })
}

/// udev escapes unsafe characters in link names as `\xNN`
fn unescape_label(name: &str) -> String {
    unescape(name, |bytes| {
        if bytes.get(1) != Some(&b'x') {
            return None;
        }
        let digits = bytes.get(2..4)?;
        let value = u8::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()?;
        Some((value, 4))
    })
}

/// Replace backslash escapes; `decode` sees the bytes from the backslash on
/// and returns the decoded byte plus how many input bytes it consumed.
fn unescape(input: &str, decode: impl Fn(&[u8]) -> Option<(u8, usize)>) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some((value, consumed)) = decode(&bytes[i..]) {
                out.push(value);
                i += consumed;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::fixture::Fixture;

    #[test]
    fn test_parse_mountinfo_line() {
        let line = "36 35 98:0 / /mnt/ocfs2 rw,noatime master:1 - ocfs2 /dev/sdb1 rw";
        let entry = parse_mountinfo_line(line).unwrap();
        assert_eq!(entry.root, "/");
        assert_eq!(entry.mount_point, PathBuf::from("/mnt/ocfs2"));
        assert_eq!(entry.source, "/dev/sdb1");

        // No optional fields
        let line = "22 1 8:1 /sub /mnt/with\\040space rw - ext4 /dev/sda1 rw";
        let entry = parse_mountinfo_line(line).unwrap();
        assert_eq!(entry.root, "/sub");
        assert_eq!(entry.mount_point, PathBuf::from("/mnt/with space"));

        assert!(parse_mountinfo_line("garbage").is_none());
        assert!(parse_mountinfo_line("1 2 3:4 / /mnt rw shared:1 ext4 /dev/x rw").is_none());
    }

    #[test]
    fn test_unescape_label() {
        assert_eq!(unescape_label("CLUSTERFS"), "CLUSTERFS");
        assert_eq!(unescape_label("my\\x20data"), "my data");
        assert_eq!(unescape_label("a\\x2fb"), "a/b");
        assert_eq!(unescape_label("trailing\\x2"), "trailing\\x2");
    }

    #[test]
    fn test_resolve_mountpoint() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");

        assert_eq!(fx.resolver.resolve_mountpoint("CLUSTERFS").unwrap(), mnt);
        assert!(fx.resolver.resolve_mountpoint("NOPE").unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_mountpoint_follows_remount() {
        let fx = Fixture::new();
        let first = fx.add_filesystem("CLUSTERFS", "sdb1");
        fx.unmount(&first);
        assert!(fx.resolver.resolve_mountpoint("CLUSTERFS").unwrap_err().is_not_found());

        let second = fx.mount_device("sdb1", "elsewhere");
        assert_eq!(fx.resolver.resolve_mountpoint("CLUSTERFS").unwrap(), second);
    }

    #[test]
    fn test_resolve_location() {
        let fx = Fixture::new();
        let mnt = fx.add_filesystem("CLUSTERFS", "sdb1");
        std::fs::create_dir_all(mnt.join("vols/app")).unwrap();

        let root = fx.resolver.resolve_location(&mnt).unwrap();
        assert_eq!(root.label, "CLUSTERFS");
        assert_eq!(root.mountpoint, mnt);
        assert_eq!(root.relative_path, "/");

        let nested = fx.resolver.resolve_location(&mnt.join("vols/app")).unwrap();
        assert_eq!(nested.relative_path, "/vols/app");

        assert!(fx
            .resolver
            .resolve_location(&mnt.join("missing"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_resolve_location_unlabelled() {
        let fx = Fixture::new();
        // The fixture root is covered only by the unlabelled "/" entry
        let err = fx.resolver.resolve_location(fx.root()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unreadable_mount_table() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SystemResolver::with_paths(dir.path().join("nope"), dir.path());
        std::fs::create_dir_all(dir.path().join("x")).unwrap();
        assert!(matches!(
            resolver.resolve_location(&dir.path().join("x")),
            Err(Error::ExternalTool(_))
        ));
    }
}
