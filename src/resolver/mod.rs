//! Label Resolver
//!
//! Volumes are stored by filesystem label, never by mount path, because the
//! operating system may mount the same filesystem somewhere else after a
//! remount or reboot. Every read goes through a [`LabelResolver`] to turn the
//! label back into the live mount point.

mod system;

#[cfg(test)]
pub(crate) mod fixture;

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub use system::SystemResolver;

/// Marker for "the filesystem root" in a filesystem-relative path
pub const ROOT_MARKER: &str = "/";

/// Where an existing path lives: which labelled filesystem, where that
/// filesystem is mounted right now, and the path relative to its root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Label of the filesystem backing the path
    pub label: String,
    /// Current mount point of that filesystem
    pub mountpoint: PathBuf,
    /// Path below the mount point, `/` for the mount point itself
    pub relative_path: String,
}

/// Live lookups against the host's mount state. Implementations must not cache.
pub trait LabelResolver: Send + Sync {
    /// Current mount point of the filesystem carrying `label`
    fn resolve_mountpoint(&self, label: &str) -> Result<PathBuf>;

    /// Filesystem label, mount point and relative path backing `path`
    fn resolve_location(&self, path: &Path) -> Result<Location>;
}

/// Join a filesystem-relative path (as stored in the registries) onto a
/// live mount point.
pub fn join_on_mount(mountpoint: &Path, relative_path: &str) -> PathBuf {
    let relative = relative_path.trim_start_matches('/');
    if relative.is_empty() {
        mountpoint.to_path_buf()
    } else {
        mountpoint.join(relative)
    }
}

/// Strip `mountpoint` from `path`, yielding the filesystem-relative form
pub fn relative_to_mount(path: &Path, mountpoint: &Path) -> Result<String> {
    let rest = path.strip_prefix(mountpoint).map_err(|_| {
        Error::Internal(format!(
            "{} is not below mount point {}",
            path.display(),
            mountpoint.display()
        ))
    })?;

    let rest = rest.to_str().ok_or_else(|| {
        Error::InvalidArgument(format!("{} is not valid UTF-8", path.display()))
    })?;

    if rest.is_empty() {
        Ok(ROOT_MARKER.to_string())
    } else {
        Ok(format!("/{}", rest))
    }
}
