//! Fake host for tests: a mount table file, a by-label directory and
//! device nodes (plain files) inside a temp dir.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::SystemResolver;

pub(crate) struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    pub resolver: SystemResolver,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        for sub in ["dev", "by-label", "mnt"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        fs::write(
            root.join("mountinfo"),
            "1 0 8:1 / / rw,relatime shared:1 - ext4 /dev/clustervol-test-root rw\n",
        )
        .unwrap();

        let resolver = SystemResolver::with_paths(root.join("mountinfo"), root.join("by-label"));
        Self {
            _dir: dir,
            root,
            resolver,
        }
    }

    /// Temp dir holding the whole fake host
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a labelled device and mount it at `mnt/<device>`
    pub fn add_filesystem(&self, label: &str, device: &str) -> PathBuf {
        self.add_device(label, device);
        self.mount_device(device, device)
    }

    /// Create a labelled device without mounting it
    pub fn add_device(&self, label: &str, device: &str) {
        let node = self.root.join("dev").join(device);
        fs::write(&node, b"").unwrap();
        std::os::unix::fs::symlink(&node, self.root.join("by-label").join(label)).unwrap();
    }

    /// Mount an existing device at `mnt/<dir>`
    pub fn mount_device(&self, device: &str, dir: &str) -> PathBuf {
        let mountpoint = self.root.join("mnt").join(dir);
        fs::create_dir_all(&mountpoint).unwrap();

        let mut table = OpenOptions::new()
            .append(true)
            .open(self.root.join("mountinfo"))
            .unwrap();
        writeln!(
            table,
            "100 1 98:0 / {} rw,noatime shared:7 - ocfs2 {} rw,heartbeat=local",
            mountpoint.display(),
            self.root.join("dev").join(device).display()
        )
        .unwrap();

        mountpoint
    }

    /// Drop every mount table entry for `mountpoint` (the directory stays)
    pub fn unmount(&self, mountpoint: &Path) {
        let path = self.root.join("mountinfo");
        let needle = format!(" {} ", mountpoint.display());
        let kept: String = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .filter(|line| !line.contains(&needle))
            .map(|line| format!("{}\n", line))
            .collect();
        fs::write(path, kept).unwrap();
    }
}
