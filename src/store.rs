//! Registry Document Store
//!
//! Each registry is one JSON document on a clustered filesystem, shared
//! read/write by every host that mounts it. Writers serialize on an advisory
//! `flock` of a sibling `.lock` file, re-check the document revision before
//! writing, and replace the file with a rename so readers never see a
//! half-written document.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const DOCUMENT_MODE: u32 = 0o640;

/// A whole-file registry document
pub trait Document: Serialize + DeserializeOwned + Default + Clone + PartialEq {
    /// Counter bumped on every write, for formats that carry one
    fn revision(&self) -> u64 {
        0
    }

    fn set_revision(&mut self, _revision: u64) {}
}

/// One JSON document file plus its lock file
#[derive(Debug, Clone)]
pub struct DocumentStore<T> {
    path: PathBuf,
    lock: bool,
    _document: PhantomData<fn() -> T>,
}

impl<T: Document> DocumentStore<T> {
    /// Create a store for `path`; with `lock` false no advisory lock is taken
    pub fn new(path: impl Into<PathBuf>, lock: bool) -> Self {
        Self {
            path: path.into(),
            lock,
            _document: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document; `None` if the file does not exist
    pub fn load(&self) -> Result<Option<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io_failure(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(T::default()));
        }

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Read the document, treating a missing file as an empty one
    pub fn load_or_default(&self) -> Result<T> {
        Ok(self.load()?.unwrap_or_default())
    }

    /// Read-modify-write under the lock. `f` may fail, in which case nothing
    /// is written; if it leaves the document unchanged nothing is written either.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        self.ensure_parent()?;
        let _guard = self.acquire()?;

        let original = self.load_or_default()?;
        let mut document = original.clone();
        let result = f(&mut document)?;

        if document == original {
            return Ok(result);
        }

        // Only changes if another writer ignored (or could not see) our lock
        let found = self.load_or_default()?.revision();
        if found != original.revision() {
            return Err(Error::Conflict {
                path: self.path.clone(),
                expected: original.revision(),
                found,
            });
        }

        document.set_revision(original.revision() + 1);
        self.write_atomic(&document)?;
        debug!(
            "Wrote {} (revision {})",
            self.path.display(),
            document.revision()
        );
        Ok(result)
    }

    /// Move an unreadable document aside so it can be rebuilt; returns the new path
    pub fn quarantine(&self) -> Result<PathBuf> {
        let _guard = self.acquire()?;
        let target = self.sibling(".corrupt");
        fs::rename(&self.path, &target).map_err(|e| Error::io_failure(&self.path, e))?;
        warn!(
            "Moved unreadable registry {} to {}",
            self.path.display(),
            target.display()
        );
        Ok(target)
    }

    fn ensure_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(dir) => fs::create_dir_all(dir).map_err(|e| Error::io_failure(dir, e)),
            None => Ok(()),
        }
    }

    fn acquire(&self) -> Result<Option<Flock<File>>> {
        if !self.lock {
            return Ok(None);
        }

        let lock_path = self.sibling(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(DOCUMENT_MODE)
            .open(&lock_path)
            .map_err(|e| Error::io_failure(&lock_path, e))?;

        Flock::lock(file, FlockArg::LockExclusive)
            .map(Some)
            .map_err(|(_file, e)| Error::Lock {
                path: lock_path,
                reason: e.to_string(),
            })
    }

    fn write_atomic(&self, document: &T) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Internal(format!("{} has no parent", self.path.display())))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io_failure(dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, document)?;
        tmp.write_all(b"\n")
            .and_then(|_| {
                tmp.as_file()
                    .set_permissions(fs::Permissions::from_mode(DOCUMENT_MODE))
            })
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::io_failure(tmp.path(), e))?;

        tmp.persist(&self.path)
            .map_err(|e| Error::io_failure(&self.path, e.error))?;

        // Make the rename itself durable
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| Error::io_failure(dir, e))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }
}
