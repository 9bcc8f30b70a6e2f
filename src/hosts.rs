//! Host Registry
//!
//! Records every host that has started the plugin against the default
//! filesystem. Entries are merged in at startup and never removed, so hosts
//! that left the cluster stay listed as active.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::registry::DefaultLocation;
use crate::resolver::LabelResolver;
use crate::store::{Document, DocumentStore};

/// Host status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostStatus::Active => write!(f, "active"),
            HostStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Flat `hostname -> status` document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostDocument(pub BTreeMap<String, HostStatus>);

impl Document for HostDocument {}

/// Host registry on the default filesystem
pub struct HostRegistry {
    store: DocumentStore<HostDocument>,
}

impl HostRegistry {
    /// Locate the host registry through the default filesystem's live mount point
    pub fn open(
        resolver: &dyn LabelResolver,
        default: &DefaultLocation,
        layout: &Layout,
        lock: bool,
    ) -> Result<Self> {
        let mountpoint = resolver.resolve_mountpoint(&default.fs_label)?;
        Ok(Self {
            store: DocumentStore::new(layout.host_registry(&mountpoint), lock),
        })
    }

    /// Merge `hostname` into the registry as active
    pub fn register(&self, hostname: &str) -> Result<()> {
        self.store.update(|doc| {
            doc.0.insert(hostname.to_string(), HostStatus::Active);
            Ok(())
        })?;
        info!("Registered host {} as active", hostname);
        Ok(())
    }

    /// All hosts ever registered
    pub fn hosts(&self) -> Result<BTreeMap<String, HostStatus>> {
        Ok(self.store.load_or_default()?.0)
    }
}

/// Name this host registers under
pub fn local_hostname() -> Result<String> {
    hostname::get()
        .map_err(Error::Io)?
        .into_string()
        .map_err(|name| Error::Internal(format!("hostname {:?} is not valid UTF-8", name)))
}
