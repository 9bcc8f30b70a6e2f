//! ClusterVol - Cluster-wide Named Volumes
//!
//! A container volume plugin for named, persistent directories living on a
//! clustered filesystem that every host in the cluster mounts read/write.
//! Each host runs its own plugin process; all of them see the same volumes
//! because the volume registry lives on the shared filesystem itself.
//!
//! # Architecture
//!
//! - [`resolver`] turns a filesystem label into its current mount point and
//!   an arbitrary path into (label, mount point, relative path)
//! - [`store`] keeps registry documents consistent across hosts with
//!   advisory locks, revision checks and atomic replace
//! - [`hosts`] records which hosts have activated the plugin
//! - [`registry`] is the global volume registry plus per-filesystem
//!   recovery copies and the reconcile pass
//! - [`driver`] is the operation set the container engine calls
//! - [`api`] serves that operation set over the volume plugin protocol

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod hosts;
pub mod layout;
pub mod registry;
pub mod resolver;
pub mod store;

pub use config::ClusterVolConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ClusterVolConfig;
    pub use crate::driver::{Capabilities, Scope, VolumeDriver, VolumeInfo};
    pub use crate::error::{Error, Result};
    pub use crate::registry::{DefaultLocation, ReconcileReport, Volume, VolumeRegistry};
    pub use crate::resolver::{LabelResolver, Location, SystemResolver};
}
