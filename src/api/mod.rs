//! Volume Plugin API Module
//!
//! Serves the volume driver to the container engine.

mod plugin;

pub use plugin::{PluginResponse, PluginServer, VolumeRequest};
