//! SR-IOV CNI plugin
//!
//! This implementation provides a pure Rust SR-IOV CNI plugin that:
//! - Finds a free virtual function on a physical device
//! - Sets the VF's MAC address and VLAN through its parent device
//! - Moves the VF into the container namespace under the requested name
//! - Delegates IP addressing to an IPAM plugin
//! - Returns the VF to the host namespace on container deletion

pub mod affinity;
pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod link;
pub mod lock;
pub mod netns;
pub mod plugin;
pub mod sysfs;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::{NetArgs, NetConf, SriovConf, SriovConfig};
pub use error::SriovError;
pub use plugin::SriovPlugin;
