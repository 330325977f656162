use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// CNI well-known error codes
pub mod code {
    pub const IO_FAILURE: u32 = 5;
    pub const DECODE_FAILURE: u32 = 6;
    pub const INVALID_NETWORK_CONFIG: u32 = 7;
    pub const GENERIC: u32 = 100;
    pub const NO_VFS_CONFIGURED: u32 = 101;
    pub const NO_FREE_VF: u32 = 102;
    pub const VF_UNAVAILABLE: u32 = 103;
    pub const HARDWARE_CONFIG: u32 = 104;
    pub const MIGRATION: u32 = 105;
    pub const INTERFACE_NOT_FOUND: u32 = 106;
    pub const DELEGATE: u32 = 107;
    pub const LINK_COMMAND: u32 = 108;
    pub const AFFINITY: u32 = 109;
}

/// Errors raised while attaching or releasing a virtual function
#[derive(Debug, Error)]
pub enum SriovError {
    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("failed to parse CNI_ARGS: {0}")]
    Args(String),

    #[error("no virtual functions configured on device {master:?}: {reason}")]
    NoVfsConfigured { master: String, reason: String },

    #[error("no free virtual function on device {master:?} ({total} configured)")]
    NoFreeVf { master: String, total: u32 },

    #[error("vf {vf} of device {master:?} is not available: {reason}")]
    VfUnavailable {
        master: String,
        vf: u32,
        reason: String,
    },

    #[error("invalid MAC address {mac:?} for vf {vf}: {reason}")]
    InvalidMac { vf: u32, mac: String, reason: String },

    #[error("failed to {action} vf {vf}: {source}")]
    Hardware {
        vf: u32,
        action: String,
        #[source]
        source: Box<SriovError>,
    },

    #[error("failed to {action} {subject}: {source}")]
    Migration {
        /// What was being moved, e.g. `vf 3` or `interface "net1"`
        subject: String,
        action: String,
        #[source]
        source: Box<SriovError>,
    },

    #[error("interface {ifname:?} not found in namespace {netns}")]
    InterfaceNotFound { ifname: String, netns: String },

    #[error("interface {ifname:?} is not up in namespace {netns}")]
    InterfaceDown { ifname: String, netns: String },

    #[error("`{command}` failed ({status}): {stderr}")]
    LinkCommand {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to enter network namespace {}: {reason}", path.display())]
    Namespace { path: PathBuf, reason: String },

    #[error("failed to lock device {master:?}: {reason}")]
    Lock { master: String, reason: String },

    #[error("invalid CPU core list {cores:?}: {reason}")]
    InvalidCores { cores: String, reason: String },

    #[error("{0}")]
    Affinity(String),

    #[error("IPAM plugin {plugin:?} failed: {msg}")]
    Delegate { plugin: String, msg: String },

    #[error("IPAM plugin returned missing IPv4 config")]
    MissingIpv4,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SriovError {
    /// The CNI error code reported to the runtime for this error
    pub fn code(&self) -> u32 {
        match self {
            SriovError::Config(_) | SriovError::Args(_) => code::INVALID_NETWORK_CONFIG,
            SriovError::NoVfsConfigured { .. } => code::NO_VFS_CONFIGURED,
            SriovError::NoFreeVf { .. } => code::NO_FREE_VF,
            SriovError::VfUnavailable { .. } => code::VF_UNAVAILABLE,
            SriovError::InvalidMac { .. } | SriovError::Hardware { .. } => code::HARDWARE_CONFIG,
            SriovError::Migration { .. } | SriovError::Namespace { .. } => code::MIGRATION,
            SriovError::InterfaceNotFound { .. } | SriovError::InterfaceDown { .. } => {
                code::INTERFACE_NOT_FOUND
            }
            SriovError::InvalidCores { .. } | SriovError::Affinity(_) => code::AFFINITY,
            SriovError::Delegate { .. } | SriovError::MissingIpv4 => code::DELEGATE,
            SriovError::LinkCommand { .. } => code::LINK_COMMAND,
            SriovError::Lock { .. } | SriovError::Io { .. } => code::IO_FAILURE,
            SriovError::Decode { .. } => code::DECODE_FAILURE,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        SriovError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn hardware(vf: u32, action: impl Into<String>, source: SriovError) -> Self {
        SriovError::Hardware {
            vf,
            action: action.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn migration(
        subject: impl Into<String>,
        action: impl Into<String>,
        source: SriovError,
    ) -> Self {
        SriovError::Migration {
            subject: subject.into(),
            action: action.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error of a hardware or migration chain
    pub fn root(&self) -> &SriovError {
        match self {
            SriovError::Hardware { source, .. } | SriovError::Migration { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SriovError>;
