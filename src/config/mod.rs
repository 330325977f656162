use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SriovError};
use crate::types::DNS;

/// Highest VLAN id a VF can be tagged with
pub const MAX_VLAN_ID: u16 = 4094;

/// Longest interface name the kernel accepts (`IFNAMSIZ` minus the NUL)
pub const MAX_IFNAME_LEN: usize = 15;

/// Check that `name` can be a kernel interface name.
///
/// Master names end up in sysfs and lock file paths and must stay a single
/// path component.
pub fn validate_ifname(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "is empty"
    } else if name.len() > MAX_IFNAME_LEN {
        "is longer than 15 bytes"
    } else if name == "." || name == ".." {
        "is a relative path component"
    } else if name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace()) {
        "contains '/', ':' or whitespace"
    } else {
        return Ok(());
    };
    Err(SriovError::Config(format!(
        "{name:?} is not a valid interface name: it {reason}"
    )))
}

/// Plugin settings that are not part of the network configuration
#[derive(Debug, Clone)]
pub struct SriovConfig {
    /// Root of the kernel's network device class directory
    pub sysfs_net_dir: PathBuf,
    /// Root of procfs, used for IRQ affinity
    pub proc_dir: PathBuf,
    /// Directory holding the per-master lock files
    pub lock_dir: PathBuf,
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
}

impl Default for SriovConfig {
    fn default() -> Self {
        Self {
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
            proc_dir: PathBuf::from("/proc"),
            lock_dir: PathBuf::from("/run/sriov-cni"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
        }
    }
}

impl SriovConfig {
    /// Defaults, overridden by `SRIOV_CNI_SYSFS_ROOT` and `SRIOV_CNI_LOCK_DIR`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = env::var("SRIOV_CNI_SYSFS_ROOT") {
            if !root.is_empty() {
                config.sysfs_net_dir = PathBuf::from(root);
            }
        }
        if let Ok(dir) = env::var("SRIOV_CNI_LOCK_DIR") {
            if !dir.is_empty() {
                config.lock_dir = PathBuf::from(dir);
            }
        }
        config
    }
}

/// Network configuration handed to the plugin on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default = "default_cni_version")]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Physical device owning the virtual functions
    #[serde(default)]
    pub master: String,
    /// IPAM configuration, passed through to the delegate untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IPAMConfig>,
    /// DNS settings copied into the result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
}

fn default_cni_version() -> String {
    "0.3.1".to_string()
}

/// IPAM (IP Address Management) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPAMConfig {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Everything else belongs to the delegate
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes).map_err(|source| SriovError::Decode {
            context: "failed to load netconf".to_string(),
            source,
        })?;

        if conf.master.is_empty() {
            return Err(SriovError::Config(
                r#""master" field is required. It specifies the host interface name to virtualize"#
                    .to_string(),
            ));
        }
        validate_ifname(&conf.master)?;

        match &conf.ipam {
            Some(ipam) if !ipam.ipam_type.is_empty() => {}
            _ => {
                return Err(SriovError::Config(
                    r#""ipam" section with a "type" is required"#.to_string(),
                ))
            }
        }

        Ok(conf)
    }

    /// The IPAM plugin type, empty when the section is absent
    pub fn ipam_type(&self) -> &str {
        self.ipam.as_ref().map(|ipam| ipam.ipam_type.as_str()).unwrap_or_default()
    }

    /// Create a configuration for a master device backed by host-local IPAM
    pub fn new_default(name: &str, master: &str, subnet: Option<&str>, gateway: Option<&str>) -> Self {
        let mut settings = Map::new();
        if let Some(subnet) = subnet {
            settings.insert("subnet".to_string(), Value::String(subnet.to_string()));
        }
        if let Some(gateway) = gateway {
            settings.insert("gateway".to_string(), Value::String(gateway.to_string()));
        }

        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "sriov".to_string(),
            master: master.to_string(),
            ipam: Some(IPAMConfig {
                ipam_type: "host-local".to_string(),
                settings,
            }),
            dns: None,
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|source| SriovError::Decode {
            context: "failed to encode netconf".to_string(),
            source,
        })?;
        fs::write(path, json)
            .map_err(|e| SriovError::io(format!("failed to write {}", path.display()), e))
    }
}

/// Per-invocation arguments carried in `CNI_ARGS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetArgs {
    /// Explicitly requested VF index
    pub vf: Option<u32>,
    /// VLAN tag for the VF, 0 leaves it untagged
    pub vlan: Option<u16>,
    /// Hardware address for the VF
    pub mac: Option<String>,
    /// CPU cores for IRQ/RPS affinity; parsed and accepted, not used by
    /// attach or release
    pub cores: Option<String>,
    /// Address requested from the IPAM delegate
    pub ip: Option<IpAddr>,
}

impl NetArgs {
    /// Parse a `KEY=VALUE;KEY=VALUE` string.
    ///
    /// Unknown keys are rejected unless `IgnoreUnknown` is set to a true
    /// value somewhere in the string.
    pub fn parse(args: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for pair in args.split(';').filter(|pair| !pair.is_empty()) {
            let mut kv = pair.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some(key), Some(value)) if !key.is_empty() && !value.contains('=') => {
                    pairs.push((key, value))
                }
                _ => return Err(SriovError::Args(format!("invalid pair {pair:?}"))),
            }
        }

        let ignore_unknown = pairs
            .iter()
            .find(|(key, _)| *key == "IgnoreUnknown")
            .map(|(_, value)| parse_bool(value))
            .transpose()?
            .unwrap_or(false);

        let mut net_args = NetArgs::default();
        for (key, value) in pairs {
            match key {
                "VF" => {
                    let vf = value
                        .parse::<u32>()
                        .map_err(|e| SriovError::Args(format!("VF={value}: {e}")))?;
                    net_args.vf = Some(vf);
                }
                "VLAN" => {
                    let vlan = value
                        .parse::<u16>()
                        .map_err(|e| SriovError::Args(format!("VLAN={value}: {e}")))?;
                    if vlan > MAX_VLAN_ID {
                        return Err(SriovError::Args(format!(
                            "VLAN={vlan} is out of range (0-{MAX_VLAN_ID})"
                        )));
                    }
                    net_args.vlan = Some(vlan);
                }
                "MAC" => net_args.mac = Some(value.to_string()).filter(|mac| !mac.is_empty()),
                "CORES" => net_args.cores = Some(value.to_string()).filter(|c| !c.is_empty()),
                "IP" => {
                    let ip = value
                        .parse::<IpAddr>()
                        .map_err(|e| SriovError::Args(format!("IP={value}: {e}")))?;
                    net_args.ip = Some(ip);
                }
                "IgnoreUnknown"
                | "K8S_POD_NAME"
                | "K8S_POD_NAMESPACE"
                | "K8S_POD_INFRA_CONTAINER_ID"
                | "K8S_POD_UID" => {}
                unknown if ignore_unknown => {
                    tracing::debug!(key = unknown, "ignoring unknown CNI argument");
                }
                unknown => {
                    return Err(SriovError::Args(format!("unknown argument {unknown:?}")));
                }
            }
        }

        Ok(net_args)
    }

    /// The argument string the IPAM delegate is allowed to see
    pub fn ipam_args(&self) -> String {
        self.ip.map(|ip| format!("IP={ip}")).unwrap_or_default()
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" => Ok(true),
        "0" | "false" | "f" => Ok(false),
        _ => Err(SriovError::Args(format!("IgnoreUnknown={value} is not a boolean"))),
    }
}

/// Network configuration merged with the invocation's arguments
#[derive(Debug, Clone)]
pub struct SriovConf {
    pub net: NetConf,
    pub args: NetArgs,
}

/// Load and validate the configuration for one invocation
pub fn load_conf(bytes: &[u8], args: &str) -> Result<SriovConf> {
    let net = NetConf::parse(bytes)?;
    let args = NetArgs::parse(args)?;
    Ok(SriovConf { net, args })
}
