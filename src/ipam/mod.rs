//! IPAM delegation.
//!
//! Address management is left to a separate CNI plugin named by the `ipam`
//! section of the network configuration. It receives the unmodified network
//! configuration on stdin and an explicit environment; the plugin's own
//! environment is never rewritten to talk to it.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use ipnetwork::IpNetwork;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, SriovError};
use crate::types::{CmdArgs, ErrorResult, IPConfig, Result as CniResult, Route, DNS};

/// Arguments handed to the IPAM delegate for one invocation
#[derive(Debug, Clone, Default)]
pub struct DelegateArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    /// Plugin search path, `:` separated
    pub path: String,
    /// `CNI_ARGS` as the delegate sees it
    pub cni_args: String,
}

impl DelegateArgs {
    /// Arguments for the delegate, replacing `CNI_ARGS` with `cni_args`
    pub fn from_cmd(args: &CmdArgs, cni_args: String) -> Self {
        Self {
            container_id: args.container_id.clone(),
            netns: args.netns.clone(),
            ifname: args.ifname.clone(),
            path: args.path.clone(),
            cni_args,
        }
    }
}

/// External IP address manager
pub trait IpamDelegate {
    /// Allocate addresses, returning the delegate's result
    fn exec_add(&self, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<CniResult>;

    /// Release whatever was allocated for this container
    fn exec_del(&self, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<()>;
}

impl<T: IpamDelegate + ?Sized> IpamDelegate for &T {
    fn exec_add(&self, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<CniResult> {
        (**self).exec_add(plugin, netconf, args)
    }

    fn exec_del(&self, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<()> {
        (**self).exec_del(plugin, netconf, args)
    }
}

/// Runs the delegate binary found on the CNI plugin path
#[derive(Debug, Clone, Default)]
pub struct ExecDelegate;

impl ExecDelegate {
    fn find_plugin(plugin: &str, path: &str) -> Result<PathBuf> {
        path.split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(dir).join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| SriovError::Delegate {
                plugin: plugin.to_string(),
                msg: format!("failed to find plugin in path {path:?}"),
            })
    }

    fn exec(&self, command: &str, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<Vec<u8>> {
        let binary = Self::find_plugin(plugin, &args.path)?;
        debug!(plugin, command, binary = %binary.display(), cni_args = %args.cni_args, "invoking ipam delegate");

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.ifname)
            .env("CNI_PATH", &args.path)
            .env("CNI_ARGS", &args.cni_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SriovError::io(format!("failed to execute {}", binary.display()), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(netconf)
                .map_err(|e| SriovError::io(format!("failed to write netconf to {plugin}"), e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| SriovError::io(format!("failed to wait for {plugin}"), e))?;

        if !output.status.success() {
            let msg = match serde_json::from_slice::<ErrorResult>(&output.stdout) {
                Ok(err) if err.details.is_empty() => err.msg,
                Ok(err) => format!("{}; {}", err.msg, err.details),
                Err(_) => format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            };
            return Err(SriovError::Delegate {
                plugin: plugin.to_string(),
                msg,
            });
        }

        Ok(output.stdout)
    }
}

impl IpamDelegate for ExecDelegate {
    fn exec_add(&self, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<CniResult> {
        let stdout = self.exec("ADD", plugin, netconf, args)?;
        let result = parse_result(&stdout)?;
        info!(plugin, ips = ?result.ips, "ipam delegate allocated addresses");
        Ok(result)
    }

    fn exec_del(&self, plugin: &str, netconf: &[u8], args: &DelegateArgs) -> Result<()> {
        self.exec("DEL", plugin, netconf, args)?;
        info!(plugin, "ipam delegate released addresses");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LegacyIp {
    ip: IpNetwork,
    gateway: Option<IpAddr>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(rename = "cniVersion", default)]
    cni_version: Option<String>,
    ip4: Option<LegacyIp>,
    ip6: Option<LegacyIp>,
    ips: Option<Vec<IPConfig>>,
    routes: Option<Vec<Route>>,
    dns: Option<DNS>,
}

/// Normalise a delegate result, accepting both the `ip4`/`ip6` form and the
/// `ips` list form
pub fn parse_result(bytes: &[u8]) -> Result<CniResult> {
    let raw: RawResult = serde_json::from_slice(bytes).map_err(|source| SriovError::Decode {
        context: "failed to decode IPAM result".to_string(),
        source,
    })?;

    let mut result = CniResult::new(raw.cni_version.as_deref().unwrap_or("0.2.0"));
    for (version, legacy) in [("4", raw.ip4), ("6", raw.ip6)] {
        if let Some(legacy) = legacy {
            result.add_ip(IPConfig {
                version: Some(version.to_string()),
                interface: None,
                address: legacy.ip,
                gateway: legacy.gateway,
            });
            for route in legacy.routes {
                result.add_route(route);
            }
        }
    }
    for ip in raw.ips.into_iter().flatten() {
        result.add_ip(ip);
    }
    for route in raw.routes.into_iter().flatten() {
        result.add_route(route);
    }
    result.dns = raw.dns;

    Ok(result)
}
