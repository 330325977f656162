//! Link control: the operations this plugin needs from the host's `ip`
//! tooling, and VF hardware configuration on top of them.

use std::net::IpAddr;
use std::process::Command;

use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, SriovError};
use crate::netns::NetNs;

/// Namespace a link operation executes in
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// The namespace the plugin was started in
    Host,
    /// A container namespace
    Netns(&'a NetNs),
}

impl Scope<'_> {
    pub fn describe(&self) -> String {
        match self {
            Scope::Host => "host".to_string(),
            Scope::Netns(ns) => ns.path().display().to_string(),
        }
    }
}

/// Link attribute get/set as used for VF attach and release
pub trait LinkControl: Send + Sync {
    /// Kernel index of `ifname`, `None` when no such link exists in `scope`
    fn link_index(&self, scope: Scope<'_>, ifname: &str) -> Result<Option<u32>>;

    /// Whether `ifname` is administratively up
    fn link_is_up(&self, scope: Scope<'_>, ifname: &str) -> Result<bool>;

    /// Set the hardware address of VF `vf` through its parent `master`
    fn set_vf_mac(&self, master: &str, vf: u32, mac: &MacAddress) -> Result<()>;

    /// Set the VLAN tag of VF `vf` through its parent `master`
    fn set_vf_vlan(&self, master: &str, vf: u32, vlan: u16) -> Result<()>;

    fn set_link_up(&self, scope: Scope<'_>, ifname: &str) -> Result<()>;

    fn set_link_down(&self, scope: Scope<'_>, ifname: &str) -> Result<()>;

    fn rename_link(&self, scope: Scope<'_>, ifname: &str, new_name: &str) -> Result<()>;

    /// Move `ifname` from `scope` into `dest`
    fn move_link(&self, scope: Scope<'_>, ifname: &str, dest: Scope<'_>) -> Result<()>;

    fn add_address(&self, scope: Scope<'_>, ifname: &str, address: IpNetwork) -> Result<()>;

    fn add_route(
        &self,
        scope: Scope<'_>,
        ifname: &str,
        dst: IpNetwork,
        gw: Option<IpAddr>,
    ) -> Result<()>;
}

impl<T: LinkControl + ?Sized> LinkControl for &T {
    fn link_index(&self, scope: Scope<'_>, ifname: &str) -> Result<Option<u32>> {
        (**self).link_index(scope, ifname)
    }

    fn link_is_up(&self, scope: Scope<'_>, ifname: &str) -> Result<bool> {
        (**self).link_is_up(scope, ifname)
    }

    fn set_vf_mac(&self, master: &str, vf: u32, mac: &MacAddress) -> Result<()> {
        (**self).set_vf_mac(master, vf, mac)
    }

    fn set_vf_vlan(&self, master: &str, vf: u32, vlan: u16) -> Result<()> {
        (**self).set_vf_vlan(master, vf, vlan)
    }

    fn set_link_up(&self, scope: Scope<'_>, ifname: &str) -> Result<()> {
        (**self).set_link_up(scope, ifname)
    }

    fn set_link_down(&self, scope: Scope<'_>, ifname: &str) -> Result<()> {
        (**self).set_link_down(scope, ifname)
    }

    fn rename_link(&self, scope: Scope<'_>, ifname: &str, new_name: &str) -> Result<()> {
        (**self).rename_link(scope, ifname, new_name)
    }

    fn move_link(&self, scope: Scope<'_>, ifname: &str, dest: Scope<'_>) -> Result<()> {
        (**self).move_link(scope, ifname, dest)
    }

    fn add_address(&self, scope: Scope<'_>, ifname: &str, address: IpNetwork) -> Result<()> {
        (**self).add_address(scope, ifname, address)
    }

    fn add_route(
        &self,
        scope: Scope<'_>,
        ifname: &str,
        dst: IpNetwork,
        gw: Option<IpAddr>,
    ) -> Result<()> {
        (**self).add_route(scope, ifname, dst, gw)
    }
}

#[derive(Debug, Deserialize)]
struct LinkList {
    ifindex: u32,
    #[serde(default)]
    flags: Vec<String>,
}

/// [`LinkControl`] backed by the iproute2 `ip` command
#[derive(Debug)]
pub struct IpLink {
    host: NetNs,
}

impl IpLink {
    /// Capture the host namespace so links can be moved back into it later
    pub fn new() -> Result<Self> {
        Ok(Self {
            host: NetNs::host()?,
        })
    }

    fn ip(&self, scope: Scope<'_>, args: &[&str]) -> Result<Vec<u8>> {
        match scope {
            Scope::Host => run_ip(args),
            Scope::Netns(ns) => ns.run(|| run_ip(args)),
        }
    }

    fn ns_target(&self, dest: Scope<'_>) -> String {
        match dest {
            Scope::Host => self.host.fd_path().display().to_string(),
            Scope::Netns(ns) => ns.fd_path().display().to_string(),
        }
    }

    fn show(&self, scope: Scope<'_>, ifname: &str) -> Result<Option<LinkList>> {
        let stdout = match self.ip(scope, &["-json", "link", "show", "dev", ifname]) {
            Ok(stdout) => stdout,
            Err(SriovError::LinkCommand { stderr, .. }) if stderr.contains("does not exist") => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let mut links: Vec<LinkList> =
            serde_json::from_slice(&stdout).map_err(|source| SriovError::Decode {
                context: format!("invalid `ip -json link show dev {ifname}` output"),
                source,
            })?;
        if links.len() != 1 {
            return Err(SriovError::LinkCommand {
                command: format!("ip -json link show dev {ifname}"),
                status: "ok".to_string(),
                stderr: format!("expected a single entry, got {}", links.len()),
            });
        }
        Ok(links.pop())
    }
}

fn run_ip(args: &[&str]) -> Result<Vec<u8>> {
    let command = format!("ip {}", args.join(" "));
    debug!(%command, "running");

    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| SriovError::io(format!("failed to execute `{command}`"), e))?;

    if !output.status.success() {
        return Err(SriovError::LinkCommand {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

impl LinkControl for IpLink {
    fn link_index(&self, scope: Scope<'_>, ifname: &str) -> Result<Option<u32>> {
        Ok(self.show(scope, ifname)?.map(|link| link.ifindex))
    }

    fn link_is_up(&self, scope: Scope<'_>, ifname: &str) -> Result<bool> {
        let link = self
            .show(scope, ifname)?
            .ok_or_else(|| SriovError::InterfaceNotFound {
                ifname: ifname.to_string(),
                netns: scope.describe(),
            })?;
        Ok(link.flags.iter().any(|flag| flag == "UP"))
    }

    fn set_vf_mac(&self, master: &str, vf: u32, mac: &MacAddress) -> Result<()> {
        let vf = vf.to_string();
        let mac = mac.to_string();
        self.ip(Scope::Host, &["link", "set", "dev", master, "vf", &vf, "mac", &mac])
            .map(drop)
    }

    fn set_vf_vlan(&self, master: &str, vf: u32, vlan: u16) -> Result<()> {
        let vf = vf.to_string();
        let vlan = vlan.to_string();
        self.ip(Scope::Host, &["link", "set", "dev", master, "vf", &vf, "vlan", &vlan])
            .map(drop)
    }

    fn set_link_up(&self, scope: Scope<'_>, ifname: &str) -> Result<()> {
        self.ip(scope, &["link", "set", "dev", ifname, "up"]).map(drop)
    }

    fn set_link_down(&self, scope: Scope<'_>, ifname: &str) -> Result<()> {
        self.ip(scope, &["link", "set", "dev", ifname, "down"]).map(drop)
    }

    fn rename_link(&self, scope: Scope<'_>, ifname: &str, new_name: &str) -> Result<()> {
        self.ip(scope, &["link", "set", "dev", ifname, "name", new_name])
            .map(drop)
    }

    fn move_link(&self, scope: Scope<'_>, ifname: &str, dest: Scope<'_>) -> Result<()> {
        let target = self.ns_target(dest);
        self.ip(scope, &["link", "set", "dev", ifname, "netns", &target])
            .map(drop)
    }

    fn add_address(&self, scope: Scope<'_>, ifname: &str, address: IpNetwork) -> Result<()> {
        let address = address.to_string();
        self.ip(scope, &["addr", "add", &address, "dev", ifname])
            .map(drop)
    }

    fn add_route(
        &self,
        scope: Scope<'_>,
        ifname: &str,
        dst: IpNetwork,
        gw: Option<IpAddr>,
    ) -> Result<()> {
        let dst = dst.to_string();
        let output = match gw.map(|gw| gw.to_string()) {
            Some(gw) => self.ip(scope, &["route", "add", &dst, "via", &gw, "dev", ifname]),
            None => self.ip(scope, &["route", "add", &dst, "dev", ifname]),
        };
        output.map(drop)
    }
}

/// Hardware identity requested for a VF
#[derive(Debug, Clone, Default)]
pub struct VfSettings<'a> {
    pub mac: Option<&'a str>,
    pub vlan: Option<u16>,
}

/// Apply MAC and VLAN to VF `vf` of `master`, then bring its interface up.
///
/// MAC and VLAN are VF properties of the parent device, so they are set
/// through `master` rather than through `vf_ifname`. Both are applied
/// before the interface goes up and before it leaves the host namespace:
/// some drivers reset VF state across a namespace move.
pub fn configure_vf<L>(
    links: &L,
    master: &str,
    vf: u32,
    vf_ifname: &str,
    settings: &VfSettings<'_>,
) -> Result<()>
where
    L: LinkControl + ?Sized,
{
    if links.link_index(Scope::Host, master)?.is_none() {
        return Err(SriovError::hardware(
            vf,
            format!("lookup master {master:?} for"),
            SriovError::InterfaceNotFound {
                ifname: master.to_string(),
                netns: Scope::Host.describe(),
            },
        ));
    }
    if links.link_index(Scope::Host, vf_ifname)?.is_none() {
        return Err(SriovError::hardware(
            vf,
            format!("lookup device {vf_ifname:?} of"),
            SriovError::InterfaceNotFound {
                ifname: vf_ifname.to_string(),
                netns: Scope::Host.describe(),
            },
        ));
    }

    if let Some(mac) = settings.mac {
        let parsed: MacAddress = mac.parse().map_err(|e| SriovError::InvalidMac {
            vf,
            mac: mac.to_string(),
            reason: format!("{e}"),
        })?;
        links
            .set_vf_mac(master, vf, &parsed)
            .map_err(|e| SriovError::hardware(vf, "set mac address of", e))?;
    }

    if let Some(vlan) = settings.vlan.filter(|vlan| *vlan != 0) {
        links
            .set_vf_vlan(master, vf, vlan)
            .map_err(|e| SriovError::hardware(vf, "set vlan of", e))?;
    }

    links
        .set_link_up(Scope::Host, vf_ifname)
        .map_err(|e| SriovError::hardware(vf, "set up", e))?;

    info!(master, vf, ifname = vf_ifname, mac = ?settings.mac, vlan = ?settings.vlan, "configured vf");
    Ok(())
}
