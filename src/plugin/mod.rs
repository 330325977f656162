use tracing::{info, warn};

use crate::config::{SriovConf, SriovConfig};
use crate::error::{Result, SriovError};
use crate::ipam::{DelegateArgs, IpamDelegate};
use crate::link::{configure_vf, LinkControl, Scope, VfSettings};
use crate::lock::MasterLock;
use crate::netns::{move_to_host, move_to_namespace, NetNs};
use crate::sysfs::VfTable;
use crate::types::{CmdArgs, ExtraInfo, Interface, IPConfig, Result as CniResult};

/// SR-IOV plugin implementation
pub struct SriovPlugin<L, D> {
    /// Network configuration merged with `CNI_ARGS`
    conf: SriovConf,
    /// Command arguments
    args: CmdArgs,
    /// Host paths
    settings: SriovConfig,
    links: L,
    ipam: D,
}

impl<L, D> SriovPlugin<L, D>
where
    L: LinkControl,
    D: IpamDelegate,
{
    /// Create a new SR-IOV plugin
    pub fn new(conf: SriovConf, args: CmdArgs, settings: SriovConfig, links: L, ipam: D) -> Self {
        Self {
            conf,
            args,
            settings,
            links,
            ipam,
        }
    }

    /// Attach a VF to the container and address it.
    ///
    /// Every step runs once; the first failure is returned as is and earlier
    /// steps are not undone.
    pub fn add_network(&self) -> Result<CniResult> {
        let netns = NetNs::open(&self.args.netns)?;
        let vf = self.attach_vf(&netns)?;

        let delegate_args = DelegateArgs::from_cmd(&self.args, self.conf.args.ipam_args());
        let ipam_result = self.ipam.exec_add(
            self.conf.net.ipam_type(),
            &self.args.stdin_data,
            &delegate_args,
        )?;
        if ipam_result.ipv4().next().is_none() {
            return Err(SriovError::MissingIpv4);
        }

        self.configure_addresses(&netns, &ipam_result)?;

        let mut result = CniResult::new(&self.conf.net.cni_version);
        let interface = result.add_interface(Interface {
            name: self.args.ifname.clone(),
            mac: self.conf.args.mac.clone(),
            sandbox: Some(self.args.netns.clone()),
        });
        for ip in ipam_result.ips.into_iter().flatten() {
            result.add_ip(IPConfig {
                interface: Some(interface),
                ..ip
            });
        }
        for route in ipam_result.routes.into_iter().flatten() {
            result.add_route(route);
        }
        result.dns = self.conf.net.dns.clone();
        result.extra = Some(ExtraInfo {
            vlan: self.conf.args.vlan.filter(|vlan| *vlan != 0),
            mac: self.conf.args.mac.clone(),
            vf: Some(vf),
        });

        info!(
            master = %self.conf.net.master,
            vf,
            ifname = %self.args.ifname,
            container_id = %self.args.container_id,
            "vf attached"
        );
        Ok(result)
    }

    /// Pick, configure and migrate the VF under the master lock
    fn attach_vf(&self, netns: &NetNs) -> Result<u32> {
        let master = self.conf.net.master.as_str();
        let _lock = MasterLock::acquire(&self.settings.lock_dir, master)?;

        let table = VfTable::new(&self.settings.sysfs_net_dir);
        let (vf, vf_ifname) = match self.conf.args.vf {
            Some(vf) => (vf, table.vf_interface(master, vf)?),
            None => table.find_free_vf(master)?,
        };
        info!(master, vf, ifname = %vf_ifname, "selected vf");

        let settings = VfSettings {
            mac: self.conf.args.mac.as_deref(),
            vlan: self.conf.args.vlan,
        };
        configure_vf(&self.links, master, vf, &vf_ifname, &settings)?;

        move_to_namespace(&self.links, &vf_ifname, netns, &self.args.ifname)
            .map_err(|e| SriovError::migration(format!("vf {vf}"), "move to netns", e))?;

        Ok(vf)
    }

    /// Apply delegate addresses and routes to the interface in the container
    fn configure_addresses(&self, netns: &NetNs, ipam_result: &CniResult) -> Result<()> {
        let scope = Scope::Netns(netns);
        let ifname = self.args.ifname.as_str();
        let ips = ipam_result.ips.as_deref().unwrap_or_default();

        self.links.set_link_up(scope, ifname)?;
        for ip in ips {
            self.links.add_address(scope, ifname, ip.address)?;
        }
        for route in ipam_result.routes.iter().flatten() {
            let gw = route.gw.or_else(|| {
                ips.iter()
                    .filter(|ip| ip.address.is_ipv4() == route.dst.is_ipv4())
                    .find_map(|ip| ip.gateway)
            });
            self.links.add_route(scope, ifname, route.dst, gw)?;
        }
        Ok(())
    }

    /// Return the VF to the host and release its addresses
    pub fn del_network(&self) -> Result<()> {
        let ifname = self.args.ifname.as_str();

        if self.args.netns.is_empty() {
            warn!(ifname, "no network namespace given, skipping vf release");
        } else {
            let netns = NetNs::open(&self.args.netns)?;
            let subject = match self.conf.args.vf {
                Some(vf) => format!("vf {vf}"),
                None => format!("interface {ifname:?}"),
            };
            let host_name = move_to_host(&self.links, &netns, ifname)
                .map_err(|e| SriovError::migration(subject, "release", e))?;
            info!(ifname, %host_name, container_id = %self.args.container_id, "vf released");
        }

        let delegate_args = DelegateArgs::from_cmd(&self.args, self.conf.args.ipam_args());
        self.ipam.exec_del(
            self.conf.net.ipam_type(),
            &self.args.stdin_data,
            &delegate_args,
        )
    }

    /// Verify the interface is present and up in the container
    pub fn check_network(&self) -> Result<()> {
        let netns = NetNs::open(&self.args.netns)?;
        let scope = Scope::Netns(&netns);
        let ifname = self.args.ifname.as_str();

        if self.links.link_index(scope, ifname)?.is_none() {
            return Err(SriovError::InterfaceNotFound {
                ifname: ifname.to_string(),
                netns: scope.describe(),
            });
        }
        if !self.links.link_is_up(scope, ifname)? {
            return Err(SriovError::InterfaceDown {
                ifname: ifname.to_string(),
                netns: scope.describe(),
            });
        }
        Ok(())
    }
}
