// File: tests/lifecycle_test.rs
//
// Drives the attach/release sequence against a sysfs tree in a temp dir and
// in-memory link and IPAM fakes.

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use tempfile::TempDir;

use sriov_cni::config::{load_conf, SriovConfig};
use sriov_cni::error::{Result, SriovError};
use sriov_cni::ipam::{parse_result, DelegateArgs, IpamDelegate};
use sriov_cni::link::{LinkControl, Scope};
use sriov_cni::plugin::SriovPlugin;
use sriov_cni::types::{CmdArgs, Result as CniResult};

#[derive(Debug, Clone, Default)]
struct FakeLink {
    index: u32,
    up: bool,
    addresses: Vec<IpNetwork>,
    routes: Vec<(IpNetwork, Option<IpAddr>)>,
}

#[derive(Default)]
struct FakeState {
    // (namespace, ifname) -> link
    links: BTreeMap<(String, String), FakeLink>,
    calls: Vec<String>,
}

#[derive(Default)]
struct FakeLinks {
    state: Mutex<FakeState>,
}

fn ns_key(scope: Scope<'_>) -> String {
    match scope {
        Scope::Host => "host".to_string(),
        Scope::Netns(ns) => ns.path().display().to_string(),
    }
}

fn not_found(scope: Scope<'_>, ifname: &str) -> SriovError {
    SriovError::LinkCommand {
        command: format!("ip link show dev {ifname}"),
        status: "exit status: 1".to_string(),
        stderr: format!("Device \"{ifname}\" does not exist in {}", ns_key(scope)),
    }
}

impl FakeLinks {
    fn with_host_links(links: &[(&str, u32)]) -> Self {
        let fake = FakeLinks::default();
        {
            let mut state = fake.state.lock().unwrap();
            for (name, index) in links {
                state.links.insert(
                    ("host".to_string(), name.to_string()),
                    FakeLink {
                        index: *index,
                        ..Default::default()
                    },
                );
            }
        }
        fake
    }

    fn link(&self, ns: &str, ifname: &str) -> Option<FakeLink> {
        let state = self.state.lock().unwrap();
        state.links.get(&(ns.to_string(), ifname.to_string())).cloned()
    }

    fn names_in(&self, ns: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .links
            .keys()
            .filter(|(key_ns, _)| key_ns == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn update(&self, scope: Scope<'_>, ifname: &str, f: impl FnOnce(&mut FakeLink)) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(&(ns_key(scope), ifname.to_string()))
            .ok_or_else(|| not_found(scope, ifname))?;
        f(link);
        Ok(())
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl LinkControl for FakeLinks {
    fn link_index(&self, scope: Scope<'_>, ifname: &str) -> Result<Option<u32>> {
        Ok(self.link(&ns_key(scope), ifname).map(|link| link.index))
    }

    fn link_is_up(&self, scope: Scope<'_>, ifname: &str) -> Result<bool> {
        self.link(&ns_key(scope), ifname)
            .map(|link| link.up)
            .ok_or_else(|| not_found(scope, ifname))
    }

    fn set_vf_mac(&self, master: &str, vf: u32, mac: &MacAddress) -> Result<()> {
        self.link("host", master).ok_or_else(|| not_found(Scope::Host, master))?;
        self.record(format!("vf-mac {master} {vf} {mac}"));
        Ok(())
    }

    fn set_vf_vlan(&self, master: &str, vf: u32, vlan: u16) -> Result<()> {
        self.link("host", master).ok_or_else(|| not_found(Scope::Host, master))?;
        self.record(format!("vf-vlan {master} {vf} {vlan}"));
        Ok(())
    }

    fn set_link_up(&self, scope: Scope<'_>, ifname: &str) -> Result<()> {
        self.update(scope, ifname, |link| link.up = true)?;
        self.record(format!("up {} {ifname}", ns_key(scope)));
        Ok(())
    }

    fn set_link_down(&self, scope: Scope<'_>, ifname: &str) -> Result<()> {
        self.update(scope, ifname, |link| link.up = false)?;
        self.record(format!("down {} {ifname}", ns_key(scope)));
        Ok(())
    }

    fn rename_link(&self, scope: Scope<'_>, ifname: &str, new_name: &str) -> Result<()> {
        let ns = ns_key(scope);
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(&(ns.clone(), new_name.to_string())) {
            return Err(SriovError::LinkCommand {
                command: format!("ip link set dev {ifname} name {new_name}"),
                status: "exit status: 2".to_string(),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        let link = state
            .links
            .remove(&(ns.clone(), ifname.to_string()))
            .ok_or_else(|| not_found(scope, ifname))?;
        state.links.insert((ns.clone(), new_name.to_string()), link);
        state.calls.push(format!("rename {ns} {ifname} {new_name}"));
        Ok(())
    }

    fn move_link(&self, scope: Scope<'_>, ifname: &str, dest: Scope<'_>) -> Result<()> {
        let (from, to) = (ns_key(scope), ns_key(dest));
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(&(to.clone(), ifname.to_string())) {
            return Err(SriovError::LinkCommand {
                command: format!("ip link set dev {ifname} netns {to}"),
                status: "exit status: 2".to_string(),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        let mut link = state
            .links
            .remove(&(from.clone(), ifname.to_string()))
            .ok_or_else(|| not_found(scope, ifname))?;
        // the kernel closes a device on namespace change
        link.up = false;
        state.links.insert((to.clone(), ifname.to_string()), link);
        state.calls.push(format!("move {ifname} {from} -> {to}"));
        Ok(())
    }

    fn add_address(&self, scope: Scope<'_>, ifname: &str, address: IpNetwork) -> Result<()> {
        self.update(scope, ifname, |link| link.addresses.push(address))?;
        self.record(format!("addr {} {ifname} {address}", ns_key(scope)));
        Ok(())
    }

    fn add_route(
        &self,
        scope: Scope<'_>,
        ifname: &str,
        dst: IpNetwork,
        gw: Option<IpAddr>,
    ) -> Result<()> {
        self.update(scope, ifname, |link| link.routes.push((dst, gw)))
    }
}

struct FakeIpam {
    response: &'static str,
    calls: Mutex<Vec<(String, String, String)>>,
}

impl FakeIpam {
    fn returning(response: &'static str) -> Self {
        Self {
            response,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl IpamDelegate for FakeIpam {
    fn exec_add(&self, plugin: &str, _netconf: &[u8], args: &DelegateArgs) -> Result<CniResult> {
        self.calls.lock().unwrap().push((
            "ADD".to_string(),
            plugin.to_string(),
            args.cni_args.clone(),
        ));
        parse_result(self.response.as_bytes())
    }

    fn exec_del(&self, plugin: &str, _netconf: &[u8], args: &DelegateArgs) -> Result<()> {
        self.calls.lock().unwrap().push((
            "DEL".to_string(),
            plugin.to_string(),
            args.cni_args.clone(),
        ));
        Ok(())
    }
}

const NETCONF: &str = r#"{
    "cniVersion": "0.3.1",
    "name": "sriov-net",
    "type": "sriov",
    "master": "eth0",
    "ipam": {"type": "host-local", "subnet": "10.0.0.0/24"},
    "dns": {"nameservers": ["10.0.0.2"], "search": ["cluster.local"]}
}"#;

const IPAM_V4: &str = r#"{
    "cniVersion": "0.3.1",
    "ips": [{"version": "4", "address": "10.0.0.5/24", "gateway": "10.0.0.1"}],
    "routes": [{"dst": "0.0.0.0/0"}],
    "dns": {"nameservers": ["8.8.8.8"]}
}"#;

const IPAM_V6_ONLY: &str = r#"{
    "cniVersion": "0.3.1",
    "ips": [{"version": "6", "address": "fd00::5/64"}]
}"#;

/// A host with a sysfs tree, a lock dir and a container namespace
struct Host {
    dir: TempDir,
    netns: PathBuf,
}

impl Host {
    /// `free` lists the VF indices whose interfaces are still on the host
    fn new(total: u32, free: &[u32]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("sys/eth0/device");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("sriov_numvfs"), format!("{total}\n")).unwrap();
        for index in free {
            let net = device.join(format!("virtfn{index}/net/eth0v{index}"));
            fs::create_dir_all(net).unwrap();
        }

        let netns = dir.path().join("ns1");
        fs::write(&netns, "").unwrap();
        Self { dir, netns }
    }

    fn settings(&self) -> SriovConfig {
        SriovConfig {
            sysfs_net_dir: self.dir.path().join("sys"),
            proc_dir: self.dir.path().join("proc"),
            lock_dir: self.dir.path().join("run"),
            cni_conf_dir: self.dir.path().join("net.d"),
        }
    }

    fn ns(&self) -> String {
        self.netns.display().to_string()
    }

    fn cmd_args(&self, cni_args: &str) -> CmdArgs {
        CmdArgs {
            container_id: "c0ffee".to_string(),
            netns: self.ns(),
            ifname: "eth0".to_string(),
            args: cni_args.to_string(),
            path: "/opt/cni/bin".to_string(),
            stdin_data: NETCONF.as_bytes().to_vec(),
        }
    }

    fn plugin<'a>(
        &self,
        cni_args: &str,
        links: &'a FakeLinks,
        ipam: &'a FakeIpam,
    ) -> SriovPlugin<&'a FakeLinks, &'a FakeIpam> {
        let args = self.cmd_args(cni_args);
        let conf = load_conf(&args.stdin_data, &args.args).unwrap();
        SriovPlugin::new(conf, args, self.settings(), links, ipam)
    }
}

fn host_links() -> FakeLinks {
    FakeLinks::with_host_links(&[("eth0", 2), ("eth0v2", 12), ("eth0v3", 13), ("eth0v4", 14)])
}

fn lock_path(root: &Path) -> PathBuf {
    root.join("run").join("eth0.lock")
}

#[test]
fn test_add_discovers_configures_and_addresses_vf() {
    let host = Host::new(4, &[2, 3]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let result = host.plugin("", &links, &ipam).add_network().unwrap();

    // discovery picked the lowest free VF and no identity was requested
    assert_eq!(result.extra.as_ref().unwrap().vf, Some(2));
    assert!(!links.calls().iter().any(|call| call.starts_with("vf-")));

    // the VF now lives in the container under the runtime's name
    let vf = links.link(&host.ns(), "eth0").unwrap();
    assert_eq!(vf.index, 12);
    assert!(vf.up);
    assert_eq!(vf.addresses, vec!["10.0.0.5/24".parse::<IpNetwork>().unwrap()]);
    assert_eq!(
        vf.routes,
        vec![(
            "0.0.0.0/0".parse::<IpNetwork>().unwrap(),
            Some("10.0.0.1".parse().unwrap())
        )]
    );
    assert!(links.link("host", "eth0v2").is_none());
    assert!(links.link("host", "eth0").is_some());

    // result: address from the delegate, DNS from the network config
    let ips = result.ips.as_ref().unwrap();
    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0].address.to_string(), "10.0.0.5/24");
    assert_eq!(ips[0].interface, Some(0));
    let interfaces = result.interfaces.as_ref().unwrap();
    assert_eq!(interfaces[0].name, "eth0");
    assert_eq!(interfaces[0].sandbox.as_deref(), Some(host.ns().as_str()));
    let dns = result.dns.as_ref().unwrap();
    assert_eq!(dns.nameservers, Some(vec!["10.0.0.2".to_string()]));
    assert_eq!(result.cni_version, "0.3.1");

    assert_eq!(
        ipam.calls(),
        vec![("ADD".to_string(), "host-local".to_string(), String::new())]
    );
    assert!(lock_path(host.dir.path()).exists());
}

#[test]
fn test_add_orders_identity_before_up_and_move() {
    let host = Host::new(4, &[2, 3]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    host.plugin("MAC=02:00:00:00:00:aa;VLAN=100", &links, &ipam)
        .add_network()
        .unwrap();

    let calls = links.calls();
    let position = |prefix: &str| {
        calls
            .iter()
            .position(|call| call.starts_with(prefix))
            .unwrap_or_else(|| panic!("no call starting with {prefix:?} in {calls:?}"))
    };
    assert!(calls
        .iter()
        .any(|call| call.eq_ignore_ascii_case("vf-mac eth0 2 02:00:00:00:00:aa")));
    assert!(calls.contains(&"vf-vlan eth0 2 100".to_string()));
    assert!(position("vf-mac") < position("up host eth0v2"));
    assert!(position("vf-vlan") < position("up host eth0v2"));
    assert!(position("up host eth0v2") < position("move eth0v2"));
    assert!(position("move eth0v2") < position("rename"));
}

#[test]
fn test_add_reports_vf_identity() {
    let host = Host::new(4, &[2, 3]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let result = host
        .plugin("MAC=02:00:00:00:00:aa;VLAN=100;IP=10.0.0.5", &links, &ipam)
        .add_network()
        .unwrap();

    let extra = result.extra.unwrap();
    assert_eq!(extra.vlan, Some(100));
    assert_eq!(extra.mac.as_deref(), Some("02:00:00:00:00:aa"));
    assert_eq!(extra.vf, Some(2));

    // only the address request reaches the delegate
    assert_eq!(ipam.calls()[0].2, "IP=10.0.0.5");
}

#[test]
fn test_requested_vf_skips_discovery() {
    let host = Host::new(5, &[2, 3, 4]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let result = host.plugin("VF=4", &links, &ipam).add_network().unwrap();

    assert_eq!(result.extra.unwrap().vf, Some(4));
    assert_eq!(links.link(&host.ns(), "eth0").unwrap().index, 14);
    // lower free VFs are left alone
    assert!(links.link("host", "eth0v2").is_some());
    assert!(links.link("host", "eth0v3").is_some());
}

#[test]
fn test_requested_vf_zero_is_honoured() {
    let host = Host::new(4, &[0, 2]);
    let links = FakeLinks::with_host_links(&[("eth0", 2), ("eth0v0", 10), ("eth0v2", 12)]);
    let ipam = FakeIpam::returning(IPAM_V4);

    let result = host.plugin("VF=0", &links, &ipam).add_network().unwrap();
    assert_eq!(result.extra.unwrap().vf, Some(0));
    assert_eq!(links.link(&host.ns(), "eth0").unwrap().index, 10);
}

#[test]
fn test_requested_vf_in_use() {
    let host = Host::new(4, &[3]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("VF=1", &links, &ipam).add_network().unwrap_err();
    assert!(matches!(err, SriovError::VfUnavailable { vf: 1, .. }), "{err}");
    assert!(ipam.calls().is_empty());
}

#[test]
fn test_add_without_free_vf() {
    let host = Host::new(2, &[]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("", &links, &ipam).add_network().unwrap_err();
    assert!(matches!(err, SriovError::NoFreeVf { .. }), "{err}");
    assert!(links.calls().is_empty());
    assert!(ipam.calls().is_empty());
}

#[test]
fn test_add_with_zero_vfs() {
    let host = Host::new(0, &[]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("", &links, &ipam).add_network().unwrap_err();
    assert!(matches!(err, SriovError::NoVfsConfigured { .. }), "{err}");
}

#[test]
fn test_add_fails_without_ipv4() {
    let host = Host::new(4, &[2]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V6_ONLY);

    let err = host.plugin("", &links, &ipam).add_network().unwrap_err();
    assert!(matches!(err, SriovError::MissingIpv4), "{err}");

    // the VF was migrated but nothing was applied to it
    let vf = links.link(&host.ns(), "eth0").unwrap();
    assert!(vf.addresses.is_empty());
    assert!(vf.routes.is_empty());
}

#[test]
fn test_bad_mac_stops_before_hardware_changes() {
    let host = Host::new(4, &[2]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("MAC=zz:00", &links, &ipam).add_network().unwrap_err();
    assert!(matches!(err, SriovError::InvalidMac { vf: 2, .. }), "{err}");
    assert!(links.calls().is_empty());
    assert!(links.link("host", "eth0v2").is_some());
}

#[test]
fn test_missing_master_link() {
    let host = Host::new(4, &[2]);
    let links = FakeLinks::with_host_links(&[("eth0v2", 12)]);
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("", &links, &ipam).add_network().unwrap_err();
    assert!(matches!(err, SriovError::Hardware { vf: 2, .. }), "{err}");
    assert!(matches!(err.root(), SriovError::InterfaceNotFound { .. }));
}

#[test]
fn test_release_round_trip() {
    let host = Host::new(4, &[2, 3]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    host.plugin("", &links, &ipam).add_network().unwrap();
    host.plugin("", &links, &ipam).del_network().unwrap();

    // back on the host under the name derived from the kernel index
    let released = links.link("host", "dev12").unwrap();
    assert_eq!(released.index, 12);
    assert!(!released.up);
    assert!(links.names_in(&host.ns()).is_empty());
    assert!(links.link("host", "eth0").is_some());

    let calls = links.calls();
    let down = calls.iter().position(|c| c.ends_with(" eth0") && c.starts_with("down")).unwrap();
    let rename = calls.iter().position(|c| c.contains("eth0 dev12")).unwrap();
    let moved = calls.iter().position(|c| c.starts_with("move dev12")).unwrap();
    assert!(down < rename && rename < moved);

    assert_eq!(ipam.calls().last().unwrap().0, "DEL");
}

#[test]
fn test_released_names_never_collide() {
    let host = Host::new(4, &[2, 3]);
    let other = Host::new(4, &[]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    host.plugin("", &links, &ipam).add_network().unwrap();
    // the kernel drops the listing once the VF leaves the host
    fs::remove_dir_all(host.dir.path().join("sys/eth0/device/virtfn2/net/eth0v2")).unwrap();

    // a second container gets the next VF
    let args = CmdArgs {
        netns: other.ns(),
        ..host.cmd_args("")
    };
    let conf = load_conf(&args.stdin_data, &args.args).unwrap();
    let second = SriovPlugin::new(conf, args, host.settings(), &links, &ipam);
    assert_eq!(second.add_network().unwrap().extra.unwrap().vf, Some(3));

    host.plugin("", &links, &ipam).del_network().unwrap();
    second.del_network().unwrap();

    let names = links.names_in("host");
    assert!(names.contains(&"dev12".to_string()));
    assert!(names.contains(&"dev13".to_string()));
}

#[test]
fn test_del_of_missing_interface() {
    let host = Host::new(4, &[2]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("", &links, &ipam).del_network().unwrap_err();
    assert!(matches!(err, SriovError::Migration { .. }), "{err}");
    assert!(matches!(err.root(), SriovError::InterfaceNotFound { .. }));
    assert!(err.to_string().contains("not found"));
    assert!(
        err.to_string().starts_with("failed to release interface \"eth0\""),
        "{err}"
    );
    // no partial release
    assert!(ipam.calls().is_empty());

    let err = host.plugin("VF=2", &links, &ipam).del_network().unwrap_err();
    assert!(err.to_string().starts_with("failed to release vf 2"), "{err}");
}

#[test]
fn test_del_without_namespace_still_releases_addresses() {
    let host = Host::new(4, &[2]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let args = CmdArgs {
        netns: String::new(),
        ..host.cmd_args("VF=2;IP=10.0.0.5")
    };
    let conf = load_conf(&args.stdin_data, &args.args).unwrap();
    SriovPlugin::new(conf, args, host.settings(), &links, &ipam)
        .del_network()
        .unwrap();

    assert!(links.calls().is_empty());
    assert_eq!(
        ipam.calls(),
        vec![(
            "DEL".to_string(),
            "host-local".to_string(),
            "IP=10.0.0.5".to_string()
        )]
    );
}

#[test]
fn test_check() {
    let host = Host::new(4, &[2]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let err = host.plugin("", &links, &ipam).check_network().unwrap_err();
    assert!(matches!(err, SriovError::InterfaceNotFound { .. }), "{err}");

    host.plugin("", &links, &ipam).add_network().unwrap();
    host.plugin("", &links, &ipam).check_network().unwrap();

    links
        .set_link_down(Scope::Netns(&sriov_cni::netns::NetNs::open(&host.netns).unwrap()), "eth0")
        .unwrap();
    let err = host.plugin("", &links, &ipam).check_network().unwrap_err();
    assert!(matches!(err, SriovError::InterfaceDown { .. }), "{err}");
}

#[test]
fn test_add_for_legacy_runtime_reports_ip4() {
    let host = Host::new(4, &[2]);
    let links = host_links();
    let ipam = FakeIpam::returning(IPAM_V4);

    let args = CmdArgs {
        stdin_data: NETCONF.replace("\"0.3.1\"", "\"0.2.0\"").into_bytes(),
        ..host.cmd_args("VLAN=100")
    };
    let conf = load_conf(&args.stdin_data, &args.args).unwrap();
    let result = SriovPlugin::new(conf, args, host.settings(), &links, &ipam)
        .add_network()
        .unwrap();

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["cniVersion"], "0.2.0");
    assert_eq!(value["ip4"]["ip"], "10.0.0.5/24", "{value}");
    assert_eq!(value["ip4"]["gateway"], "10.0.0.1");
    assert_eq!(value["ip4"]["routes"][0]["dst"], "0.0.0.0/0");
    assert_eq!(value["dns"]["nameservers"][0], "10.0.0.2");
    assert_eq!(value["extra"]["vf"], 2);
    assert_eq!(value["extra"]["vlan"], 100);
    assert!(value.get("ips").is_none());
    assert!(value.get("interfaces").is_none());
}
