use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize, Serializer};

/// CNI command arguments
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Raw `CNI_ARGS` string
    pub args: String,
    /// Plugin search path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Plugin result.
///
/// Serializes in the `interfaces`/`ips` form, or in the `ip4`/`ip6` form
/// when `cni_version` is older than 0.3.0.
#[derive(Debug, Clone, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// VF details for orchestration layers above the runtime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<ExtraInfo>,
}

#[derive(Serialize)]
struct CurrentResult<'a> {
    #[serde(rename = "cniVersion")]
    cni_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    interfaces: Option<&'a Vec<Interface>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ips: Option<&'a Vec<IPConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routes: Option<&'a Vec<Route>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<&'a DNS>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<&'a ExtraInfo>,
}

#[derive(Serialize)]
struct LegacyIp<'a> {
    ip: IpNetwork,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<&'a Route>,
}

#[derive(Serialize)]
struct LegacyResult<'a> {
    #[serde(rename = "cniVersion")]
    cni_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip4: Option<LegacyIp<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip6: Option<LegacyIp<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<&'a DNS>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<&'a ExtraInfo>,
}

/// Whether results for `version` use the `ip4`/`ip6` layout
pub fn is_legacy_version(version: &str) -> bool {
    let mut parts = version.split('.').map(str::parse::<u32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(0)), Some(Ok(minor))) => minor < 3,
        _ => false,
    }
}

impl Serialize for Result {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if !is_legacy_version(&self.cni_version) {
            return CurrentResult {
                cni_version: &self.cni_version,
                interfaces: self.interfaces.as_ref(),
                ips: self.ips.as_ref(),
                routes: self.routes.as_ref(),
                dns: self.dns.as_ref(),
                extra: self.extra.as_ref(),
            }
            .serialize(serializer);
        }

        // one address per family; routes follow the family of their destination
        let legacy_ip = |v4: bool| {
            self.ips
                .iter()
                .flatten()
                .find(|ip| ip.is_ipv4() == v4)
                .map(|ip| LegacyIp {
                    ip: ip.address,
                    gateway: ip.gateway,
                    routes: self
                        .routes
                        .iter()
                        .flatten()
                        .filter(|route| route.dst.is_ipv4() == v4)
                        .collect(),
                })
        };
        LegacyResult {
            cni_version: &self.cni_version,
            ip4: legacy_ip(true),
            ip6: legacy_ip(false),
            dns: self.dns.as_ref(),
            extra: self.extra.as_ref(),
        }
        .serialize(serializer)
    }
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPConfig {
    /// "4" or "6", only emitted by 0.3.x results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: IpNetwork,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

impl IPConfig {
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// Local domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: IpNetwork,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// Hardware identity of the attached VF
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vf: Option<u32>,
}

/// Error payload reported to the runtime on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            routes: None,
            dns: None,
            extra: None,
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// IPv4 addresses in the result
    pub fn ipv4(&self) -> impl Iterator<Item = &IPConfig> {
        self.ips.iter().flatten().filter(|ip| ip.is_ipv4())
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}
