mod file;

pub use file::StaticRouteSpec;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::{self, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv4Network};

use crate::bgp::{AsPath, Community, CommunityList, Family, Origin};
use crate::policy::Policy;
use crate::rib::RouteAttributes;

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    ServerConfig::from_spec(spec)
}

/// Parse config from a TOML string (used by tests and embedding)
pub fn from_str(contents: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_str(contents)?;
    ServerConfig::from_spec(spec)
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    pub poll_interval: u16,
    /// Set when this speaker acts as a route reflector
    pub cluster_id: Option<Ipv4Addr>,
    pub peers: Vec<Arc<PeerConfig>>,
    pub ospf: OspfConfig,
    pub static_routes: Vec<StaticRoute>,
    pub flap_damping: Option<FlapDampingConfig>,
    pub rpki: Option<RpkiConfig>,
    pub graceful_restart: GracefulRestartConfig,
}

/// In-memory representation of a peer config, with missing spec items
/// defaulted to server values
#[derive(Debug)]
pub struct PeerConfig {
    pub remote_ip: IpNetwork,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: Ipv4Addr,
    pub enabled: bool,
    pub passive: bool,
    /// Route-reflector client
    pub client: bool,
    pub hold_timer: u16,
    pub dest_port: u16,
    pub families: Vec<Family>,
    pub import_policy: Arc<Policy>,
    pub export_policy: Arc<Policy>,
}

impl PeerConfig {
    /// Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterfaceKind {
    PointToPoint,
    Broadcast,
}

#[derive(Clone, Debug)]
pub struct OspfInterfaceConfig {
    pub name: String,
    pub address: Ipv4Network,
    pub hello_interval: u16,
    pub dead_interval: u32,
    pub priority: u8,
    pub cost: u16,
    pub passive: bool,
    pub kind: InterfaceKind,
}

#[derive(Clone, Debug)]
pub struct OspfConfig {
    pub area: Ipv4Addr,
    pub interfaces: Vec<Arc<OspfInterfaceConfig>>,
}

impl Default for OspfConfig {
    fn default() -> Self {
        Self {
            area: Ipv4Addr::UNSPECIFIED,
            interfaces: Vec::new(),
        }
    }
}

/// A locally originated route, parsed and ready for Loc-RIB insertion
#[derive(Clone, Debug)]
pub struct StaticRoute {
    pub prefix: IpNetwork,
    pub attributes: RouteAttributes,
}

#[derive(Clone, Copy, Debug)]
pub struct FlapDampingConfig {
    pub suppress_threshold: u32,
    pub reuse_threshold: u32,
    pub half_life: u64,
}

#[derive(Clone, Debug)]
pub struct RpkiConfig {
    pub roa_source: String,
    pub reject_invalid: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct GracefulRestartConfig {
    /// Fallback stale window when a peer's capability omits one
    pub restart_time: u16,
}

impl Default for GracefulRestartConfig {
    fn default() -> Self {
        Self { restart_time: 120 }
    }
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> Result<Self> {
        let invalid = |reason: String| io::Error::new(io::ErrorKind::InvalidInput, reason);

        let mut policies: HashMap<String, Arc<Policy>> = HashMap::new();
        for policy_spec in &spec.policies {
            let policy = Arc::new(policy_spec.build()?);
            policies.insert(policy.name.clone(), policy);
        }
        let lookup = |name: &Option<String>| -> Result<Arc<Policy>> {
            match name {
                None => Ok(Policy::permit_all()),
                Some(name) => policies
                    .get(name)
                    .cloned()
                    .ok_or_else(|| invalid(format!("Unknown policy: '{}'", name))),
            }
        };

        let mut peers = Vec::with_capacity(spec.peers.len());
        for peer in &spec.peers {
            let remote_ip: IpNetwork = peer
                .remote_ip
                .parse()
                .map_err(|err| invalid(format!("Invalid remote_ip '{}': {}", peer.remote_ip, err)))?;
            let local_as = peer.local_as.unwrap_or(spec.default_as);
            if peer.client && peer.remote_as != local_as {
                return Err(invalid(format!(
                    "Peer {} is marked client but is eBGP",
                    peer.remote_ip
                )));
            }
            peers.push(Arc::new(PeerConfig {
                remote_ip,
                remote_as: peer.remote_as,
                local_as,
                local_router_id: peer.local_router_id.unwrap_or(spec.router_id),
                enabled: peer.enabled,
                passive: peer.passive,
                client: peer.client,
                hold_timer: peer.hold_timer,
                dest_port: peer.dest_port,
                families: peer.families.clone(),
                import_policy: lookup(&peer.import_policy)?,
                export_policy: lookup(&peer.export_policy)?,
            }));
        }

        let mut interfaces = Vec::with_capacity(spec.ospf.interfaces.len());
        for interface in &spec.ospf.interfaces {
            let address: Ipv4Network = interface
                .address
                .parse()
                .map_err(|err| {
                    invalid(format!("Invalid address '{}': {}", interface.address, err))
                })?;
            let kind = match interface.kind.to_lowercase().as_str() {
                "broadcast" => InterfaceKind::Broadcast,
                "point-to-point" | "p2p" => InterfaceKind::PointToPoint,
                other => return Err(invalid(format!("Unsupported interface kind: '{}'", other))),
            };
            interfaces.push(Arc::new(OspfInterfaceConfig {
                name: interface.name.clone(),
                address,
                hello_interval: interface.hello_interval,
                dead_interval: interface.dead_interval,
                priority: interface.priority,
                cost: interface.cost,
                passive: interface.passive,
                kind,
            }));
        }

        let mut static_routes = Vec::with_capacity(spec.static_routes.len());
        for route in &spec.static_routes {
            static_routes.push(StaticRoute::from_spec(route)?);
        }

        Ok(Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            poll_interval: spec.poll_interval,
            cluster_id: spec.cluster_id,
            peers,
            ospf: OspfConfig {
                area: spec.ospf.area,
                interfaces,
            },
            static_routes,
            flap_damping: spec.flap_damping.map(|fd| FlapDampingConfig {
                suppress_threshold: fd.suppress_threshold,
                reuse_threshold: fd.reuse_threshold,
                half_life: fd.half_life,
            }),
            rpki: spec.rpki.map(|rpki| RpkiConfig {
                roa_source: rpki.roa_source,
                reject_invalid: rpki.reject_invalid,
            }),
            graceful_restart: spec
                .graceful_restart
                .map(|gr| GracefulRestartConfig {
                    restart_time: gr.restart_time,
                })
                .unwrap_or_default(),
        })
    }
}

impl StaticRoute {
    fn from_spec(spec: &StaticRouteSpec) -> Result<Self> {
        let invalid = |reason: String| io::Error::new(io::ErrorKind::InvalidInput, reason);
        let prefix: IpNetwork = spec
            .prefix
            .parse()
            .map_err(|err| invalid(format!("Invalid prefix '{}': {}", spec.prefix, err)))?;
        let origin = spec
            .origin
            .as_ref()
            .map(|origin| match origin.to_lowercase().as_str() {
                "igp" => Origin::Igp,
                "egp" => Origin::Egp,
                _ => Origin::Incomplete,
            })
            .unwrap_or(Origin::Incomplete);
        let as_path = {
            let mut asns: Vec<u32> = Vec::with_capacity(spec.as_path.len());
            for asn in &spec.as_path {
                asns.push(crate::utils::asn_from_dotted(asn).map_err(|err| {
                    invalid(format!("Error parsing ASN: {}", err.reason))
                })?);
            }
            AsPath::from_sequence(asns)
        };
        let mut communities = CommunityList::default();
        for community in &spec.communities {
            communities.push(Community::try_from(community.as_str())?);
        }
        Ok(Self {
            prefix,
            attributes: RouteAttributes {
                origin,
                as_path,
                next_hop: spec.next_hop,
                local_pref: spec.local_pref,
                med: spec.med,
                atomic_aggregate: false,
                aggregator: None,
                communities,
                originator_id: None,
                cluster_list: vec![],
            },
        })
    }
}
