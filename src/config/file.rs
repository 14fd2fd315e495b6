use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;

use crate::bgp::Family;
use crate::policy::PolicySpec;

pub(super) struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn passive() -> bool {
        false
    }

    fn client() -> bool {
        false
    }

    fn poll_interval() -> u16 {
        30
    }

    fn hold_timer() -> u16 {
        180
    }

    fn dest_port() -> u16 {
        179
    }

    fn families() -> Vec<Family> {
        vec![Family::ipv4_unicast(), Family::ipv6_unicast()]
    }

    fn area() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    fn hello_interval() -> u16 {
        10
    }

    fn dead_interval() -> u32 {
        40
    }

    fn priority() -> u8 {
        1
    }

    fn cost() -> u16 {
        10
    }

    fn interface_kind() -> String {
        "broadcast".to_string()
    }

    fn restart_time() -> u16 {
        120
    }
}

/// Config (toml) representation of a BGP peer
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    // Peer connection details
    pub(super) remote_ip: String,
    pub(super) remote_as: u32,
    // Local connection details (defer to server config if not provided)
    pub(super) local_as: Option<u32>,
    pub(super) local_router_id: Option<Ipv4Addr>,

    // Peer is configured and allowed to connect
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,

    // Only listen for incoming TCP sessions for passive peers,
    // don't attempt outbound connections
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,

    // Route-reflector client (iBGP peers only)
    #[serde(default = "Defaults::client")]
    pub(super) client: bool,

    // Timer to keep peers active; keepalives go every 1/3rd of this
    #[serde(default = "Defaults::hold_timer")]
    pub(super) hold_timer: u16,

    // Destination port used when initiating the connection
    #[serde(default = "Defaults::dest_port")]
    pub(super) dest_port: u16,

    // AFI/SAFI families to negotiate with this peer
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,

    // Policy names (defined in [[policies]]) applied at import/export
    pub(super) import_policy: Option<String>,
    pub(super) export_policy: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct OspfInterfaceSpec {
    pub(super) name: String,
    // Interface address with mask, E.g. "192.0.2.1/30"
    pub(super) address: String,
    #[serde(default = "Defaults::hello_interval")]
    pub(super) hello_interval: u16,
    #[serde(default = "Defaults::dead_interval")]
    pub(super) dead_interval: u32,
    #[serde(default = "Defaults::priority")]
    pub(super) priority: u8,
    #[serde(default = "Defaults::cost")]
    pub(super) cost: u16,
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,
    // "broadcast" or "point-to-point"
    #[serde(default = "Defaults::interface_kind")]
    pub(super) kind: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct OspfSpec {
    #[serde(default = "Defaults::area")]
    pub(super) area: Ipv4Addr,
    #[serde(default = "Vec::new", rename = "interface")]
    pub(super) interfaces: Vec<OspfInterfaceSpec>,
}

impl Default for OspfSpec {
    fn default() -> Self {
        Self {
            area: Defaults::area(),
            interfaces: Vec::new(),
        }
    }
}

/// Static route injected into the Loc-RIB and advertised per policy
#[derive(Clone, Debug, Deserialize)]
pub struct StaticRouteSpec {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub origin: Option<String>,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    #[serde(default = "Vec::new")]
    pub as_path: Vec<String>,
    #[serde(default = "Vec::new")]
    pub communities: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct FlapDampingSpec {
    pub(super) suppress_threshold: u32,
    pub(super) reuse_threshold: u32,
    // Seconds for an accumulated penalty to halve
    pub(super) half_life: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct RpkiSpec {
    // Path to a JSON file of ROAs
    pub(super) roa_source: String,
    #[serde(default)]
    pub(super) reject_invalid: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct GracefulRestartSpec {
    #[serde(default = "Defaults::restart_time")]
    pub(super) restart_time: u16,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global router-id (can be overridden per-peer)
    pub(super) router_id: Ipv4Addr,
    // Global ASN (can be overridden per-peer)
    pub(super) default_as: u32,
    // Interval to poll idle peers (outbound connections)
    #[serde(default = "Defaults::poll_interval")]
    pub(super) poll_interval: u16,
    // Route-reflector cluster-id; presence enables reflection
    pub(super) cluster_id: Option<Ipv4Addr>,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
    #[serde(default)]
    pub(super) ospf: OspfSpec,
    #[serde(default = "Vec::new")]
    pub(super) policies: Vec<PolicySpec>,
    #[serde(default = "Vec::new")]
    pub(super) static_routes: Vec<StaticRouteSpec>,
    pub(super) flap_damping: Option<FlapDampingSpec>,
    pub(super) rpki: Option<RpkiSpec>,
    pub(super) graceful_restart: Option<GracefulRestartSpec>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }

    pub(super) fn from_str(contents: &str) -> io::Result<Self> {
        toml::from_str(contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
router_id = "10.0.1.1"
default_as = 65001
cluster_id = "10.0.0.1"

[[peers]]
remote_ip = "192.0.2.2"
remote_as = 65002
hold_timer = 30

[[peers]]
remote_ip = "10.0.1.0/24"
remote_as = 65001
passive = true
client = true
import_policy = "customers-in"

[ospf]
area = "0.0.0.0"

[[ospf.interface]]
name = "eth0"
address = "192.0.2.1/30"
kind = "point-to-point"

[[ospf.interface]]
name = "lo"
address = "10.0.1.1/32"
passive = true

[[policies]]
name = "customers-in"
default_action = "reject"

[[policies.rules]]
prefix = "198.51.100.0/24"
actions = ["set-local-pref 200", "accept"]

[[static_routes]]
prefix = "203.0.113.128/25"
next_hop = "192.0.2.1"
origin = "igp"

[flap_damping]
suppress_threshold = 2000
reuse_threshold = 750
half_life = 900

[graceful_restart]
restart_time = 90
"#;

    #[test]
    fn test_parse_example_config() {
        let spec = ServerConfigSpec::from_str(EXAMPLE).unwrap();
        assert_eq!(spec.router_id, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(spec.default_as, 65001);
        assert_eq!(spec.cluster_id, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(spec.peers.len(), 2);
        assert_eq!(spec.peers[0].hold_timer, 30);
        assert!(!spec.peers[0].client);
        assert!(spec.peers[1].client);
        assert!(spec.peers[1].passive);
        assert_eq!(spec.ospf.interfaces.len(), 2);
        assert_eq!(spec.ospf.interfaces[0].kind, "point-to-point");
        assert!(spec.ospf.interfaces[1].passive);
        assert_eq!(spec.policies.len(), 1);
        assert_eq!(spec.static_routes.len(), 1);
        assert_eq!(spec.flap_damping.as_ref().unwrap().half_life, 900);
        assert_eq!(spec.graceful_restart.as_ref().unwrap().restart_time, 90);
        assert!(spec.rpki.is_none());
    }

    #[test]
    fn test_defaults_applied() {
        let spec = ServerConfigSpec::from_str(
            r#"
router_id = "1.1.1.1"
default_as = 65000

[[peers]]
remote_ip = "192.0.2.9"
remote_as = 65009
"#,
        )
        .unwrap();
        let peer = &spec.peers[0];
        assert!(peer.enabled);
        assert!(!peer.passive);
        assert_eq!(peer.hold_timer, 180);
        assert_eq!(peer.dest_port, 179);
        assert_eq!(peer.families.len(), 2);
        assert_eq!(spec.poll_interval, 30);
    }
}
