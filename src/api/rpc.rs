use std::net::{IpAddr, Ipv4Addr};

use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

/// Read-only snapshot queries over the agent's state. Snapshot semantics
/// only: every call returns a copy taken from the scheduler's last push.
#[rpc(client, server)]
pub trait Api {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>>;
    #[method(name = "show_peer_detail")]
    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>>;
    #[method(name = "show_rib")]
    async fn show_rib(&self) -> RpcResult<Vec<RibRow>>;
    #[method(name = "show_routes_learned")]
    async fn show_routes_learned(&self, from_peer: Option<IpAddr>) -> RpcResult<Vec<RibRow>>;
    #[method(name = "show_routes_advertised")]
    async fn show_routes_advertised(&self, to_peer: Option<IpAddr>) -> RpcResult<Vec<RibRow>>;
    #[method(name = "show_ospf_neighbors")]
    async fn show_ospf_neighbors(&self) -> RpcResult<Vec<OspfNeighborRow>>;
    #[method(name = "show_ospf_database")]
    async fn show_ospf_database(&self) -> RpcResult<Vec<LsdbRow>>;
    #[method(name = "show_ospf_routes")]
    async fn show_ospf_routes(&self) -> RpcResult<Vec<SpfRouteRow>>;
    #[method(name = "show_fib")]
    async fn show_fib(&self) -> RpcResult<Vec<FibRow>>;
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerSummary {
    pub peer: IpAddr,
    pub enabled: bool,
    pub router_id: Option<Ipv4Addr>,
    pub remote_asn: u32,
    pub local_asn: u32,
    pub msg_received: Option<u64>,
    pub msg_sent: Option<u64>,
    pub connect_time: Option<i64>,
    pub uptime: Option<String>,
    pub state: String,
    pub prefixes_received: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerDetail {
    pub summary: PeerSummary,
    pub hold_timer: u16,
    pub hold_timer_interval: u16,
    pub adj_rib_in: usize,
    pub adj_rib_out: usize,
    pub capabilities: Vec<String>,
    pub stale_window: Option<u16>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RibRow {
    pub prefix: String,
    pub source: String,
    pub peer: Option<IpAddr>,
    pub received_at: i64,
    pub age: String,
    pub next_hop: IpAddr,
    pub origin: String,
    pub as_path: String,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: Vec<String>,
    pub validation: String,
    pub stale: bool,
    pub best: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OspfNeighborRow {
    pub router_id: Ipv4Addr,
    pub address: Ipv4Addr,
    pub interface: String,
    pub priority: u8,
    pub state: String,
    pub pending_requests: usize,
    pub pending_retransmits: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LsdbRow {
    pub ls_type: String,
    pub link_state_id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
    pub sequence: String,
    pub age: u16,
    pub checksum: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SpfRouteRow {
    pub prefix: String,
    pub cost: u32,
    pub next_hop: Ipv4Addr,
    pub via: Ipv4Addr,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FibRow {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub metric: u32,
    pub source: String,
    pub state: String,
}
