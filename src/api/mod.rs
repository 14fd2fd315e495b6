pub mod rpc;

pub use rpc::{
    ApiServer, FibRow, LsdbRow, OspfNeighborRow, PeerDetail, PeerSummary, RibRow, SpfRouteRow,
};

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};
use log::info;

/// The last snapshot pushed by the scheduler; readers copy rows out and
/// never hold a live reference to protocol state
#[derive(Debug, Default)]
pub struct ApiState {
    pub peers: Vec<PeerSummary>,
    pub peer_details: Vec<PeerDetail>,
    pub loc_rib: Vec<RibRow>,
    pub learned: Vec<RibRow>,
    pub advertised: Vec<RibRow>,
    pub ospf_neighbors: Vec<OspfNeighborRow>,
    pub lsdb: Vec<LsdbRow>,
    pub spf_routes: Vec<SpfRouteRow>,
    pub fib: Vec<FibRow>,
}

pub type SharedState = Arc<Mutex<ApiState>>;

pub struct ApiHandler {
    state: SharedState,
}

impl ApiHandler {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    fn snapshot<T: Clone>(&self, select: impl Fn(&ApiState) -> &Vec<T>) -> Vec<T> {
        let state = self.state.lock().expect("API state lock");
        select(&state).clone()
    }
}

#[async_trait]
impl ApiServer for ApiHandler {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        Ok(self.snapshot(|state| &state.peers))
    }

    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>> {
        Ok(self.snapshot(|state| &state.peer_details))
    }

    async fn show_rib(&self) -> RpcResult<Vec<RibRow>> {
        Ok(self.snapshot(|state| &state.loc_rib))
    }

    async fn show_routes_learned(&self, from_peer: Option<IpAddr>) -> RpcResult<Vec<RibRow>> {
        let mut rows = self.snapshot(|state| &state.learned);
        if let Some(peer) = from_peer {
            rows.retain(|row| row.peer == Some(peer));
        }
        Ok(rows)
    }

    async fn show_routes_advertised(&self, to_peer: Option<IpAddr>) -> RpcResult<Vec<RibRow>> {
        let mut rows = self.snapshot(|state| &state.advertised);
        if let Some(peer) = to_peer {
            rows.retain(|row| row.peer == Some(peer));
        }
        Ok(rows)
    }

    async fn show_ospf_neighbors(&self) -> RpcResult<Vec<OspfNeighborRow>> {
        Ok(self.snapshot(|state| &state.ospf_neighbors))
    }

    async fn show_ospf_database(&self) -> RpcResult<Vec<LsdbRow>> {
        Ok(self.snapshot(|state| &state.lsdb))
    }

    async fn show_ospf_routes(&self) -> RpcResult<Vec<SpfRouteRow>> {
        Ok(self.snapshot(|state| &state.spf_routes))
    }

    async fn show_fib(&self) -> RpcResult<Vec<FibRow>> {
        Ok(self.snapshot(|state| &state.fib))
    }
}

/// Start the RPC server; the returned handle stops it on drop
pub async fn serve(
    addr: SocketAddr,
    state: SharedState,
) -> Result<HttpServerHandle, Box<dyn std::error::Error>> {
    let server = HttpServerBuilder::default().build(addr).await?;
    let local_addr = server.local_addr()?;
    let handle = server.start(ApiHandler::new(state).into_rpc())?;
    info!("API listening on {}", local_addr);
    Ok(handle)
}
