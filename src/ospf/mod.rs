pub mod flooding;
pub mod interface;
pub mod lsa;
pub mod lsdb;
pub mod neighbor;
pub mod packet;
#[cfg(unix)]
pub mod socket;
pub mod spf;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use tokio::time::{interval, Interval};

use crate::config::OspfConfig;
use flooding::RETRANSMIT_INTERVAL;
use interface::{Interface, NeighborChange};
use lsa::{Lsa, LsaBody, INITIAL_SEQUENCE, LS_REFRESH_TIME, MAX_AGE};
use lsdb::Lsdb;
use neighbor::{DdOutcome, NeighborEvent, NeighborState};
use packet::{Packet, PacketBody, ALL_SPF_ROUTERS, OPTIONS_E};
#[cfg(unix)]
use socket::OspfSocket;
use spf::SpfRoute;

#[derive(Debug)]
pub enum OspfError {
    Io(io::Error),
    NotStarted,
}

impl fmt::Display for OspfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OspfError::Io(err) => write!(f, "OSPF I/O error: {}", err),
            OspfError::NotStarted => write!(f, "OSPF instance not started"),
        }
    }
}

impl std::error::Error for OspfError {}

impl From<io::Error> for OspfError {
    fn from(err: io::Error) -> Self {
        OspfError::Io(err)
    }
}

/// Surfaced to the server loop when the link-state topology moved
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OspfUpdate {
    TopologyChanged,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OspfCounters {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
}

/// A packet queued for transmission: (egress interface address, destination)
struct Outbound {
    local: Ipv4Addr,
    dst: Ipv4Addr,
    packet: Packet,
}

enum Tick {
    Packet(Vec<u8>, Ipv4Addr),
    Hello,
    Aging,
    Retransmit,
}

/// A single-area OSPFv2 speaker: owns the LSDB, the interfaces and
/// their neighbor machines, and the raw protocol-89 socket.
pub struct Instance {
    pub router_id: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub interfaces: Vec<Interface>,
    pub lsdb: Lsdb,
    pub counters: OspfCounters,
    #[cfg(unix)]
    socket: Option<Arc<OspfSocket>>,
    hello_timer: Interval,
    aging_timer: Interval,
    retransmit_timer: Interval,
}

impl Instance {
    pub fn new(router_id: Ipv4Addr, config: &OspfConfig) -> Self {
        let interfaces = config
            .interfaces
            .iter()
            .map(|interface_config| Interface::new(Arc::clone(interface_config)))
            .collect();
        let hello_interval = config
            .interfaces
            .iter()
            .map(|i| i.hello_interval)
            .min()
            .unwrap_or(10);
        Self {
            router_id,
            area_id: config.area,
            interfaces,
            lsdb: Lsdb::new(),
            counters: OspfCounters::default(),
            #[cfg(unix)]
            socket: None,
            hello_timer: interval(Duration::from_secs(u64::from(hello_interval))),
            aging_timer: interval(Duration::from_secs(1)),
            retransmit_timer: interval(Duration::from_secs(RETRANSMIT_INTERVAL)),
        }
    }

    /// Open the raw socket and join AllSPFRouters on every active interface
    #[cfg(unix)]
    pub fn start(&mut self) -> io::Result<()> {
        let socket = OspfSocket::new()?;
        for interface in &self.interfaces {
            if !interface.config.passive {
                socket.join(interface.local_addr())?;
                info!(
                    "OSPF listening on {} [{}]",
                    interface.config.name,
                    interface.config.address
                );
            }
        }
        self.socket = Some(Arc::new(socket));
        self.originate_router_lsa();
        Ok(())
    }

    /// Drive the instance one step: a received packet or a timer firing
    #[cfg(unix)]
    pub async fn run(&mut self) -> Result<Option<OspfUpdate>, OspfError> {
        let socket = match &self.socket {
            Some(socket) => Arc::clone(socket),
            None => return Err(OspfError::NotStarted),
        };
        let tick = tokio::select! {
            result = socket.recv() => {
                let (data, src) = result?;
                Tick::Packet(data, src)
            }
            _ = self.hello_timer.tick() => Tick::Hello,
            _ = self.aging_timer.tick() => Tick::Aging,
            _ = self.retransmit_timer.tick() => Tick::Retransmit,
        };

        let (outbox, changed) = match tick {
            Tick::Packet(data, src) => self.handle_packet(&data, src),
            Tick::Hello => self.on_hello_tick(),
            Tick::Aging => self.on_aging_tick(),
            Tick::Retransmit => (self.on_retransmit_tick(), false),
        };

        for outbound in outbox {
            let mut buf = BytesMut::with_capacity(128);
            outbound.packet.encode(&mut buf);
            trace!(
                "Outgoing {} to {} via {}",
                outbound.packet.body.kind(),
                outbound.dst,
                outbound.local
            );
            if let Err(err) = socket.send_to(&buf, outbound.local, outbound.dst).await {
                warn!("Error sending {}: {}", outbound.packet.body.kind(), err);
            } else {
                self.counters.packets_sent += 1;
            }
        }
        Ok(changed.then_some(OspfUpdate::TopologyChanged))
    }

    /// The intra-area routing table for the current database
    pub fn compute_routes(&self) -> Vec<SpfRoute> {
        spf::compute(&self.lsdb, self.router_id)
    }

    fn handle_packet(&mut self, data: &[u8], src: Ipv4Addr) -> (Vec<Outbound>, bool) {
        self.counters.packets_received += 1;
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.counters.packets_dropped += 1;
                debug!("Dropping packet from {}: {}", src, err);
                return (vec![], false);
            }
        };
        if packet.router_id == self.router_id {
            return (vec![], false); // Our own multicast, looped back
        }
        if packet.area_id != self.area_id {
            self.counters.packets_dropped += 1;
            debug!(
                "Dropping {} from {}: area {} not {}",
                packet.body.kind(),
                src,
                packet.area_id,
                self.area_id
            );
            return (vec![], false);
        }
        let Some(interface_index) = self.interfaces.iter().position(|i| i.covers(src)) else {
            self.counters.packets_dropped += 1;
            debug!("Dropping {} from {}: no matching interface", packet.body.kind(), src);
            return (vec![], false);
        };
        trace!("Incoming {} from {} [{}]", packet.body.kind(), packet.router_id, src);

        match &packet.body {
            PacketBody::Hello(hello) => {
                self.handle_hello(interface_index, packet.router_id, src, hello)
            }
            PacketBody::DatabaseDescription(dd) => {
                self.handle_dd(interface_index, src, dd)
            }
            PacketBody::LinkStateRequest(requests) => {
                self.handle_lsr(interface_index, src, requests)
            }
            PacketBody::LinkStateUpdate(lsas) => {
                self.handle_lsu(interface_index, src, lsas.clone())
            }
            PacketBody::LinkStateAck(headers) => {
                if let Some(neighbor) = self.interfaces[interface_index].neighbor_by_addr(src) {
                    flooding::process_ack(headers, neighbor);
                }
                (vec![], false)
            }
        }
    }

    fn handle_hello(
        &mut self,
        interface_index: usize,
        router_id: Ipv4Addr,
        src: Ipv4Addr,
        hello: &packet::Hello,
    ) -> (Vec<Outbound>, bool) {
        let my_router_id = self.router_id;
        let changes =
            self.interfaces[interface_index].process_hello(my_router_id, router_id, src, hello);
        let mut outbox = Vec::new();
        let mut adjacency_changed = false;
        for change in &changes {
            if change.to == NeighborState::ExStart {
                // Open the exchange immediately rather than waiting a tick
                outbox.extend(self.dd_for_neighbor(interface_index, change.router_id));
            }
            if change.from == NeighborState::Full || change.to == NeighborState::Full {
                adjacency_changed = true;
            }
        }
        let originated = if adjacency_changed {
            let (flood, changed) = self.originate_router_lsa();
            outbox.extend(flood);
            changed
        } else {
            false
        };
        (outbox, originated)
    }

    fn dd_for_neighbor(&mut self, interface_index: usize, router_id: Ipv4Addr) -> Vec<Outbound> {
        let interface = &mut self.interfaces[interface_index];
        let local = interface.local_addr();
        let mtu = 1500;
        let Some(neighbor) = interface.neighbors.get_mut(&router_id) else {
            return vec![];
        };
        let dd = neighbor.next_dd(mtu, OPTIONS_E);
        let dst = neighbor.addr;
        vec![Outbound {
            local,
            dst,
            packet: Packet::new(
                self.router_id,
                self.area_id,
                PacketBody::DatabaseDescription(dd),
            ),
        }]
    }

    fn handle_dd(
        &mut self,
        interface_index: usize,
        src: Ipv4Addr,
        dd: &packet::DatabaseDescription,
    ) -> (Vec<Outbound>, bool) {
        let my_router_id = self.router_id;
        let area_id = self.area_id;
        let lsdb = &self.lsdb;
        let interface = &mut self.interfaces[interface_index];
        let local = interface.local_addr();
        let Some(neighbor) = interface.neighbor_by_addr(src) else {
            return (vec![], false);
        };
        let outcome = neighbor.process_dd(dd, my_router_id, lsdb);
        let mut outbox = Vec::new();
        let mut push = |dst: Ipv4Addr, body: PacketBody| {
            outbox.push(Outbound {
                local,
                dst,
                packet: Packet::new(my_router_id, area_id, body),
            });
        };
        match outcome {
            DdOutcome::Negotiated | DdOutcome::Accepted => {
                let in_exchange = neighbor.state == NeighborState::Exchange;
                if !neighbor.master || in_exchange {
                    // Slave always answers; master continues while exchanging
                    let reply = neighbor.next_dd(1500, OPTIONS_E);
                    push(neighbor.addr, PacketBody::DatabaseDescription(reply));
                }
                if neighbor.state == NeighborState::Loading {
                    let requests: Vec<_> = neighbor.ls_requests.iter().copied().collect();
                    push(neighbor.addr, PacketBody::LinkStateRequest(requests));
                }
            }
            DdOutcome::Duplicate => {
                if !neighbor.master {
                    if let Some(last) = neighbor.last_sent_dd.clone() {
                        push(neighbor.addr, PacketBody::DatabaseDescription(last));
                    }
                }
            }
            DdOutcome::Mismatch => {
                let restart = neighbor.next_dd(1500, OPTIONS_E);
                push(neighbor.addr, PacketBody::DatabaseDescription(restart));
            }
            DdOutcome::Ignored => (),
        }

        let became_full = neighbor.state == NeighborState::Full;
        let mut changed = false;
        if became_full {
            let (flood, originated) = self.originate_router_lsa();
            outbox.extend(flood);
            changed = originated;
        }
        (outbox, changed)
    }

    fn handle_lsr(
        &mut self,
        interface_index: usize,
        src: Ipv4Addr,
        requests: &[lsa::LsaKey],
    ) -> (Vec<Outbound>, bool) {
        let my_router_id = self.router_id;
        let area_id = self.area_id;
        let mut copies = Vec::with_capacity(requests.len());
        let mut bad_request = false;
        for key in requests {
            match self.lsdb.get(key) {
                Some(lsa) => copies.push(lsa.clone()),
                None => {
                    warn!("{} requested {} which we do not hold", src, key);
                    bad_request = true;
                    break;
                }
            }
        }
        let interface = &mut self.interfaces[interface_index];
        let local = interface.local_addr();
        let Some(neighbor) = interface.neighbor_by_addr(src) else {
            return (vec![], false);
        };
        if neighbor.state < NeighborState::Exchange {
            return (vec![], false);
        }
        if bad_request {
            neighbor.handle_event(NeighborEvent::BadLsReq);
            let restart = neighbor.next_dd(1500, OPTIONS_E);
            return (
                vec![Outbound {
                    local,
                    dst: neighbor.addr,
                    packet: Packet::new(
                        my_router_id,
                        area_id,
                        PacketBody::DatabaseDescription(restart),
                    ),
                }],
                false,
            );
        }
        if copies.is_empty() {
            return (vec![], false);
        }
        (
            vec![Outbound {
                local,
                dst: neighbor.addr,
                packet: Packet::new(my_router_id, area_id, PacketBody::LinkStateUpdate(copies)),
            }],
            false,
        )
    }

    fn handle_lsu(
        &mut self,
        interface_index: usize,
        src: Ipv4Addr,
        lsas: Vec<Lsa>,
    ) -> (Vec<Outbound>, bool) {
        let my_router_id = self.router_id;
        let area_id = self.area_id;
        let local = self.interfaces[interface_index].local_addr();
        let Some(neighbor) = self.interfaces[interface_index].neighbor_by_addr(src) else {
            return (vec![], false);
        };
        let sender_id = neighbor.router_id;
        let sender_addr = neighbor.addr;
        let was_loading = neighbor.state == NeighborState::Loading;
        let plan = flooding::plan_update(&self.lsdb, lsas, neighbor);
        let finished_loading = was_loading && neighbor.state == NeighborState::Full;

        let mut outbox = Vec::new();
        if !plan.ack.is_empty() {
            outbox.push(Outbound {
                local,
                dst: sender_addr,
                packet: Packet::new(my_router_id, area_id, PacketBody::LinkStateAck(plan.ack)),
            });
        }
        if !plan.send_back.is_empty() {
            outbox.push(Outbound {
                local,
                dst: sender_addr,
                packet: Packet::new(
                    my_router_id,
                    area_id,
                    PacketBody::LinkStateUpdate(plan.send_back),
                ),
            });
        }

        let changed = !plan.install.is_empty();
        for lsa in &plan.install {
            self.lsdb.install(lsa.clone());
        }
        if changed {
            outbox.extend(self.flood(&plan.install, Some(sender_id)));
        }
        if finished_loading {
            let (flood, _) = self.originate_router_lsa();
            outbox.extend(flood);
        }
        (outbox, changed)
    }

    /// Schedule LSAs to every Full neighbor except the one they came from,
    /// one multicast LSU per interface with interested neighbors
    fn flood(&mut self, lsas: &[Lsa], except: Option<Ipv4Addr>) -> Vec<Outbound> {
        let my_router_id = self.router_id;
        let area_id = self.area_id;
        let mut outbox = Vec::new();
        for interface in &mut self.interfaces {
            let local = interface.local_addr();
            let mut interested = false;
            for neighbor in interface.neighbors.values_mut() {
                if !neighbor.is_adjacent() || Some(neighbor.router_id) == except {
                    continue;
                }
                for lsa in lsas {
                    flooding::enqueue_flood(lsa, neighbor);
                }
                interested = true;
            }
            if interested {
                outbox.push(Outbound {
                    local,
                    dst: ALL_SPF_ROUTERS,
                    packet: Packet::new(
                        my_router_id,
                        area_id,
                        PacketBody::LinkStateUpdate(lsas.to_vec()),
                    ),
                });
            }
        }
        outbox
    }

    /// (Re-)originate our Router LSA when our links changed.
    /// Returns the flood packets and whether anything changed.
    fn originate_router_lsa(&mut self) -> (Vec<Outbound>, bool) {
        let links: Vec<lsa::RouterLink> = self
            .interfaces
            .iter()
            .flat_map(|interface| interface.router_links())
            .collect();
        let key = lsa::LsaKey {
            ls_type: lsa::LsType::Router,
            id: self.router_id,
            advertising_router: self.router_id,
        };
        let sequence = match self.lsdb.get(&key) {
            Some(current) => {
                if let LsaBody::Router {
                    links: current_links,
                    ..
                } = &current.body
                {
                    if *current_links == links {
                        return (vec![], false);
                    }
                }
                current.header.sequence.wrapping_add(1)
            }
            None => INITIAL_SEQUENCE,
        };
        let lsa = Lsa::new(
            0,
            OPTIONS_E,
            self.router_id,
            self.router_id,
            sequence,
            LsaBody::Router { flags: 0, links },
        );
        debug!(
            "Originating router LSA seq={:#x} ({} links)",
            sequence,
            match &lsa.body {
                LsaBody::Router { links, .. } => links.len(),
                _ => 0,
            }
        );
        self.lsdb.install(lsa.clone());
        let outbox = self.flood(&[lsa], None);
        (outbox, true)
    }

    fn on_hello_tick(&mut self) -> (Vec<Outbound>, bool) {
        let my_router_id = self.router_id;
        let area_id = self.area_id;
        let mut outbox = Vec::new();
        let mut lost_adjacency = false;
        let mut changes: Vec<NeighborChange> = Vec::new();
        for interface in &mut self.interfaces {
            if interface.config.passive {
                continue;
            }
            let hello = interface.build_hello();
            outbox.push(Outbound {
                local: interface.local_addr(),
                dst: ALL_SPF_ROUTERS,
                packet: Packet::new(my_router_id, area_id, PacketBody::Hello(hello)),
            });
            changes.extend(interface.expire_neighbors());
        }
        for change in &changes {
            if change.from == NeighborState::Full {
                lost_adjacency = true;
            }
        }
        let changed = if lost_adjacency {
            let (flood, changed) = self.originate_router_lsa();
            outbox.extend(flood);
            changed
        } else {
            false
        };
        (outbox, changed)
    }

    fn on_aging_tick(&mut self) -> (Vec<Outbound>, bool) {
        let flushed = self.lsdb.age_tick();
        let mut changed = !flushed.is_empty();
        let mut outbox = if flushed.is_empty() {
            vec![]
        } else {
            self.flood(&flushed, None)
        };

        // Refresh our own LSAs before they decay
        let due = self.lsdb.due_for_refresh(self.router_id, LS_REFRESH_TIME);
        for stale in due {
            let mut refreshed = stale;
            refreshed.header.age = 0;
            refreshed.header.sequence = refreshed.header.sequence.wrapping_add(1);
            refreshed.finalize();
            debug!(
                "Refreshing {} seq={:#x}",
                refreshed.key(),
                refreshed.header.sequence
            );
            self.lsdb.install(refreshed.clone());
            outbox.extend(self.flood(&[refreshed], None));
            changed = true;
        }
        (outbox, changed)
    }

    /// Unacknowledged work is re-sent every RxmtInterval until it lands
    fn on_retransmit_tick(&mut self) -> Vec<Outbound> {
        let my_router_id = self.router_id;
        let area_id = self.area_id;
        let mut outbox = Vec::new();
        for interface in &mut self.interfaces {
            let local = interface.local_addr();
            for neighbor in interface.neighbors.values_mut() {
                let mut push = |dst: Ipv4Addr, body: PacketBody| {
                    outbox.push(Outbound {
                        local,
                        dst,
                        packet: Packet::new(my_router_id, area_id, body),
                    });
                };
                match neighbor.state {
                    NeighborState::ExStart => {
                        let dd = neighbor.next_dd(1500, OPTIONS_E);
                        push(neighbor.addr, PacketBody::DatabaseDescription(dd));
                    }
                    NeighborState::Exchange if neighbor.master => {
                        if let Some(last) = neighbor.last_sent_dd.clone() {
                            push(neighbor.addr, PacketBody::DatabaseDescription(last));
                        }
                    }
                    NeighborState::Loading => {
                        let requests: Vec<_> = neighbor.ls_requests.iter().copied().collect();
                        if !requests.is_empty() {
                            push(neighbor.addr, PacketBody::LinkStateRequest(requests));
                        }
                    }
                    _ => (),
                }
                if neighbor.state >= NeighborState::Exchange && !neighbor.retransmits.is_empty() {
                    let pending: Vec<Lsa> = neighbor
                        .retransmits
                        .values()
                        .filter(|lsa| lsa.header.age < MAX_AGE)
                        .cloned()
                        .collect();
                    if !pending.is_empty() {
                        trace!(
                            "Retransmitting {} LSAs to {}",
                            pending.len(),
                            neighbor.router_id
                        );
                        push(neighbor.addr, PacketBody::LinkStateUpdate(pending));
                    }
                }
            }
        }
        outbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceKind, OspfInterfaceConfig};
    use ipnetwork::Ipv4Network;

    fn instance() -> Instance {
        let config = OspfConfig {
            area: Ipv4Addr::UNSPECIFIED,
            interfaces: vec![
                Arc::new(OspfInterfaceConfig {
                    name: "eth0".into(),
                    address: "192.0.2.1/30".parse::<Ipv4Network>().unwrap(),
                    hello_interval: 10,
                    dead_interval: 40,
                    priority: 1,
                    cost: 10,
                    passive: false,
                    kind: InterfaceKind::PointToPoint,
                }),
                Arc::new(OspfInterfaceConfig {
                    name: "lo0".into(),
                    address: "10.0.0.1/32".parse::<Ipv4Network>().unwrap(),
                    hello_interval: 10,
                    dead_interval: 40,
                    priority: 0,
                    cost: 0,
                    passive: true,
                    kind: InterfaceKind::PointToPoint,
                }),
            ],
        };
        Instance::new(Ipv4Addr::new(10, 0, 0, 1), &config)
    }

    #[test]
    fn test_originate_router_lsa_includes_loopback_stub() {
        let mut instance = instance();
        let (_, changed) = instance.originate_router_lsa();
        assert!(changed);
        let key = lsa::LsaKey {
            ls_type: lsa::LsType::Router,
            id: instance.router_id,
            advertising_router: instance.router_id,
        };
        let lsa = instance.lsdb.get(&key).unwrap();
        match &lsa.body {
            LsaBody::Router { links, .. } => {
                assert!(links
                    .iter()
                    .any(|link| link.id == Ipv4Addr::new(10, 0, 0, 1)
                        && link.kind == lsa::LinkKind::Stub));
            }
            other => panic!("Expected router LSA, got {:?}", other),
        }
    }

    #[test]
    fn test_reoriginate_only_on_change() {
        let mut instance = instance();
        let (_, first) = instance.originate_router_lsa();
        let (_, second) = instance.originate_router_lsa();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_wrong_area_packet_dropped() {
        let mut instance = instance();
        let packet = Packet::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(0, 0, 0, 1), // Not our area
            PacketBody::Hello(packet::Hello {
                network_mask: "255.255.255.252".parse().unwrap(),
                hello_interval: 10,
                options: OPTIONS_E,
                priority: 1,
                dead_interval: 40,
                designated_router: Ipv4Addr::UNSPECIFIED,
                backup_designated_router: Ipv4Addr::UNSPECIFIED,
                neighbors: vec![],
            }),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        let (outbox, changed) = instance.handle_packet(&buf, Ipv4Addr::new(192, 0, 2, 2));
        assert!(outbox.is_empty());
        assert!(!changed);
        assert_eq!(instance.counters.packets_dropped, 1);
    }

    #[test]
    fn test_hello_exchange_reaches_exstart_and_sends_dd() {
        let mut instance = instance();
        let hello = packet::Hello {
            network_mask: "255.255.255.252".parse().unwrap(),
            hello_interval: 10,
            options: OPTIONS_E,
            priority: 1,
            dead_interval: 40,
            designated_router: Ipv4Addr::UNSPECIFIED,
            backup_designated_router: Ipv4Addr::UNSPECIFIED,
            neighbors: vec![Ipv4Addr::new(10, 0, 0, 1)],
        };
        let packet = Packet::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::UNSPECIFIED,
            PacketBody::Hello(hello),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        let (outbox, _) = instance.handle_packet(&buf, Ipv4Addr::new(192, 0, 2, 2));
        // Immediate empty DD with I|M|MS claiming mastership
        assert_eq!(outbox.len(), 1);
        match &outbox[0].packet.body {
            PacketBody::DatabaseDescription(dd) => {
                assert!(dd.is_init() && dd.is_more() && dd.is_master());
                assert!(dd.headers.is_empty());
            }
            other => panic!("Expected DD, got {:?}", other),
        }
    }
}
