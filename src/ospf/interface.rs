use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, warn};

use super::lsa::{LinkKind, RouterLink};
use super::neighbor::{Neighbor, NeighborEvent, NeighborState};
use super::packet::{Hello, OPTIONS_E};
use crate::config::{InterfaceKind, OspfInterfaceConfig};

/// A neighbor state transition observed while processing a packet
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NeighborChange {
    pub router_id: Ipv4Addr,
    pub from: NeighborState,
    pub to: NeighborState,
}

pub struct Interface {
    pub config: Arc<OspfInterfaceConfig>,
    /// Interface address of the elected DR / BDR (self included)
    pub designated_router: Ipv4Addr,
    pub backup_designated_router: Ipv4Addr,
    /// Neighbors seen on this interface, keyed by router-id
    pub neighbors: HashMap<Ipv4Addr, Neighbor>,
}

impl Interface {
    pub fn new(config: Arc<OspfInterfaceConfig>) -> Self {
        Self {
            config,
            designated_router: Ipv4Addr::UNSPECIFIED,
            backup_designated_router: Ipv4Addr::UNSPECIFIED,
            neighbors: HashMap::new(),
        }
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.config.address.ip()
    }

    /// Does this interface's network contain the given source address?
    pub fn covers(&self, addr: Ipv4Addr) -> bool {
        self.config.address.contains(addr)
    }

    pub fn build_hello(&self) -> Hello {
        Hello {
            network_mask: self.config.address.mask(),
            hello_interval: self.config.hello_interval,
            options: OPTIONS_E,
            priority: self.config.priority,
            dead_interval: self.config.dead_interval,
            designated_router: self.designated_router,
            backup_designated_router: self.backup_designated_router,
            neighbors: self.neighbors.keys().copied().collect(),
        }
    }

    /// Must this router become adjacent with the neighbor? Always on
    /// point-to-point links; on broadcast only when either end is DR or BDR.
    fn should_form_adjacency(&self, neighbor_addr: Ipv4Addr) -> bool {
        match self.config.kind {
            InterfaceKind::PointToPoint => true,
            InterfaceKind::Broadcast => {
                let special = [self.designated_router, self.backup_designated_router];
                special.contains(&self.local_addr()) || special.contains(&neighbor_addr)
            }
        }
    }

    /// Hello receive path: parameter checks, neighbor upkeep, 1-way/2-way
    /// detection, and (on broadcast) DR election
    pub fn process_hello(
        &mut self,
        my_router_id: Ipv4Addr,
        src_router_id: Ipv4Addr,
        src_addr: Ipv4Addr,
        hello: &Hello,
    ) -> Vec<NeighborChange> {
        // Parameter mismatches reject the neighbor silently
        if hello.hello_interval != self.config.hello_interval
            || hello.dead_interval != self.config.dead_interval
        {
            warn!(
                "{}: Hello timer mismatch from {} ({}s/{}s, expected {}s/{}s)",
                self.config.name,
                src_router_id,
                hello.hello_interval,
                hello.dead_interval,
                self.config.hello_interval,
                self.config.dead_interval,
            );
            return vec![];
        }
        if self.config.kind == InterfaceKind::Broadcast
            && hello.network_mask != self.config.address.mask()
        {
            warn!(
                "{}: Network mask mismatch from {} ({}, expected {})",
                self.config.name,
                src_router_id,
                hello.network_mask,
                self.config.address.mask(),
            );
            return vec![];
        }

        let mut changes = Vec::new();
        let name = &self.config.name;
        let neighbor = self
            .neighbors
            .entry(src_router_id)
            .or_insert_with(|| {
                debug!("{}: New neighbor {} [{}]", name, src_router_id, src_addr);
                Neighbor::new(src_router_id, src_addr, hello.priority)
            });
        neighbor.hello_seen();
        neighbor.priority = hello.priority;
        neighbor.addr = src_addr;
        neighbor.designated_router = hello.designated_router;
        neighbor.backup_designated_router = hello.backup_designated_router;

        let before = neighbor.state;
        neighbor.handle_event(NeighborEvent::HelloReceived);

        let two_way = hello.neighbors.contains(&my_router_id);
        if two_way {
            let form_adjacency = match self.config.kind {
                InterfaceKind::PointToPoint => true,
                // Election hasn't settled yet; AdjOk fires after it does
                InterfaceKind::Broadcast => {
                    let special = [self.designated_router, self.backup_designated_router];
                    special.contains(&self.local_addr()) || special.contains(&src_addr)
                }
            };
            neighbor.handle_event(NeighborEvent::TwoWayReceived { form_adjacency });
        } else {
            neighbor.handle_event(NeighborEvent::OneWayReceived);
        }
        if neighbor.state != before {
            changes.push(NeighborChange {
                router_id: src_router_id,
                from: before,
                to: neighbor.state,
            });
        }

        if self.config.kind == InterfaceKind::Broadcast && self.elect(my_router_id) {
            changes.extend(self.reconsider_adjacencies());
        }
        changes
    }

    /// DR/BDR election: highest (priority, router-id) among eligible
    /// routers wins, the runner-up becomes backup
    fn elect(&mut self, my_router_id: Ipv4Addr) -> bool {
        let mut candidates: Vec<(u8, Ipv4Addr, Ipv4Addr)> = self
            .neighbors
            .values()
            .filter(|neighbor| neighbor.state >= NeighborState::TwoWay && neighbor.priority > 0)
            .map(|neighbor| (neighbor.priority, neighbor.router_id, neighbor.addr))
            .collect();
        if self.config.priority > 0 {
            candidates.push((self.config.priority, my_router_id, self.local_addr()));
        }
        candidates.sort_by(|a, b| b.cmp(a));

        let new_dr = candidates
            .first()
            .map(|(_, _, addr)| *addr)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let new_bdr = candidates
            .get(1)
            .map(|(_, _, addr)| *addr)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let changed =
            new_dr != self.designated_router || new_bdr != self.backup_designated_router;
        if changed {
            debug!(
                "{}: DR election: DR={} BDR={}",
                self.config.name, new_dr, new_bdr
            );
            self.designated_router = new_dr;
            self.backup_designated_router = new_bdr;
        }
        changed
    }

    /// After an election change, adjacency requirements may differ
    fn reconsider_adjacencies(&mut self) -> Vec<NeighborChange> {
        let local_addr = self.local_addr();
        let (dr, bdr) = (self.designated_router, self.backup_designated_router);
        let kind = self.config.kind;
        let mut changes = Vec::new();
        for neighbor in self.neighbors.values_mut() {
            if neighbor.state < NeighborState::TwoWay {
                continue;
            }
            let form_adjacency = match kind {
                InterfaceKind::PointToPoint => true,
                InterfaceKind::Broadcast => {
                    let special = [dr, bdr];
                    special.contains(&local_addr) || special.contains(&neighbor.addr)
                }
            };
            let before = neighbor.state;
            neighbor.handle_event(NeighborEvent::AdjOk { form_adjacency });
            if neighbor.state != before {
                changes.push(NeighborChange {
                    router_id: neighbor.router_id,
                    from: before,
                    to: neighbor.state,
                });
            }
        }
        changes
    }

    /// Neighbors past the dead interval; purged and reported
    pub fn expire_neighbors(&mut self) -> Vec<NeighborChange> {
        let dead_interval = std::time::Duration::from_secs(u64::from(self.config.dead_interval));
        let mut changes = Vec::new();
        let expired: Vec<Ipv4Addr> = self
            .neighbors
            .values()
            .filter(|neighbor| {
                neighbor.state != NeighborState::Down
                    && neighbor.last_hello.elapsed() >= dead_interval
            })
            .map(|neighbor| neighbor.router_id)
            .collect();
        for router_id in expired {
            if let Some(mut neighbor) = self.neighbors.remove(&router_id) {
                warn!(
                    "{}: Neighbor {} dead interval expired",
                    self.config.name, router_id
                );
                let before = neighbor.state;
                neighbor.handle_event(NeighborEvent::InactivityTimer);
                changes.push(NeighborChange {
                    router_id,
                    from: before,
                    to: NeighborState::Down,
                });
            }
        }
        changes
    }

    /// This interface's contribution to our Router LSA
    pub fn router_links(&self) -> Vec<RouterLink> {
        let cost = self.config.cost;
        let network = self.config.address.network();
        let mask = self.config.address.mask();
        let stub = RouterLink {
            id: network,
            data: mask,
            kind: LinkKind::Stub,
            metric: cost,
        };

        if self.config.passive {
            return vec![stub];
        }
        match self.config.kind {
            InterfaceKind::PointToPoint => {
                let mut links: Vec<RouterLink> = self
                    .neighbors
                    .values()
                    .filter(|neighbor| neighbor.is_adjacent())
                    .map(|neighbor| RouterLink {
                        id: neighbor.router_id,
                        data: self.local_addr(),
                        kind: LinkKind::PointToPoint,
                        metric: cost,
                    })
                    .collect();
                // The subnet itself is always reachable as a stub
                links.push(stub);
                links
            }
            InterfaceKind::Broadcast => {
                let have_adjacency = self.neighbors.values().any(Neighbor::is_adjacent);
                if have_adjacency && !self.designated_router.is_unspecified() {
                    vec![RouterLink {
                        id: self.designated_router,
                        data: self.local_addr(),
                        kind: LinkKind::Transit,
                        metric: cost,
                    }]
                } else {
                    vec![stub]
                }
            }
        }
    }

    /// Neighbor lookup by the source address of a received packet
    pub fn neighbor_by_addr(&mut self, addr: Ipv4Addr) -> Option<&mut Neighbor> {
        self.neighbors
            .values_mut()
            .find(|neighbor| neighbor.addr == addr)
    }

    pub fn full_neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values().filter(|n| n.is_adjacent())
    }
}
