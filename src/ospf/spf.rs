use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use log::{trace, warn};

use super::lsa::{LinkKind, LsaBody, LsType};
use super::lsdb::Lsdb;

/// One destination in the intra-area routing table
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpfRoute {
    pub prefix: Ipv4Network,
    pub cost: u32,
    pub next_hop: Ipv4Addr,
    /// First-hop router toward the destination
    pub via: Ipv4Addr,
}

/// Vertices of the shortest-path graph: routers and transit networks
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Node {
    Router(Ipv4Addr),
    Network(Ipv4Addr),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Path {
    cost: u32,
    hops: u32,
    /// Address of the first-hop interface out of the root, if any
    next_hop: Option<Ipv4Addr>,
    /// Router-id of the first hop, for deterministic tie-breaks
    via: Ipv4Addr,
}

/// Shortest-path-first computation over the link-state database,
/// rooted at this router [RFC 2328 16.1]. Deterministic for a given
/// database regardless of LSA arrival order.
pub fn compute(lsdb: &Lsdb, root_id: Ipv4Addr) -> Vec<SpfRoute> {
    let graph = build_graph(lsdb);
    if !graph.contains_key(&Node::Router(root_id)) {
        trace!("No self-originated router LSA yet, skipping SPF");
        return vec![];
    }

    let mut best: HashMap<Node, Path> = HashMap::with_capacity(graph.len());
    let mut queue: BinaryHeap<Reverse<(u32, u32, Ipv4Addr, Node)>> = BinaryHeap::new();
    best.insert(
        Node::Router(root_id),
        Path {
            cost: 0,
            hops: 0,
            next_hop: None,
            via: root_id,
        },
    );
    queue.push(Reverse((0, 0, root_id, Node::Router(root_id))));

    while let Some(Reverse((cost, hops, via, node))) = queue.pop() {
        let current = match best.get(&node) {
            Some(path) if (path.cost, path.hops, path.via) == (cost, hops, via) => *path,
            _ => continue, // Superseded queue entry
        };
        let Some(edges) = graph.get(&node) else {
            continue;
        };
        for edge in edges {
            let candidate = Path {
                cost: current.cost + edge.cost,
                hops: current.hops + 1,
                next_hop: current.next_hop.or(edge.address),
                // The first router crossed after the root breaks cost ties
                via: if current.via == root_id {
                    match edge.to {
                        Node::Router(id) => id,
                        Node::Network(_) => root_id,
                    }
                } else {
                    current.via
                },
            };
            let improves = match best.get(&edge.to) {
                None => true,
                Some(existing) => {
                    (candidate.cost, candidate.hops, candidate.via)
                        < (existing.cost, existing.hops, existing.via)
                }
            };
            if improves {
                best.insert(edge.to, candidate);
                queue.push(Reverse((
                    candidate.cost,
                    candidate.hops,
                    candidate.via,
                    edge.to,
                )));
            }
        }
    }

    emit_routes(lsdb, root_id, &best)
}

struct Edge {
    to: Node,
    cost: u32,
    /// Remote interface address usable as a next-hop from the root side
    address: Option<Ipv4Addr>,
}

fn build_graph(lsdb: &Lsdb) -> HashMap<Node, Vec<Edge>> {
    let mut graph: HashMap<Node, Vec<Edge>> = HashMap::new();

    // Interface address each router uses toward a given neighbor/network,
    // pulled from its own Router LSA
    let mut router_addr_on_network: HashMap<(Ipv4Addr, Ipv4Addr), Ipv4Addr> = HashMap::new();
    let mut router_addr_toward: HashMap<(Ipv4Addr, Ipv4Addr), Ipv4Addr> = HashMap::new();
    for lsa in lsdb.iter() {
        if let LsaBody::Router { links, .. } = &lsa.body {
            let router = lsa.header.advertising_router;
            for link in links {
                match link.kind {
                    LinkKind::Transit => {
                        router_addr_on_network.insert((router, link.id), link.data);
                    }
                    LinkKind::PointToPoint => {
                        router_addr_toward.insert((router, link.id), link.data);
                    }
                    _ => (),
                }
            }
        }
    }

    for lsa in lsdb.iter() {
        match &lsa.body {
            LsaBody::Router { links, .. } => {
                let router = lsa.header.advertising_router;
                for link in links {
                    match link.kind {
                        LinkKind::PointToPoint => {
                            // Only bidirectional adjacencies enter the graph
                            let Some(remote_addr) = router_addr_toward.get(&(link.id, router))
                            else {
                                continue;
                            };
                            graph.entry(Node::Router(router)).or_default().push(Edge {
                                to: Node::Router(link.id),
                                cost: u32::from(link.metric),
                                address: Some(*remote_addr),
                            });
                        }
                        LinkKind::Transit => {
                            graph.entry(Node::Router(router)).or_default().push(Edge {
                                to: Node::Network(link.id),
                                cost: u32::from(link.metric),
                                address: None,
                            });
                        }
                        LinkKind::Stub | LinkKind::Virtual => (),
                    }
                }
            }
            LsaBody::Network { attached, .. } => {
                let network = lsa.header.id;
                for router in attached {
                    let Some(addr) = router_addr_on_network.get(&(*router, network)) else {
                        warn!(
                            "Network LSA {} lists {} without a matching transit link",
                            network, router
                        );
                        continue;
                    };
                    graph.entry(Node::Network(network)).or_default().push(Edge {
                        to: Node::Router(*router),
                        cost: 0,
                        address: Some(*addr),
                    });
                }
            }
            _ => (),
        }
    }
    graph
}

fn emit_routes(
    lsdb: &Lsdb,
    root_id: Ipv4Addr,
    best: &HashMap<Node, Path>,
) -> Vec<SpfRoute> {
    let mut routes: HashMap<Ipv4Network, SpfRoute> = HashMap::new();
    let mut offer = |prefix: Ipv4Network, cost: u32, path: &Path| {
        let Some(next_hop) = path.next_hop else {
            // Directly attached; the connected route covers it
            return;
        };
        let route = SpfRoute {
            prefix,
            cost,
            next_hop,
            via: path.via,
        };
        routes
            .entry(prefix)
            .and_modify(|existing| {
                if (cost, path.via) < (existing.cost, existing.via) {
                    *existing = route.clone();
                }
            })
            .or_insert(route);
    };

    for lsa in lsdb.iter() {
        match &lsa.body {
            LsaBody::Router { links, .. } => {
                let router = lsa.header.advertising_router;
                let Some(path) = best.get(&Node::Router(router)) else {
                    continue;
                };
                for link in links {
                    if link.kind == LinkKind::Stub {
                        let Ok(prefix) = network_from_mask(link.id, link.data) else {
                            continue;
                        };
                        offer(prefix, path.cost + u32::from(link.metric), path);
                    }
                }
            }
            LsaBody::Network { mask, .. } => {
                let Some(path) = best.get(&Node::Network(lsa.header.id)) else {
                    continue;
                };
                let Ok(prefix) = network_from_mask(lsa.header.id, *mask) else {
                    continue;
                };
                offer(prefix, path.cost, path);
            }
            _ => (),
        }
    }

    let mut routes: Vec<SpfRoute> = routes.into_values().collect();
    routes.sort_by_key(|route| (route.prefix.network(), route.prefix.prefix()));
    routes
}

fn network_from_mask(addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Ipv4Network, ipnetwork::IpNetworkError> {
    let network = Ipv4Addr::from(u32::from(addr) & u32::from(mask));
    Ipv4Network::with_netmask(network, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ospf::lsa::{Lsa, LsaBody, RouterLink, INITIAL_SEQUENCE};

    fn router_id(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, n)
    }

    fn p2p_link(neighbor: Ipv4Addr, local_addr: Ipv4Addr, metric: u16) -> RouterLink {
        RouterLink {
            id: neighbor,
            data: local_addr,
            kind: LinkKind::PointToPoint,
            metric,
        }
    }

    fn stub_link(network: &str, mask: &str, metric: u16) -> RouterLink {
        RouterLink {
            id: network.parse().unwrap(),
            data: mask.parse().unwrap(),
            kind: LinkKind::Stub,
            metric,
        }
    }

    fn router_lsa(id: Ipv4Addr, links: Vec<RouterLink>) -> Lsa {
        Lsa::new(
            1,
            0x02,
            id,
            id,
            INITIAL_SEQUENCE,
            LsaBody::Router { flags: 0, links },
        )
    }

    /// Two routers on a /30, each with a /32 loopback stub
    fn two_router_lsdb() -> Lsdb {
        let mut lsdb = Lsdb::new();
        let (r1, r2) = (router_id(1), router_id(2));
        let (a1, a2) = (
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(192, 0, 2, 2),
        );
        lsdb.install(router_lsa(
            r1,
            vec![
                p2p_link(r2, a1, 10),
                stub_link("10.0.0.1", "255.255.255.255", 0),
            ],
        ));
        lsdb.install(router_lsa(
            r2,
            vec![
                p2p_link(r1, a2, 10),
                stub_link("10.0.0.2", "255.255.255.255", 0),
            ],
        ));
        lsdb
    }

    #[test]
    fn test_p2p_stub_route() {
        let routes = compute(&two_router_lsdb(), router_id(1));
        let loopback: Ipv4Network = "10.0.0.2/32".parse().unwrap();
        let route = routes
            .iter()
            .find(|route| route.prefix == loopback)
            .expect("Remote loopback reachable");
        assert_eq!(route.cost, 10);
        assert_eq!(route.next_hop, Ipv4Addr::new(192, 0, 2, 2));
        assert_eq!(route.via, router_id(2));
    }

    #[test]
    fn test_own_stub_not_emitted() {
        let routes = compute(&two_router_lsdb(), router_id(1));
        let own: Ipv4Network = "10.0.0.1/32".parse().unwrap();
        assert!(routes.iter().all(|route| route.prefix != own));
    }

    #[test]
    fn test_deterministic_regardless_of_install_order() {
        let mut forward = Lsdb::new();
        let mut reverse = Lsdb::new();
        let lsas: Vec<Lsa> = two_router_lsdb().iter().cloned().collect();
        for lsa in &lsas {
            forward.install(lsa.clone());
        }
        for lsa in lsas.iter().rev() {
            reverse.install(lsa.clone());
        }
        assert_eq!(compute(&forward, router_id(1)), compute(&reverse, router_id(1)));
    }

    #[test]
    fn test_unidirectional_link_excluded() {
        let mut lsdb = Lsdb::new();
        // R1 claims a link to R2, but R2 has no link back
        lsdb.install(router_lsa(
            router_id(1),
            vec![p2p_link(router_id(2), Ipv4Addr::new(192, 0, 2, 1), 10)],
        ));
        lsdb.install(router_lsa(
            router_id(2),
            vec![stub_link("10.0.0.2", "255.255.255.255", 0)],
        ));
        let routes = compute(&lsdb, router_id(1));
        assert!(routes.is_empty());
    }

    #[test]
    fn test_transit_network_route() {
        let mut lsdb = Lsdb::new();
        let (r1, r2) = (router_id(1), router_id(2));
        let dr_addr = Ipv4Addr::new(192, 0, 2, 2);
        let transit = |local: Ipv4Addr| RouterLink {
            id: dr_addr,
            data: local,
            kind: LinkKind::Transit,
            metric: 10,
        };
        lsdb.install(router_lsa(r1, vec![transit(Ipv4Addr::new(192, 0, 2, 1))]));
        lsdb.install(router_lsa(
            r2,
            vec![
                transit(dr_addr),
                stub_link("10.0.0.2", "255.255.255.255", 5),
            ],
        ));
        lsdb.install(Lsa::new(
            1,
            0x02,
            dr_addr,
            r2,
            INITIAL_SEQUENCE,
            LsaBody::Network {
                mask: Ipv4Addr::new(255, 255, 255, 0),
                attached: vec![r1, r2],
            },
        ));

        let routes = compute(&lsdb, r1);
        let loopback: Ipv4Network = "10.0.0.2/32".parse().unwrap();
        let route = routes
            .iter()
            .find(|route| route.prefix == loopback)
            .expect("Loopback via transit network");
        assert_eq!(route.cost, 15);
        assert_eq!(route.next_hop, dr_addr);
    }

    #[test]
    fn test_cost_tie_prefers_lower_router_id() {
        let mut lsdb = Lsdb::new();
        let (r1, r2, r3, r4) = (router_id(1), router_id(2), router_id(3), router_id(4));
        // Diamond: r1 -> {r2, r3} -> r4, equal costs everywhere
        lsdb.install(router_lsa(
            r1,
            vec![
                p2p_link(r2, Ipv4Addr::new(192, 0, 2, 1), 10),
                p2p_link(r3, Ipv4Addr::new(192, 0, 2, 5), 10),
            ],
        ));
        lsdb.install(router_lsa(
            r2,
            vec![
                p2p_link(r1, Ipv4Addr::new(192, 0, 2, 2), 10),
                p2p_link(r4, Ipv4Addr::new(192, 0, 2, 9), 10),
            ],
        ));
        lsdb.install(router_lsa(
            r3,
            vec![
                p2p_link(r1, Ipv4Addr::new(192, 0, 2, 6), 10),
                p2p_link(r4, Ipv4Addr::new(192, 0, 2, 13), 10),
            ],
        ));
        lsdb.install(router_lsa(
            r4,
            vec![
                p2p_link(r2, Ipv4Addr::new(192, 0, 2, 10), 10),
                p2p_link(r3, Ipv4Addr::new(192, 0, 2, 14), 10),
                stub_link("10.0.0.4", "255.255.255.255", 0),
            ],
        ));

        let routes = compute(&lsdb, r1);
        let loopback: Ipv4Network = "10.0.0.4/32".parse().unwrap();
        let route = routes.iter().find(|route| route.prefix == loopback).unwrap();
        // Both paths cost 20; the one through r2 (lower router-id) wins
        assert_eq!(route.cost, 20);
        assert_eq!(route.next_hop, Ipv4Addr::new(192, 0, 2, 2));
    }
}
