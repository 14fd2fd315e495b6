pub mod decision;
pub mod export;
pub mod reflect;

pub use decision::{best_route, NextHopResolver, ResolveAll};
pub use export::{export_route, ExportedRoute};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::debug;

use crate::bgp::attributes::{MpReach, PathAttribute};
use crate::bgp::{Afi, AsPath, CommunityList, Family, Origin, Update};

/// RPKI origin-validation state of a route
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationState {
    Valid,
    Invalid,
    NotFound,
    Unverified,
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationState::Valid => write!(f, "valid"),
            ValidationState::Invalid => write!(f, "invalid"),
            ValidationState::NotFound => write!(f, "not-found"),
            ValidationState::Unverified => write!(f, "unverified"),
        }
    }
}

/// Where a route entered this speaker
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteSource {
    Ebgp,
    Ibgp { client: bool },
    /// Locally originated (static/config routes)
    Local,
}

impl RouteSource {
    pub fn is_internal(&self) -> bool {
        matches!(self, RouteSource::Ibgp { .. })
    }

    pub fn is_client(&self) -> bool {
        matches!(self, RouteSource::Ibgp { client: true })
    }
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouteSource::Ebgp => write!(f, "eBGP"),
            RouteSource::Ibgp { client: true } => write!(f, "iBGP-client"),
            RouteSource::Ibgp { client: false } => write!(f, "iBGP"),
            RouteSource::Local => write!(f, "local"),
        }
    }
}

/// Decision-friendly view of a route's path attributes
#[derive(Clone, Debug, PartialEq)]
pub struct RouteAttributes {
    pub origin: Origin,
    pub as_path: AsPath,
    pub next_hop: IpAddr,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u32, Ipv4Addr)>,
    pub communities: CommunityList,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Vec<Ipv4Addr>,
}

impl RouteAttributes {
    /// Collect from decoded UPDATE attributes; `mp_next_hop` overrides the
    /// NEXT_HOP attribute for MP announcements
    pub fn from_update(update: &Update, mp_next_hop: Option<IpAddr>) -> Option<Self> {
        let mut origin = None;
        let mut as_path = None;
        let mut next_hop = mp_next_hop;
        let mut local_pref = None;
        let mut med = None;
        let mut atomic_aggregate = false;
        let mut aggregator = None;
        let mut communities = CommunityList::default();
        let mut originator_id = None;
        let mut cluster_list = vec![];
        for attribute in &update.attributes {
            match attribute {
                PathAttribute::Origin(value) => origin = Some(*value),
                PathAttribute::AsPath(value) => as_path = Some(value.clone()),
                PathAttribute::NextHop(value) => {
                    if next_hop.is_none() {
                        next_hop = Some(IpAddr::V4(*value));
                    }
                }
                PathAttribute::LocalPref(value) => local_pref = Some(*value),
                PathAttribute::MultiExitDisc(value) => med = Some(*value),
                PathAttribute::AtomicAggregate => atomic_aggregate = true,
                PathAttribute::Aggregator { asn, speaker } => {
                    aggregator = Some((*asn, *speaker))
                }
                PathAttribute::Communities(value) => {
                    communities = CommunityList(value.clone())
                }
                PathAttribute::OriginatorId(value) => originator_id = Some(*value),
                PathAttribute::ClusterList(value) => cluster_list = value.clone(),
                PathAttribute::MpReachNlri(_)
                | PathAttribute::MpUnreachNlri(_)
                | PathAttribute::Unrecognized { .. } => (),
            }
        }
        Some(RouteAttributes {
            origin: origin?,
            as_path: as_path?,
            next_hop: next_hop?,
            local_pref,
            med,
            atomic_aggregate,
            aggregator,
            communities,
            originator_id,
            cluster_list,
        })
    }

    /// Rebuild wire attributes for advertisement. IPv4 unicast carries
    /// NEXT_HOP inline; IPv6 prefixes ride in MP_REACH_NLRI.
    pub fn to_path_attributes(&self, family: Family, nlri: Vec<IpNetwork>) -> Vec<PathAttribute> {
        let mut attributes = Vec::with_capacity(6);
        attributes.push(PathAttribute::Origin(self.origin));
        attributes.push(PathAttribute::AsPath(self.as_path.clone()));
        match (family.afi, self.next_hop) {
            (Afi::Ipv4, IpAddr::V4(next_hop)) => {
                attributes.push(PathAttribute::NextHop(next_hop));
            }
            _ => {
                attributes.push(PathAttribute::MpReachNlri(MpReach {
                    family,
                    next_hop: self.next_hop,
                    link_local: None,
                    nlri,
                }));
            }
        }
        if let Some(local_pref) = self.local_pref {
            attributes.push(PathAttribute::LocalPref(local_pref));
        }
        if let Some(med) = self.med {
            attributes.push(PathAttribute::MultiExitDisc(med));
        }
        if self.atomic_aggregate {
            attributes.push(PathAttribute::AtomicAggregate);
        }
        if let Some((asn, speaker)) = self.aggregator {
            attributes.push(PathAttribute::Aggregator { asn, speaker });
        }
        if !self.communities.is_empty() {
            attributes.push(PathAttribute::Communities(self.communities.0.clone()));
        }
        if let Some(originator_id) = self.originator_id {
            attributes.push(PathAttribute::OriginatorId(originator_id));
        }
        if !self.cluster_list.is_empty() {
            attributes.push(PathAttribute::ClusterList(self.cluster_list.clone()));
        }
        attributes
    }
}

/// A route held in an Adj-RIB-In (and referenced from the Loc-RIB when best)
#[derive(Clone, Debug)]
pub struct BgpRoute {
    pub prefix: IpNetwork,
    pub family: Family,
    pub attributes: Arc<RouteAttributes>,
    pub source: RouteSource,
    /// Router-id learned from the peer's OPEN (unspecified for local routes)
    pub peer_id: Ipv4Addr,
    pub peer_ip: IpAddr,
    pub peer_asn: u32,
    pub received_at: DateTime<Utc>,
    pub validation: ValidationState,
    /// Held across a peer's graceful restart window
    pub stale: bool,
}

impl fmt::Display for BgpRoute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Route {} from {} [{}] next-hop={}>",
            self.prefix, self.peer_ip, self.source, self.attributes.next_hop
        )
    }
}

/// Loc-RIB delta produced by a decision run
#[derive(Clone, Debug)]
pub struct RibChange {
    pub prefix: IpNetwork,
    pub previous: Option<Arc<BgpRoute>>,
    pub current: Option<Arc<BgpRoute>>,
}

/// The three-stage RIB: per-peer Adj-RIB-In, the shared Loc-RIB, and
/// per-peer Adj-RIB-Out. Only the decision process writes the Loc-RIB.
#[derive(Debug, Default)]
pub struct Rib {
    adj_in: HashMap<IpAddr, HashMap<IpNetwork, Arc<BgpRoute>>>,
    loc: HashMap<IpNetwork, Arc<BgpRoute>>,
    adj_out: HashMap<IpAddr, HashMap<IpNetwork, Arc<RouteAttributes>>>,
    /// Locally originated routes, always decision candidates
    local: HashMap<IpNetwork, Arc<BgpRoute>>,
    /// Prefixes whose candidates changed since the last decision run
    dirty: HashSet<IpNetwork>,
}

impl Rib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the peer's previous announcement for this prefix
    pub fn insert_from_peer(&mut self, route: BgpRoute) {
        self.dirty.insert(route.prefix);
        self.adj_in
            .entry(route.peer_ip)
            .or_default()
            .insert(route.prefix, Arc::new(route));
    }

    /// Process an explicit withdraw from a peer
    pub fn withdraw_from_peer(&mut self, peer_ip: IpAddr, prefix: IpNetwork) {
        if let Some(routes) = self.adj_in.get_mut(&peer_ip) {
            if routes.remove(&prefix).is_some() {
                self.dirty.insert(prefix);
            }
        }
    }

    /// Session loss: purge the whole Adj-RIB-In (and Adj-RIB-Out) for a peer
    pub fn remove_peer(&mut self, peer_ip: IpAddr) {
        if let Some(routes) = self.adj_in.remove(&peer_ip) {
            debug!("Removed {} routes from Adj-RIB-In for {}", routes.len(), peer_ip);
            self.dirty.extend(routes.keys().copied());
        }
        self.adj_out.remove(&peer_ip);
    }

    /// Graceful restart: keep the peer's routes but mark them stale
    pub fn mark_peer_stale(&mut self, peer_ip: IpAddr) {
        if let Some(routes) = self.adj_in.get_mut(&peer_ip) {
            for route in routes.values_mut() {
                let mut updated = BgpRoute::clone(route);
                updated.stale = true;
                *route = Arc::new(updated);
            }
            debug!("Marked {} routes stale for {}", routes.len(), peer_ip);
        }
        self.adj_out.remove(&peer_ip);
    }

    /// Drop whatever is still stale (restart window over, or EoR received)
    pub fn sweep_stale(&mut self, peer_ip: IpAddr) -> usize {
        let mut swept = 0;
        if let Some(routes) = self.adj_in.get_mut(&peer_ip) {
            let stale: Vec<IpNetwork> = routes
                .iter()
                .filter(|(_, route)| route.stale)
                .map(|(prefix, _)| *prefix)
                .collect();
            for prefix in stale {
                routes.remove(&prefix);
                self.dirty.insert(prefix);
                swept += 1;
            }
        }
        swept
    }

    pub fn insert_local(&mut self, route: BgpRoute) {
        self.dirty.insert(route.prefix);
        self.local.insert(route.prefix, Arc::new(route));
    }

    /// Queue every known prefix for re-selection (IGP topology moved,
    /// so next-hop reachability and costs may have changed)
    pub fn mark_all_dirty(&mut self) {
        let prefixes: Vec<IpNetwork> = self
            .adj_in
            .values()
            .flat_map(|routes| routes.keys().copied())
            .chain(self.local.keys().copied())
            .chain(self.loc.keys().copied())
            .collect();
        self.dirty.extend(prefixes);
    }

    /// All candidates for a prefix across every Adj-RIB-In plus local routes
    pub fn candidates(&self, prefix: &IpNetwork) -> Vec<Arc<BgpRoute>> {
        self.adj_in
            .values()
            .filter_map(|routes| routes.get(prefix))
            .chain(self.local.get(prefix))
            .cloned()
            .collect()
    }

    /// Re-run best-path selection for every dirty prefix [RFC 4271 9.1.2]
    pub fn run_decision(&mut self, resolver: &dyn NextHopResolver) -> Vec<RibChange> {
        let dirty: Vec<IpNetwork> = self.dirty.drain().collect();
        let mut changes = Vec::new();
        for prefix in dirty {
            let candidates = self.candidates(&prefix);
            let best = best_route(&candidates, resolver);
            let previous = self.loc.get(&prefix).cloned();
            let changed = match (&previous, &best) {
                (None, None) => false,
                (Some(previous), Some(best)) => !Arc::ptr_eq(previous, best),
                _ => true,
            };
            if !changed {
                continue;
            }
            match &best {
                Some(route) => {
                    self.loc.insert(prefix, Arc::clone(route));
                }
                None => {
                    self.loc.remove(&prefix);
                }
            }
            changes.push(RibChange {
                prefix,
                previous,
                current: best,
            });
        }
        changes
    }

    pub fn loc_rib(&self) -> &HashMap<IpNetwork, Arc<BgpRoute>> {
        &self.loc
    }

    pub fn best(&self, prefix: &IpNetwork) -> Option<&Arc<BgpRoute>> {
        self.loc.get(prefix)
    }

    pub fn routes_from_peer(&self, peer_ip: IpAddr) -> Vec<Arc<BgpRoute>> {
        self.adj_in
            .get(&peer_ip)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn adj_in_size(&self, peer_ip: IpAddr) -> usize {
        self.adj_in.get(&peer_ip).map(HashMap::len).unwrap_or(0)
    }

    pub fn adj_out_size(&self, peer_ip: IpAddr) -> usize {
        self.adj_out.get(&peer_ip).map(HashMap::len).unwrap_or(0)
    }

    /// What was last advertised to this peer for the prefix
    pub fn advertised(&self, peer_ip: IpAddr, prefix: &IpNetwork) -> Option<&Arc<RouteAttributes>> {
        self.adj_out.get(&peer_ip)?.get(prefix)
    }

    pub fn record_advertised(
        &mut self,
        peer_ip: IpAddr,
        prefix: IpNetwork,
        attributes: Arc<RouteAttributes>,
    ) {
        self.adj_out
            .entry(peer_ip)
            .or_default()
            .insert(prefix, attributes);
    }

    pub fn record_withdrawn(&mut self, peer_ip: IpAddr, prefix: &IpNetwork) {
        if let Some(routes) = self.adj_out.get_mut(&peer_ip) {
            routes.remove(prefix);
        }
    }

    pub fn advertised_routes(&self, peer_ip: IpAddr) -> Vec<(IpNetwork, Arc<RouteAttributes>)> {
        self.adj_out
            .get(&peer_ip)
            .map(|routes| {
                routes
                    .iter()
                    .map(|(prefix, attributes)| (*prefix, Arc::clone(attributes)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.loc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loc.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::Origin;

    pub(crate) fn route(
        prefix: &str,
        peer_ip: &str,
        as_path: Vec<u32>,
        local_pref: Option<u32>,
    ) -> BgpRoute {
        BgpRoute {
            prefix: prefix.parse().unwrap(),
            family: Family::ipv4_unicast(),
            attributes: Arc::new(RouteAttributes {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(as_path),
                next_hop: "192.0.2.2".parse().unwrap(),
                local_pref,
                med: None,
                atomic_aggregate: false,
                aggregator: None,
                communities: CommunityList::default(),
                originator_id: None,
                cluster_list: vec![],
            }),
            source: RouteSource::Ebgp,
            peer_id: "10.0.0.2".parse().unwrap(),
            peer_ip: peer_ip.parse().unwrap(),
            peer_asn: 65002,
            received_at: Utc::now(),
            validation: ValidationState::Unverified,
            stale: false,
        }
    }

    #[test]
    fn test_announce_then_withdraw_clears_loc_rib() {
        let mut rib = Rib::new();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        let changes = rib.run_decision(&ResolveAll);
        assert_eq!(changes.len(), 1);
        assert!(rib.best(&prefix).is_some());

        rib.withdraw_from_peer("192.0.2.2".parse().unwrap(), prefix);
        let changes = rib.run_decision(&ResolveAll);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].current.is_none());
        assert!(rib.best(&prefix).is_none());
    }

    #[test]
    fn test_decision_is_idempotent() {
        let mut rib = Rib::new();
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        let first = rib.run_decision(&ResolveAll);
        assert_eq!(first.len(), 1);
        // No intervening input: nothing to do, Loc-RIB unchanged
        let second = rib.run_decision(&ResolveAll);
        assert!(second.is_empty());
    }

    #[test]
    fn test_replacement_announce_updates_entry() {
        let mut rib = Rib::new();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        rib.run_decision(&ResolveAll);
        rib.insert_from_peer(route(
            "203.0.113.0/24",
            "192.0.2.2",
            vec![65002, 65010],
            None,
        ));
        let changes = rib.run_decision(&ResolveAll);
        assert_eq!(changes.len(), 1);
        let best = rib.best(&prefix).unwrap();
        assert_eq!(best.attributes.as_path.length(), 2);
        // Still exactly one entry per prefix
        assert_eq!(rib.len(), 1);
    }

    #[test]
    fn test_remove_peer_retracts_routes() {
        let mut rib = Rib::new();
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        rib.insert_from_peer(route("198.51.100.0/24", "192.0.2.2", vec![65002], None));
        rib.run_decision(&ResolveAll);
        assert_eq!(rib.len(), 2);

        rib.remove_peer("192.0.2.2".parse().unwrap());
        let changes = rib.run_decision(&ResolveAll);
        assert_eq!(changes.len(), 2);
        assert!(rib.is_empty());
    }

    #[test]
    fn test_stale_mark_and_sweep() {
        let mut rib = Rib::new();
        let peer_ip: IpAddr = "192.0.2.2".parse().unwrap();
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        rib.run_decision(&ResolveAll);
        rib.mark_peer_stale(peer_ip);
        // Stale routes remain usable until the window closes
        assert_eq!(rib.run_decision(&ResolveAll).len(), 0);
        assert_eq!(rib.len(), 1);

        // A fresh announcement clears the stale flag by replacement
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        assert_eq!(rib.sweep_stale(peer_ip), 0);

        rib.mark_peer_stale(peer_ip);
        assert_eq!(rib.sweep_stale(peer_ip), 1);
        rib.run_decision(&ResolveAll);
        assert!(rib.is_empty());
    }

    #[test]
    fn test_loc_rib_mandatory_attributes_present() {
        let mut rib = Rib::new();
        rib.insert_from_peer(route("203.0.113.0/24", "192.0.2.2", vec![65002], None));
        rib.run_decision(&ResolveAll);
        for route in rib.loc_rib().values() {
            // ORIGIN and AS_PATH are structurally present; AS_PATH non-empty
            assert!(route.attributes.as_path.length() > 0);
            assert!(!route.attributes.next_hop.is_unspecified());
        }
    }
}
