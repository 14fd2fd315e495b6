use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::Arc;

use log::trace;

use super::{BgpRoute, RouteSource};

/// Default LOCAL_PREF when a route carries none [RFC 4271 9.1.1]
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// View into the IGP used to qualify and rank next-hops
pub trait NextHopResolver {
    /// IGP cost to the next-hop; None when it is unreachable
    fn resolve(&self, next_hop: IpAddr) -> Option<u32>;
}

/// Resolver that considers every next-hop reachable at equal cost
pub struct ResolveAll;

impl NextHopResolver for ResolveAll {
    fn resolve(&self, _next_hop: IpAddr) -> Option<u32> {
        Some(0)
    }
}

/// Select the best route among the candidates for one prefix.
/// Candidates with unresolvable next-hops are discarded up front; the
/// rest are ranked by the nine-step decision [RFC 4271 9.1.2].
pub fn best_route(
    candidates: &[Arc<BgpRoute>],
    resolver: &dyn NextHopResolver,
) -> Option<Arc<BgpRoute>> {
    let mut viable: Vec<&Arc<BgpRoute>> = candidates
        .iter()
        .filter(|route| {
            let reachable = route.source == RouteSource::Local
                || resolver.resolve(route.attributes.next_hop).is_some();
            if !reachable {
                trace!(
                    "{}: next-hop {} unresolvable, not a candidate",
                    route.prefix,
                    route.attributes.next_hop
                );
            }
            reachable
        })
        .collect();
    viable.sort_by(|a, b| compare(a, b, resolver));
    viable.first().map(|route| Arc::clone(route))
}

/// Total order over candidate routes; `Less` means preferred
fn compare(a: &BgpRoute, b: &BgpRoute, resolver: &dyn NextHopResolver) -> Ordering {
    // (a) higher LOCAL_PREF
    let local_pref = |route: &BgpRoute| route.attributes.local_pref.unwrap_or(DEFAULT_LOCAL_PREF);
    match local_pref(b).cmp(&local_pref(a)) {
        Ordering::Equal => (),
        decided => return decided,
    }
    // (b) shorter AS_PATH (an AS_SET counts as one)
    match a
        .attributes
        .as_path
        .length()
        .cmp(&b.attributes.as_path.length())
    {
        Ordering::Equal => (),
        decided => return decided,
    }
    // (c) lower ORIGIN (IGP < EGP < INCOMPLETE)
    match a
        .attributes
        .origin
        .code()
        .cmp(&b.attributes.origin.code())
    {
        Ordering::Equal => (),
        decided => return decided,
    }
    // (d) lower MED, comparable only within the same neighboring AS
    let neighbor_as = |route: &BgpRoute| {
        route
            .attributes
            .as_path
            .first_asn()
            .unwrap_or(route.peer_asn)
    };
    if neighbor_as(a) == neighbor_as(b) {
        let med = |route: &BgpRoute| route.attributes.med.unwrap_or(0);
        match med(a).cmp(&med(b)) {
            Ordering::Equal => (),
            decided => return decided,
        }
    }
    // (e) eBGP-learned beats iBGP-learned (local origination first of all)
    let source_rank = |route: &BgpRoute| match route.source {
        RouteSource::Local => 0u8,
        RouteSource::Ebgp => 1,
        RouteSource::Ibgp { .. } => 2,
    };
    match source_rank(a).cmp(&source_rank(b)) {
        Ordering::Equal => (),
        decided => return decided,
    }
    // (f) lower IGP cost to next-hop; unknown costs tie
    let igp_cost = |route: &BgpRoute| resolver.resolve(route.attributes.next_hop);
    if let (Some(cost_a), Some(cost_b)) = (igp_cost(a), igp_cost(b)) {
        match cost_a.cmp(&cost_b) {
            Ordering::Equal => (),
            decided => return decided,
        }
    }
    // (g) oldest route
    match a.received_at.cmp(&b.received_at) {
        Ordering::Equal => (),
        decided => return decided,
    }
    // (h) lower BGP identifier
    match a.peer_id.cmp(&b.peer_id) {
        Ordering::Equal => (),
        decided => return decided,
    }
    // (i) lower peer address
    a.peer_ip.cmp(&b.peer_ip)
}
