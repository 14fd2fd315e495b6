use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use log::trace;

use super::{reflect, BgpRoute, RouteAttributes, RouteSource};
use crate::bgp::Family;
use crate::config::PeerConfig;

/// A route that survived export processing for one peer
#[derive(Clone, Debug, PartialEq)]
pub struct ExportedRoute {
    pub prefix: IpNetwork,
    pub family: Family,
    pub attributes: RouteAttributes,
}

/// Run the export pipeline for one Loc-RIB route toward one peer:
/// split horizon, reflection rules, export policy, and the eBGP/iBGP
/// attribute rewrites (NEXT_HOP, LOCAL_PREF, AS_PATH prepend).
pub fn export_route(
    route: &BgpRoute,
    peer: &PeerConfig,
    session_addr: IpAddr,
    local_addr: IpAddr,
    cluster_id: Option<Ipv4Addr>,
) -> Option<ExportedRoute> {
    // Never echo a route to the peer that announced it
    if route.peer_ip == session_addr {
        return None;
    }
    if !peer.families.contains(&route.family) {
        return None;
    }
    let target_is_internal = !peer.is_ebgp();
    if !reflect::should_advertise(
        route.source,
        target_is_internal,
        peer.client,
        cluster_id.is_some(),
    ) {
        trace!(
            "{} not advertised to {} (source {}, split horizon/reflection)",
            route.prefix,
            peer.remote_ip,
            route.source
        );
        return None;
    }

    let mut attributes = peer
        .export_policy
        .evaluate(&route.prefix, &route.attributes)?;

    if peer.is_ebgp() {
        attributes.as_path.prepend(peer.local_as, 1);
        // eBGP next-hop-self; LOCAL_PREF and reflection attributes are
        // iBGP-internal and do not cross the AS boundary
        attributes.next_hop = local_addr;
        attributes.local_pref = None;
        attributes.originator_id = None;
        attributes.cluster_list = vec![];
    } else {
        if attributes.local_pref.is_none() {
            attributes.local_pref = Some(crate::rib::decision::DEFAULT_LOCAL_PREF);
        }
        // Reflecting an internal route: stamp loop-prevention attributes
        if let (RouteSource::Ibgp { .. }, Some(cluster_id)) = (route.source, cluster_id) {
            reflect::apply_reflection(&mut attributes, route.peer_id, cluster_id);
        }
    }

    Some(ExportedRoute {
        prefix: route.prefix,
        family: route.family,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::bgp::{AsPath, CommunityList, Origin};
    use crate::policy::Policy;
    use crate::rib::ValidationState;

    fn peer(remote_as: u32, client: bool) -> PeerConfig {
        PeerConfig {
            remote_ip: "192.0.2.3/32".parse().unwrap(),
            remote_as,
            local_as: 65001,
            local_router_id: "10.0.1.1".parse().unwrap(),
            enabled: true,
            passive: false,
            client,
            hold_timer: 180,
            dest_port: 179,
            families: vec![Family::ipv4_unicast(), Family::ipv6_unicast()],
            import_policy: Policy::permit_all(),
            export_policy: Policy::permit_all(),
        }
    }

    fn route(source: RouteSource) -> BgpRoute {
        BgpRoute {
            prefix: "203.0.113.0/24".parse().unwrap(),
            family: Family::ipv4_unicast(),
            attributes: Arc::new(RouteAttributes {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(vec![65002]),
                next_hop: "192.0.2.2".parse().unwrap(),
                local_pref: Some(100),
                med: None,
                atomic_aggregate: false,
                aggregator: None,
                communities: CommunityList::default(),
                originator_id: None,
                cluster_list: vec![],
            }),
            source,
            peer_id: "10.0.0.2".parse().unwrap(),
            peer_ip: "192.0.2.2".parse().unwrap(),
            peer_asn: 65002,
            received_at: Utc::now(),
            validation: ValidationState::Unverified,
            stale: false,
        }
    }

    const SESSION: &str = "192.0.2.3";
    const LOCAL: &str = "192.0.2.1";

    fn export(route: &BgpRoute, peer: &PeerConfig, cluster_id: Option<&str>) -> Option<ExportedRoute> {
        export_route(
            route,
            peer,
            SESSION.parse().unwrap(),
            LOCAL.parse().unwrap(),
            cluster_id.map(|id| id.parse().unwrap()),
        )
    }

    #[test]
    fn test_ebgp_export_rewrites_next_hop_and_prepends() {
        let exported = export(&route(RouteSource::Ebgp), &peer(65003, false), None).unwrap();
        assert_eq!(exported.attributes.next_hop, LOCAL.parse::<IpAddr>().unwrap());
        assert_eq!(exported.attributes.as_path.length(), 2);
        assert_eq!(exported.attributes.as_path.first_asn(), Some(65001));
        // LOCAL_PREF does not cross the AS boundary
        assert_eq!(exported.attributes.local_pref, None);
    }

    #[test]
    fn test_ibgp_export_preserves_next_hop_and_path() {
        let exported = export(&route(RouteSource::Ebgp), &peer(65001, false), None).unwrap();
        assert_eq!(
            exported.attributes.next_hop,
            "192.0.2.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(exported.attributes.as_path.length(), 1);
        assert_eq!(exported.attributes.local_pref, Some(100));
    }

    #[test]
    fn test_no_echo_to_announcing_peer() {
        let mut echo = route(RouteSource::Ebgp);
        echo.peer_ip = SESSION.parse().unwrap();
        assert!(export(&echo, &peer(65003, false), None).is_none());
    }

    #[test]
    fn test_ibgp_split_horizon_without_reflector() {
        let internal = route(RouteSource::Ibgp { client: false });
        assert!(export(&internal, &peer(65001, false), None).is_none());
        // The same route goes out fine to an eBGP peer
        assert!(export(&internal, &peer(65003, false), None).is_some());
    }

    #[test]
    fn test_reflection_adds_originator_and_cluster_list() {
        let from_client = route(RouteSource::Ibgp { client: true });
        let exported = export(&from_client, &peer(65001, false), Some("10.0.0.1")).unwrap();
        assert_eq!(
            exported.attributes.originator_id,
            Some("10.0.0.2".parse().unwrap())
        );
        assert_eq!(
            exported.attributes.cluster_list,
            vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[test]
    fn test_reflection_attributes_stripped_on_ebgp_export() {
        let from_client = route(RouteSource::Ibgp { client: true });
        let exported = export(&from_client, &peer(65003, false), Some("10.0.0.1")).unwrap();
        assert_eq!(exported.attributes.originator_id, None);
        assert!(exported.attributes.cluster_list.is_empty());
    }

    #[test]
    fn test_export_policy_rejection_is_final() {
        let mut rejecting = peer(65003, false);
        rejecting.export_policy = Arc::new(crate::policy::Policy {
            name: "deny".into(),
            rules: vec![],
            default_action: crate::policy::PolicyAction::Reject,
        });
        assert!(export(&route(RouteSource::Ebgp), &rejecting, None).is_none());
    }
}
