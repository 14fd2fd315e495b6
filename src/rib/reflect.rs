use std::net::Ipv4Addr;

use log::debug;

use super::{RouteAttributes, RouteSource};

/// Route-reflection advertisement rules [RFC 4456]. `reflector` is set
/// when this speaker is configured with a cluster-id.
///
/// Without reflection, iBGP split horizon applies: internal routes are
/// never re-advertised to internal peers.
pub fn should_advertise(
    source: RouteSource,
    target_is_internal: bool,
    target_is_client: bool,
    reflector: bool,
) -> bool {
    if !target_is_internal {
        // eBGP peers receive everything that survives export policy
        return true;
    }
    match source {
        RouteSource::Ebgp | RouteSource::Local => true,
        RouteSource::Ibgp { client: true } => {
            // From a client: reflect to all other iBGP peers
            reflector
        }
        RouteSource::Ibgp { client: false } => {
            // From a non-client: reflect to clients only
            reflector && target_is_client
        }
    }
}

/// On reflection, stamp ORIGINATOR_ID (if absent) and prepend our
/// cluster-id to CLUSTER_LIST
pub fn apply_reflection(
    attributes: &mut RouteAttributes,
    originator: Ipv4Addr,
    cluster_id: Ipv4Addr,
) {
    if attributes.originator_id.is_none() {
        attributes.originator_id = Some(originator);
    }
    attributes.cluster_list.insert(0, cluster_id);
}

/// Import-side loop check: a route that carries our router-id as
/// ORIGINATOR_ID, or our cluster-id in CLUSTER_LIST, already passed
/// through us and must be discarded
pub fn is_reflection_loop(
    attributes: &RouteAttributes,
    router_id: Ipv4Addr,
    cluster_id: Option<Ipv4Addr>,
) -> bool {
    if attributes.originator_id == Some(router_id) {
        debug!("Reflection loop: ORIGINATOR_ID is our router-id {}", router_id);
        return true;
    }
    if let Some(cluster_id) = cluster_id {
        if attributes.cluster_list.contains(&cluster_id) {
            debug!("Reflection loop: CLUSTER_LIST contains {}", cluster_id);
            return true;
        }
    }
    false
}
