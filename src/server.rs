use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use ipnetwork::IpNetwork;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};

use crate::api::{self, ApiState, SharedState};
use crate::config::ServerConfig;
use crate::features::{Features, RouteControl};
use crate::fib::{FibBackend, FibRoute, Installer, MemoryFib, SourceProtocol};
use crate::ospf::{Instance as OspfInstance, OspfUpdate};
use crate::rib::{reflect, BgpRoute, Rib, RibChange, RouteAttributes, RouteSource, ValidationState};
use crate::session::{manager::family_of, LearnedUpdate, SessionManager, SessionUpdate};

/// Decision process and SPF both coalesce bursty input on this tick
const DEBOUNCE_MS: u64 = 250;
/// Kernel metric for BGP-learned routes
const BGP_METRIC: u32 = 20;
/// API snapshot refresh, in debounce ticks
const SNAPSHOT_EVERY: u32 = 4;

pub async fn serve(
    addr: IpAddr,
    port: u16,
    api_port: u16,
    config: ServerConfig,
) -> Result<(), Box<dyn Error>> {
    let config = Arc::new(config);

    // Loc-RIB with locally originated (static) routes
    let mut rib = Rib::new();
    for static_route in &config.static_routes {
        rib.insert_local(BgpRoute {
            prefix: static_route.prefix,
            family: family_of(&static_route.prefix),
            attributes: Arc::new(static_route.attributes.clone()),
            source: RouteSource::Local,
            peer_id: config.router_id,
            peer_ip: IpAddr::V4(config.router_id),
            peer_asn: config.default_as,
            received_at: Utc::now(),
            validation: ValidationState::Unverified,
            stale: false,
        });
    }

    let mut features = Features::from_config(&config)?;

    // Kernel FIB: netlink where available, in-memory elsewhere
    let backend: Box<dyn FibBackend> = build_backend();
    let mut installer = Installer::new(backend);
    installer.reconcile().await?;
    let connected: Vec<FibRoute> = config
        .ospf
        .interfaces
        .iter()
        .map(|interface| FibRoute {
            prefix: IpNetwork::V4(interface.address),
            next_hop: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            metric: 0,
            source: SourceProtocol::Connected,
        })
        .collect();
    installer
        .sync_source(SourceProtocol::Connected, connected)
        .await;

    // OSPF speaker (single area)
    let mut ospf = if config.ospf.interfaces.is_empty() {
        None
    } else {
        let mut instance = OspfInstance::new(config.router_id, &config.ospf);
        match start_ospf(&mut instance) {
            Ok(()) => Some(instance),
            Err(err) => {
                error!("Could not start OSPF (raw socket): {}", err);
                None
            }
        }
    };

    // BGP listener and session manager
    let socket = SocketAddr::new(addr, port);
    let listener = TcpListener::bind(&socket).await?;
    info!("Starting BGP server on {}...", socket);
    let mut manager = SessionManager::new(Arc::clone(&config), listener);

    // Observable state, copy-out only
    let api_state: SharedState = Arc::new(Mutex::new(ApiState::default()));
    let _api_handle = api::serve(SocketAddr::new(addr, api_port), Arc::clone(&api_state)).await?;

    let mut debounce = interval(Duration::from_millis(DEBOUNCE_MS));
    let mut spf_pending = ospf.is_some();
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            update = manager.get_update(&mut rib) => {
                match update? {
                    Some(SessionUpdate::Learned(learned)) => {
                        handle_learned(&mut rib, &mut features, &config, learned);
                    }
                    Some(SessionUpdate::Established { peer_ip, .. }) => {
                        info!("Peer {} established", peer_ip);
                        features.restart.session_up(peer_ip);
                    }
                    Some(SessionUpdate::EndOfRib { peer_ip }) => {
                        if features.restart.end_of_rib(peer_ip) {
                            let swept = rib.sweep_stale(peer_ip);
                            info!("{} finished restarting; swept {} stale routes", peer_ip, swept);
                        }
                    }
                    Some(SessionUpdate::Refresh { peer_ip, family }) => {
                        debug!("Route refresh from {} for {}", peer_ip, family);
                    }
                    Some(SessionUpdate::Ended(peers)) => {
                        for peer in peers {
                            features.damping.session_down(peer.peer_ip);
                            if peer.graceful {
                                rib.mark_peer_stale(peer.peer_ip);
                                features.restart.session_down(peer.peer_ip, peer.restart_time);
                            } else {
                                rib.remove_peer(peer.peer_ip);
                            }
                        }
                    }
                    None => (),
                }
            }
            result = run_ospf(&mut ospf) => {
                match result {
                    Ok(Some(OspfUpdate::TopologyChanged)) => spf_pending = true,
                    Ok(None) => (),
                    Err(err) => {
                        error!("OSPF error: {}", err);
                        ospf = None;
                    }
                }
            }
            _ = debounce.tick() => {
                // Stale windows that lapsed without the peer returning
                for peer_ip in features.restart.expired() {
                    let swept = rib.sweep_stale(peer_ip);
                    warn!("Restart window for {} lapsed; swept {} stale routes", peer_ip, swept);
                }

                if spf_pending {
                    spf_pending = false;
                    if let Some(instance) = &ospf {
                        let routes: Vec<FibRoute> = instance
                            .compute_routes()
                            .into_iter()
                            .map(|route| FibRoute {
                                prefix: IpNetwork::V4(route.prefix),
                                next_hop: IpAddr::V4(route.next_hop),
                                metric: route.cost,
                                source: SourceProtocol::Ospf,
                            })
                            .collect();
                        debug!("SPF produced {} routes", routes.len());
                        installer.sync_source(SourceProtocol::Ospf, routes).await;
                        // IGP reachability feeds best-path selection
                        rib.mark_all_dirty();
                    }
                }

                let changes = rib.run_decision(&installer);
                if !changes.is_empty() {
                    apply_decision(&mut manager, &mut installer, &changes).await;
                }

                ticks = ticks.wrapping_add(1);
                if ticks % SNAPSHOT_EVERY == 0 {
                    push_snapshot(&api_state, &manager, &rib, &ospf, &installer);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn build_backend() -> Box<dyn FibBackend> {
    #[cfg(target_os = "linux")]
    {
        match crate::fib::netlink::NetlinkFib::new() {
            Ok(netlink) => return Box::new(netlink),
            Err(err) => warn!("Netlink unavailable ({}); using in-memory FIB", err),
        }
    }
    Box::new(MemoryFib::new())
}

#[cfg(unix)]
fn start_ospf(instance: &mut OspfInstance) -> std::io::Result<()> {
    instance.start()
}

#[cfg(not(unix))]
fn start_ospf(_instance: &mut OspfInstance) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "raw sockets unsupported on this platform",
    ))
}

async fn run_ospf(
    ospf: &mut Option<OspfInstance>,
) -> Result<Option<OspfUpdate>, crate::ospf::OspfError> {
    match ospf {
        #[cfg(unix)]
        Some(instance) => instance.run().await,
        _ => futures::future::pending().await,
    }
}

/// Import path for one received UPDATE: withdraws, treat-as-withdraw,
/// loop checks, damping, RPKI, import policy, Adj-RIB-In insertion
fn handle_learned(
    rib: &mut Rib,
    features: &mut Features,
    config: &ServerConfig,
    learned: LearnedUpdate,
) {
    let LearnedUpdate {
        peer_ip,
        peer_id,
        peer_asn,
        config: peer,
        update,
    } = learned;

    let mut withdrawn: Vec<IpNetwork> = update.withdrawn.clone();
    if let Some(mp_unreach) = update.mp_unreach() {
        withdrawn.extend(mp_unreach.withdrawn.iter().copied());
    }

    let mut announced: Vec<(IpNetwork, Option<IpAddr>)> = update
        .announced
        .iter()
        .map(|prefix| (*prefix, None))
        .collect();
    if let Some(mp_reach) = update.mp_reach() {
        announced.extend(
            mp_reach
                .nlri
                .iter()
                .map(|prefix| (*prefix, Some(mp_reach.next_hop))),
        );
    }

    // Treat-as-withdraw: the faulty UPDATE's NLRI goes away, session stays
    if let Some(err) = &update.malformed {
        warn!(
            "UPDATE from {} treated as withdraw ({} prefixes): {}",
            peer_ip,
            announced.len(),
            err
        );
        withdrawn.extend(announced.iter().map(|(prefix, _)| *prefix));
        announced.clear();
    }

    for prefix in withdrawn {
        features.damping.route_received(peer_ip, prefix, true);
        rib.withdraw_from_peer(peer_ip, prefix);
    }

    if announced.is_empty() {
        return;
    }
    let source = if peer.is_ebgp() {
        RouteSource::Ebgp
    } else {
        RouteSource::Ibgp {
            client: peer.client,
        }
    };
    for (prefix, mp_next_hop) in announced {
        let Some(attributes) = RouteAttributes::from_update(&update, mp_next_hop) else {
            warn!("UPDATE from {} for {} lacks mandatory attributes", peer_ip, prefix);
            continue;
        };
        // AS-path loop: our own ASN in the path
        if attributes.as_path.contains(peer.local_as) {
            debug!("{} from {}: AS {} already in path, dropped", prefix, peer_ip, peer.local_as);
            continue;
        }
        // Reflection loop: our ORIGINATOR_ID or cluster-id
        if reflect::is_reflection_loop(&attributes, config.router_id, config.cluster_id) {
            debug!("{} from {}: reflection loop, dropped", prefix, peer_ip);
            continue;
        }
        if features.damping.route_received(peer_ip, prefix, false) == RouteControl::Suppress {
            debug!("{} from {}: dampened", prefix, peer_ip);
            // A suppressed prefix is withheld entirely, prior state included
            rib.withdraw_from_peer(peer_ip, prefix);
            continue;
        }
        let origin_asn = attributes.as_path.origin_asn();
        let validation = features.rpki.validate(&prefix, origin_asn);
        if validation == ValidationState::Invalid && features.rpki.reject_invalid() {
            debug!("{} from {}: RPKI invalid, dropped", prefix, peer_ip);
            continue;
        }
        // Per-peer import policy decides last
        let Some(attributes) = peer.import_policy.evaluate(&prefix, &attributes) else {
            debug!("{} from {}: rejected by import policy", prefix, peer_ip);
            continue;
        };
        rib.insert_from_peer(BgpRoute {
            prefix,
            family: family_of(&prefix),
            attributes: Arc::new(attributes),
            source,
            peer_id,
            peer_ip,
            peer_asn,
            received_at: Utc::now(),
            validation,
            stale: false,
        });
    }
}

/// Push decision results outward: Adj-RIB-Out recomputation for every
/// peer and kernel convergence for the changed prefixes
async fn apply_decision(
    manager: &mut SessionManager,
    installer: &mut Installer,
    changes: &[RibChange],
) {
    manager.schedule_advertisements(changes.iter().map(|change| change.prefix));
    for change in changes {
        let offer = change.current.as_ref().map(|route| FibRoute {
            prefix: change.prefix,
            next_hop: route.attributes.next_hop,
            metric: BGP_METRIC,
            source: SourceProtocol::Bgp,
        });
        installer
            .offer(SourceProtocol::Bgp, change.prefix, offer)
            .await;
    }
}

/// Rebuild the copy-out API snapshot from live state
fn push_snapshot(
    api_state: &SharedState,
    manager: &SessionManager,
    rib: &Rib,
    ospf: &Option<OspfInstance>,
    installer: &Installer,
) {
    let mut fresh = ApiState::default();

    for session in manager.sessions() {
        let summary = api::PeerSummary {
            peer: session.addr,
            enabled: session.config.enabled,
            router_id: session.router_id,
            remote_asn: session.peer_asn,
            local_asn: session.config.local_as,
            msg_received: Some(session.counts.received()),
            msg_sent: Some(session.counts.sent()),
            connect_time: Some(session.connect_time.timestamp()),
            uptime: Some(crate::utils::format_time_as_elapsed(session.connect_time)),
            state: session.state().to_string(),
            prefixes_received: Some(session.counts.prefixes_received()),
        };
        fresh.peer_details.push(api::PeerDetail {
            summary: summary.clone(),
            hold_timer: session.hold_timer.hold_timer,
            hold_timer_interval: session.hold_timer.interval,
            adj_rib_in: rib.adj_in_size(session.addr),
            adj_rib_out: rib.adj_out_size(session.addr),
            capabilities: describe_capabilities(&session.capabilities),
            stale_window: session.restart_time(),
        });
        fresh.peers.push(summary);

        for route in rib.routes_from_peer(session.addr) {
            fresh.learned.push(rib_row(&route, rib));
        }
        for (prefix, attributes) in rib.advertised_routes(session.addr) {
            fresh.advertised.push(api::RibRow {
                prefix: prefix.to_string(),
                source: "advertised".to_string(),
                peer: Some(session.addr),
                received_at: 0,
                age: String::new(),
                next_hop: attributes.next_hop,
                origin: attributes.origin.to_string(),
                as_path: attributes.as_path.to_string(),
                local_pref: attributes.local_pref,
                multi_exit_disc: attributes.med,
                communities: attributes.communities.iter().map(|c| c.to_string()).collect(),
                validation: String::new(),
                stale: false,
                best: false,
            });
        }
    }

    for route in rib.loc_rib().values() {
        fresh.loc_rib.push(rib_row(route, rib));
    }

    if let Some(instance) = ospf {
        for interface in &instance.interfaces {
            for neighbor in interface.neighbors.values() {
                fresh.ospf_neighbors.push(api::OspfNeighborRow {
                    router_id: neighbor.router_id,
                    address: neighbor.addr,
                    interface: interface.config.name.clone(),
                    priority: neighbor.priority,
                    state: neighbor.state.to_string(),
                    pending_requests: neighbor.ls_requests.len(),
                    pending_retransmits: neighbor.retransmits.len(),
                });
            }
        }
        for lsa in instance.lsdb.iter() {
            fresh.lsdb.push(api::LsdbRow {
                ls_type: lsa.header.ls_type.to_string(),
                link_state_id: lsa.header.id,
                advertising_router: lsa.header.advertising_router,
                sequence: format!("{:#010x}", lsa.header.sequence),
                age: lsa.header.age,
                checksum: format!("{:#06x}", lsa.header.checksum),
            });
        }
        for route in instance.compute_routes() {
            fresh.spf_routes.push(api::SpfRouteRow {
                prefix: route.prefix.to_string(),
                cost: route.cost,
                next_hop: route.next_hop,
                via: route.via,
            });
        }
    }

    for row in installer.snapshot() {
        fresh.fib.push(api::FibRow {
            prefix: row.route.prefix.to_string(),
            next_hop: row.route.next_hop,
            metric: row.route.metric,
            source: row.route.source.to_string(),
            state: match row.state {
                crate::fib::InstallState::Installed => "installed".to_string(),
                crate::fib::InstallState::FailedToInstall => "failed".to_string(),
            },
        });
    }

    *api_state.lock().expect("API state lock") = fresh;
}

fn rib_row(route: &Arc<BgpRoute>, rib: &Rib) -> api::RibRow {
    let best = rib
        .best(&route.prefix)
        .map(|entry| Arc::ptr_eq(entry, route))
        .unwrap_or(false);
    api::RibRow {
        prefix: route.prefix.to_string(),
        source: route.source.to_string(),
        peer: (route.source != RouteSource::Local).then_some(route.peer_ip),
        received_at: route.received_at.timestamp(),
        age: crate::utils::format_time_as_elapsed(route.received_at),
        next_hop: route.attributes.next_hop,
        origin: route.attributes.origin.to_string(),
        as_path: route.attributes.as_path.to_string(),
        local_pref: route.attributes.local_pref,
        multi_exit_disc: route.attributes.med,
        communities: route
            .attributes
            .communities
            .iter()
            .map(|c| c.to_string())
            .collect(),
        validation: route.validation.to_string(),
        stale: route.stale,
        best,
    }
}

fn describe_capabilities(capabilities: &crate::bgp::Capabilities) -> Vec<String> {
    let mut described: Vec<String> = capabilities
        .families
        .iter()
        .map(|family| format!("Multiprotocol {}", family))
        .collect();
    if capabilities.route_refresh {
        described.push("Route-Refresh".to_string());
    }
    if capabilities.four_octet_asn {
        described.push("4-octet ASN".to_string());
    }
    if let Some(graceful_restart) = &capabilities.graceful_restart {
        described.push(format!(
            "Graceful-Restart ({}s)",
            graceful_restart.restart_time
        ));
    }
    described
}
