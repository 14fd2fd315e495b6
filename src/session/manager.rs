use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::codec::{MessageCodec, MessageProtocol};
use super::{EndedPeer, Poller, PollerTx, Session, SessionError, SessionUpdate};
use crate::bgp::notification::{cease, Notification};
use crate::bgp::{Family, Message};
use crate::config::ServerConfig;
use crate::rib::{export_route, Rib};

/// Owns every peer session and the poller that feeds it connections.
/// The server loop drives `get_update` and applies the results to the RIB.
pub struct SessionManager {
    pub(crate) idle_peers: Poller,
    pub(crate) sessions: HashMap<IpAddr, Session>,
    config: Arc<ServerConfig>,
    poller_tx: PollerTx,
    /// Prefixes awaiting (re-)advertisement, per Established peer
    pending_adverts: HashMap<IpAddr, HashSet<IpNetwork>>,
}

impl SessionManager {
    pub fn new(config: Arc<ServerConfig>, listener: TcpListener) -> Self {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let mut poller = Poller::new(listener, config.poll_interval.into(), poller_rx);
        for peer_config in config.peers.iter() {
            poller.upsert_config(Arc::clone(peer_config));
        }
        Self {
            idle_peers: poller,
            sessions: HashMap::with_capacity(config.peers.len()),
            config,
            poller_tx,
            pending_adverts: HashMap::new(),
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn established_peers(&self) -> Vec<IpAddr> {
        self.sessions
            .values()
            .filter(|session| session.is_established())
            .map(|session| session.addr)
            .collect()
    }

    /// Queue prefixes for (re-)advertisement to every Established peer
    pub fn schedule_advertisements(&mut self, prefixes: impl IntoIterator<Item = IpNetwork>) {
        let established = self.established_peers();
        if established.is_empty() {
            return;
        }
        let prefixes: Vec<IpNetwork> = prefixes.into_iter().collect();
        for peer in established {
            self.pending_adverts
                .entry(peer)
                .or_default()
                .extend(prefixes.iter().copied());
        }
    }

    /// Queue the full Loc-RIB toward one peer (initial pass, route refresh)
    pub fn schedule_full_walk(&mut self, peer_ip: IpAddr, rib: &Rib) {
        self.pending_adverts
            .entry(peer_ip)
            .or_default()
            .extend(rib.loc_rib().keys().copied());
    }

    /// Make progress on every session, the advertisement queues, and the
    /// connection poller; returns the first noteworthy session update
    pub async fn get_update(&mut self, rib: &mut Rib) -> Result<Option<SessionUpdate>, Box<dyn Error>> {
        // Poll active sessions
        let mut ended: Vec<EndedPeer> = Vec::new();
        for (remote_ip, session) in self.sessions.iter_mut() {
            match session.run().await {
                Ok(Some(update)) => {
                    match &update {
                        SessionUpdate::Established { peer_ip, .. } => {
                            let prefixes: HashSet<IpNetwork> =
                                rib.loc_rib().keys().copied().collect();
                            self.pending_adverts.insert(*peer_ip, prefixes);
                        }
                        SessionUpdate::Refresh { peer_ip, family } => {
                            let prefixes: HashSet<IpNetwork> = rib
                                .loc_rib()
                                .keys()
                                .filter(|prefix| family_of(prefix) == *family)
                                .copied()
                                .collect();
                            self.pending_adverts.entry(*peer_ip).or_default().extend(prefixes);
                        }
                        _ => (),
                    }
                    return Ok(Some(update));
                }
                Ok(None) => (),
                Err(err) => {
                    if let Some(notification) = err.notification() {
                        session.notify(notification).await;
                    }
                    warn!("{}", err);
                    let graceful = !matches!(err, SessionError::Deconfigured);
                    ended.push(EndedPeer {
                        peer_ip: *remote_ip,
                        config: Arc::clone(&session.config),
                        restart_time: session.restart_time(),
                        graceful,
                    });
                }
            }
        }
        // Remove ended sessions and alert the server for RIB cleanup
        if !ended.is_empty() {
            for peer in &ended {
                if let Some(session) = self.sessions.remove(&peer.peer_ip) {
                    self.pending_adverts.remove(&peer.peer_ip);
                    // Hand the peer back to the poller for reconnection
                    let _ = self.poller_tx.send(session.config);
                }
            }
            return Ok(Some(SessionUpdate::Ended(ended)));
        }

        self.run_advertisements(rib).await;

        // Take new connections from the poller
        if let Some((stream, peer_config)) = self.idle_peers.get_connection().await? {
            let remote_ip = stream.peer_addr()?.ip();
            let locally_initiated = stream.peer_addr()?.port() == peer_config.dest_port;
            if !self.resolve_collision(remote_ip, locally_initiated).await {
                debug!("Dropping colliding connection from {}", remote_ip);
                return Ok(None);
            }
            let protocol = MessageProtocol::new(stream, MessageCodec::new());
            let session = Session::new(
                peer_config,
                protocol,
                locally_initiated,
                self.config.graceful_restart.restart_time,
            );
            info!("New session started: {}", remote_ip);
            self.sessions.insert(remote_ip, session);
        }
        Ok(None)
    }

    /// Connection collision handling: when two connections to the same
    /// peer exist, the side whose BGP identifier is numerically smaller
    /// closes the connection it initiated. Returns whether the new
    /// connection should be kept.
    async fn resolve_collision(&mut self, remote_ip: IpAddr, _locally_initiated: bool) -> bool {
        let Some(existing) = self.sessions.get(&remote_ip) else {
            return true;
        };
        if existing.is_established() {
            // A settled session always wins
            return false;
        }
        let keep_new = match existing.router_id {
            Some(peer_id) if existing.locally_initiated => {
                u32::from_be_bytes(self.config.router_id.octets())
                    < u32::from_be_bytes(peer_id.octets())
            }
            _ => false,
        };
        if keep_new {
            warn!(
                "Connection collision with {}: closing our initiated session",
                remote_ip
            );
            if let Some(mut old) = self.sessions.remove(&remote_ip) {
                old.notify(Notification::cease(cease::CONNECTION_COLLISION))
                    .await;
            }
            self.pending_adverts.remove(&remote_ip);
        }
        keep_new
    }

    /// Drain the per-peer advertisement queues: emit UPDATEs for current
    /// best routes and withdraws for prefixes no longer advertised
    async fn run_advertisements(&mut self, rib: &mut Rib) {
        let cluster_id = self.config.cluster_id;
        for (addr, session) in self.sessions.iter_mut() {
            if !session.is_established() {
                continue;
            }
            let Some(pending) = self.pending_adverts.get_mut(addr) else {
                continue;
            };
            if pending.is_empty() {
                continue;
            }
            let prefixes: Vec<IpNetwork> = pending.drain().collect();
            for prefix in prefixes {
                let exported = rib.best(&prefix).and_then(|route| {
                    export_route(
                        route,
                        &session.config,
                        *addr,
                        session.local_addr(),
                        cluster_id,
                    )
                });
                match exported {
                    Some(exported) => {
                        // Suppress sends the peer has already seen
                        let already = rib
                            .advertised(*addr, &prefix)
                            .map(|attrs| **attrs == exported.attributes)
                            .unwrap_or(false);
                        if already {
                            continue;
                        }
                        let update = session.create_update(&exported);
                        if let Err(err) = session.send_message(Message::Update(update)).await {
                            warn!("Error advertising {} to {}: {}", prefix, addr, err);
                            break;
                        }
                        rib.record_advertised(*addr, prefix, Arc::new(exported.attributes));
                    }
                    None => {
                        if rib.advertised(*addr, &prefix).is_some() {
                            let update = session.create_withdraw(prefix, family_of(&prefix));
                            if let Err(err) = session.send_message(Message::Update(update)).await {
                                warn!("Error withdrawing {} from {}: {}", prefix, addr, err);
                                break;
                            }
                            rib.record_withdrawn(*addr, &prefix);
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn family_of(prefix: &IpNetwork) -> Family {
    match prefix {
        IpNetwork::V4(_) => Family::ipv4_unicast(),
        IpNetwork::V6(_) => Family::ipv6_unicast(),
    }
}
