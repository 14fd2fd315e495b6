use std::cmp;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};

use super::codec::{CodecError, MessageProtocol};
use super::fsm::{Fsm, FsmAction, FsmEvent, FsmState, LARGE_HOLD_TIMER};
use super::{HoldTimer, MessageCounts};
use super::{LearnedUpdate, SessionError, SessionUpdate};
use crate::bgp::open::GracefulRestart;
use crate::bgp::{BgpError, Capabilities, Family, Message, Notification, Open, Update};
use crate::config::PeerConfig;
use crate::rib::ExportedRoute;
use crate::utils::format_time_as_elapsed;

/// A `Session` drives one peer's TCP stream through the BGP state
/// machine: framing, capability negotiation, hold-time enforcement,
/// and UPDATE dispatch to the RIB layer.
pub struct Session {
    pub(crate) addr: IpAddr,
    pub(crate) fsm: Fsm,
    /// The peer's BGP identifier, learned from its OPEN
    pub(crate) router_id: Option<Ipv4Addr>,
    pub(crate) peer_asn: u32,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) protocol: MessageProtocol,
    pub(crate) connect_time: DateTime<Utc>,
    pub(crate) hold_timer: HoldTimer,
    pub(crate) counts: MessageCounts,
    pub(crate) capabilities: Capabilities,
    pub(crate) locally_initiated: bool,
    /// Stale window advertised in our Graceful-Restart capability
    local_restart_time: u16,
}

impl Session {
    pub fn new(
        config: Arc<PeerConfig>,
        protocol: MessageProtocol,
        locally_initiated: bool,
        local_restart_time: u16,
    ) -> Session {
        let addr = protocol
            .get_ref()
            .peer_addr()
            .expect("Stream has remote IP")
            .ip();
        Session {
            addr,
            fsm: Fsm {
                state: if locally_initiated {
                    FsmState::Connect
                } else {
                    FsmState::Active
                },
            },
            router_id: None,
            peer_asn: config.remote_as,
            config,
            protocol,
            connect_time: Utc::now(),
            hold_timer: HoldTimer::new(LARGE_HOLD_TIMER),
            counts: MessageCounts::new(),
            capabilities: Capabilities::default(),
            locally_initiated,
            local_restart_time,
        }
    }

    pub fn state(&self) -> FsmState {
        self.fsm.state
    }

    pub fn is_established(&self) -> bool {
        self.fsm.state == FsmState::Established
    }

    /// Our address on this TCP connection (used for next-hop-self)
    pub fn local_addr(&self) -> IpAddr {
        self.protocol
            .get_ref()
            .local_addr()
            .expect("Stream has local IP")
            .ip()
    }

    /// The restart window the peer advertised, if GR was negotiated
    pub fn restart_time(&self) -> Option<u16> {
        self.capabilities
            .graceful_restart
            .as_ref()
            .map(|gr| gr.restart_time)
    }

    pub fn update_config(&mut self, new_config: Arc<PeerConfig>) {
        debug!("Peer config for {} (active session) updated", self.addr);
        self.config = new_config;
    }

    /// Main function for making progress with the session.
    /// Waits for either a new incoming message or a HoldTimer event.
    pub async fn run(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        if !self.config.enabled {
            return Err(SessionError::Deconfigured);
        }
        if matches!(self.fsm.state, FsmState::Connect | FsmState::Active) {
            let actions = self.fsm.handle(FsmEvent::TcpConnectionConfirmed);
            self.execute(actions).await?;
        }
        trace!("Hold time on {}: {}", self.addr, self.hold_timer);

        tokio::select! {
            message = self.protocol.next() => {
                match message {
                    // Framed stream is exhausted, remote side closed connection
                    None => {
                        self.fsm.handle(FsmEvent::TcpConnectionFails);
                        Err(SessionError::Other(format!("Session ended with {}", self.addr)))
                    }
                    Some(Ok(message)) => {
                        trace!("[{}] Incoming: {}", self.addr, message.kind());
                        self.counts.increment_received();
                        self.hold_timer.received();
                        self.process_message(message).await
                    }
                    Some(Err(CodecError::Bgp(err))) => {
                        let event = match &err {
                            BgpError::Header(_) => FsmEvent::BgpHeaderErr,
                            BgpError::Open(_) => FsmEvent::BgpOpenMsgErr,
                            BgpError::Update(_) => FsmEvent::UpdateMsgErr,
                        };
                        self.fsm.handle(event);
                        Err(SessionError::Bgp(err))
                    }
                    Some(Err(CodecError::Io(err))) => {
                        self.fsm.handle(FsmEvent::TcpConnectionFails);
                        Err(SessionError::TransportError(err.to_string()))
                    }
                }
            },
            // Hold/Keepalive timer maintenance
            keepalive = self.hold_timer.should_send_keepalive() => {
                match keepalive {
                    Err(SessionError::HoldTimeExpired(hold)) => {
                        self.fsm.handle(FsmEvent::HoldTimerExpires);
                        Err(SessionError::HoldTimeExpired(hold))
                    }
                    Err(err) => Err(err),
                    Ok(true) => {
                        if matches!(
                            self.fsm.state,
                            FsmState::OpenConfirm | FsmState::Established
                        ) {
                            let actions = self.fsm.handle(FsmEvent::KeepaliveTimerExpires);
                            self.execute(actions).await?;
                        }
                        Ok(None)
                    }
                    Ok(false) => Ok(None),
                }
            },
        }
    }

    async fn process_message(
        &mut self,
        message: Message,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        match message {
            Message::Open(open) => {
                self.open_received(open)?;
                let actions = self.fsm.handle(FsmEvent::BgpOpen);
                self.execute(actions).await?;
                if self.fsm.state == FsmState::Idle {
                    return Err(SessionError::Other("OPEN outside OpenSent".to_string()));
                }
                Ok(None)
            }
            Message::Keepalive => {
                let actions = self.fsm.handle(FsmEvent::KeepaliveMsg);
                let established = actions.contains(&FsmAction::RunInitialAdvertisements);
                self.execute(actions).await?;
                if self.fsm.state == FsmState::Idle {
                    return Err(SessionError::Other("Unexpected KEEPALIVE".to_string()));
                }
                if established {
                    debug!("{} session established", self.addr);
                    return Ok(Some(SessionUpdate::Established {
                        peer_ip: self.addr,
                        config: Arc::clone(&self.config),
                    }));
                }
                Ok(None)
            }
            Message::Update(update) => {
                let actions = self.fsm.handle(FsmEvent::UpdateMsg);
                if self.fsm.state == FsmState::Idle {
                    self.execute(actions).await?;
                    return Err(SessionError::Other("UPDATE outside Established".to_string()));
                }
                self.execute(actions).await?;
                Ok(Some(self.update_received(update)))
            }
            Message::Notification(notification) => {
                warn!("{} NOTIFICATION: {}", self.addr, notification);
                self.fsm.handle(FsmEvent::NotifMsg);
                Err(SessionError::PeerNotification(notification))
            }
            Message::RouteRefresh(family) => {
                if self.capabilities.route_refresh {
                    debug!("{} requested ROUTE-REFRESH for {}", self.addr, family);
                    Ok(Some(SessionUpdate::Refresh {
                        peer_ip: self.addr,
                        family,
                    }))
                } else {
                    trace!("{} sent ROUTE-REFRESH without the capability", self.addr);
                    Ok(None)
                }
            }
        }
    }

    fn update_received(&mut self, update: Update) -> SessionUpdate {
        if update.is_end_of_rib() {
            debug!("{} sent End-of-RIB", self.addr);
            return SessionUpdate::EndOfRib { peer_ip: self.addr };
        }
        let announced = update.announced.len()
            + update.mp_reach().map(|mp| mp.nlri.len()).unwrap_or(0);
        let withdrawn = update.withdrawn.len()
            + update.mp_unreach().map(|mp| mp.withdrawn.len()).unwrap_or(0);
        self.counts.add_prefixes_received(announced as u64);
        self.counts.add_prefixes_withdrawn(withdrawn as u64);
        SessionUpdate::Learned(LearnedUpdate {
            peer_ip: self.addr,
            peer_id: self.router_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
            peer_asn: self.peer_asn,
            config: Arc::clone(&self.config),
            update,
        })
    }

    /// Carry out the sending/timer side effects of an FSM transition.
    /// Teardown actions (CloseTcp, PurgeAdjRibIn) surface as errors to
    /// the manager, which owns session and RIB lifecycle.
    async fn execute(&mut self, actions: Vec<FsmAction>) -> Result<(), SessionError> {
        for action in actions {
            match action {
                FsmAction::SendOpen => {
                    let open = self.create_open();
                    self.send_message(Message::Open(open)).await?;
                }
                FsmAction::SendKeepalive => {
                    self.send_message(Message::Keepalive).await?;
                }
                FsmAction::StartHoldTimerLarge => {
                    self.hold_timer = HoldTimer::new(LARGE_HOLD_TIMER);
                }
                FsmAction::RestartHoldTimer
                | FsmAction::StartKeepaliveTimer
                | FsmAction::RestartKeepaliveTimer => {
                    // HoldTimer paces keepalives at a third of the hold
                    // time; restart by rebuilding only on value change
                    let negotiated = self.negotiated_hold_time();
                    if self.hold_timer.hold_timer != negotiated {
                        self.hold_timer = HoldTimer::new(negotiated);
                    } else {
                        self.hold_timer.received();
                    }
                }
                FsmAction::SendNotification(code, subcode) => {
                    // Specific errors send richer notifications via
                    // SessionError::notification; this is the FSM default
                    if code == crate::bgp::notification::code::FSM {
                        let notification = Notification::new(code, subcode);
                        let _ = self.send_message(Message::Notification(notification)).await;
                    }
                }
                FsmAction::StopConnectRetryTimer
                | FsmAction::StartConnectRetryTimer
                | FsmAction::InitiateTcpConnection
                | FsmAction::StopTimers
                | FsmAction::CloseTcp
                | FsmAction::PurgeAdjRibIn
                | FsmAction::RunInitialAdvertisements => (),
            }
        }
        Ok(())
    }

    fn negotiated_hold_time(&self) -> u16 {
        self.hold_timer.hold_timer
    }

    // Send a message, and flush the send buffer afterwards
    pub async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        trace!("[{}] Outgoing: {}", self.addr, message.kind());
        self.protocol.send(message).await?;
        self.counts.increment_sent();
        self.hold_timer.sent();
        Ok(())
    }

    pub async fn notify(&mut self, notification: Notification) {
        if let Err(err) = self
            .send_message(Message::Notification(notification))
            .await
        {
            trace!("[{}] Could not send NOTIFICATION: {}", self.addr, err);
        }
    }

    pub fn open_received(&mut self, received_open: Open) -> Result<(), SessionError> {
        let remote_asn = received_open.remote_asn();
        if remote_asn != self.config.remote_as {
            return Err(SessionError::OpenAsnMismatch(
                remote_asn,
                self.config.remote_as,
            ));
        }
        debug!(
            "[{}] Received OPEN [id {} hold-time {}]",
            self.addr, received_open.identifier, received_open.hold_time
        );
        self.router_id = Some(received_open.identifier);
        self.peer_asn = remote_asn;

        let hold_time = cmp::min(received_open.hold_time, self.config.hold_timer);
        self.hold_timer = HoldTimer::new(hold_time);

        let negotiated = self.local_capabilities().common(&received_open.capabilities);
        self.protocol.codec_mut().capabilities = negotiated.clone();
        self.capabilities = negotiated;
        Ok(())
    }

    fn local_capabilities(&self) -> Capabilities {
        Capabilities {
            families: self.config.families.iter().copied().collect(),
            route_refresh: true,
            four_octet_asn: true,
            graceful_restart: Some(GracefulRestart {
                restart_time: self.local_restart_time,
                families: self.config.families.clone(),
            }),
        }
    }

    pub fn create_open(&self) -> Open {
        let two_byte_asn = if self.config.local_as < 65535 {
            self.config.local_as as u16
        } else {
            // AS_TRANS [RFC 6793 4.2.3.9]
            23456
        };
        Open {
            version: 4,
            asn: two_byte_asn,
            hold_time: self.config.hold_timer,
            identifier: self.config.local_router_id,
            capabilities: self.local_capabilities(),
            four_octet_asn: Some(self.config.local_as),
        }
    }

    /// Build an UPDATE announcing one exported route
    pub fn create_update(&self, exported: &ExportedRoute) -> Update {
        let is_v4 = matches!(exported.family, Family { afi: crate::bgp::Afi::Ipv4, .. });
        let attributes = exported
            .attributes
            .to_path_attributes(exported.family, vec![exported.prefix]);
        Update {
            withdrawn: vec![],
            attributes,
            announced: if is_v4 { vec![exported.prefix] } else { vec![] },
            malformed: None,
        }
    }

    /// Build an UPDATE withdrawing a previously advertised prefix
    pub fn create_withdraw(&self, prefix: ipnetwork::IpNetwork, family: Family) -> Update {
        use crate::bgp::attributes::{MpUnreach, PathAttribute};
        match family.afi {
            crate::bgp::Afi::Ipv4 => Update {
                withdrawn: vec![prefix],
                ..Update::default()
            },
            crate::bgp::Afi::Ipv6 => Update {
                attributes: vec![PathAttribute::MpUnreachNlri(MpUnreach {
                    family,
                    withdrawn: vec![prefix],
                })],
                ..Update::default()
            },
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} state={} uptime={} hold_time={}>",
            self.addr,
            self.fsm.state,
            format_time_as_elapsed(self.connect_time),
            self.hold_timer,
        )
    }
}
