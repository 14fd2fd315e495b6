use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use log::{debug, trace, warn};
use tokio::time::Instant;

use super::lsa::{Lsa, LsaHeader, LsaKey, Newness};
use super::lsdb::Lsdb;
use super::packet::{dd_flags, DatabaseDescription};

/// Headers carried per Database-Description packet
const DD_HEADERS_PER_PACKET: usize = 32;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum NeighborState {
    Down,
    Attempt,
    Init,
    TwoWay,
    ExStart,
    Exchange,
    Loading,
    Full,
}

impl fmt::Display for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            NeighborState::Down => "Down",
            NeighborState::Attempt => "Attempt",
            NeighborState::Init => "Init",
            NeighborState::TwoWay => "TwoWay",
            NeighborState::ExStart => "ExStart",
            NeighborState::Exchange => "Exchange",
            NeighborState::Loading => "Loading",
            NeighborState::Full => "Full",
        };
        write!(f, "{}", word)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NeighborEvent {
    Start,
    HelloReceived,
    TwoWayReceived { form_adjacency: bool },
    NegotiationDone,
    ExchangeDone,
    LoadingDone,
    AdjOk { form_adjacency: bool },
    SeqNumberMismatch,
    BadLsReq,
    KillNbr,
    InactivityTimer,
    OneWayReceived,
}

/// Result of processing a Database-Description packet
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DdOutcome {
    /// Unexpected for the current state; dropped
    Ignored,
    /// Duplicate of the previous DD (slave re-sends its last reply)
    Duplicate,
    /// Master/slave settled; DD absorbed
    Negotiated,
    /// Sequence or flag mismatch; adjacency restarted at ExStart
    Mismatch,
    /// DD absorbed during Exchange
    Accepted,
}

pub struct Neighbor {
    pub router_id: Ipv4Addr,
    /// Source address of the neighbor's packets on this interface
    pub addr: Ipv4Addr,
    pub priority: u8,
    pub state: NeighborState,
    pub designated_router: Ipv4Addr,
    pub backup_designated_router: Ipv4Addr,
    pub last_hello: Instant,
    /// DD sequence: ours while master, the master's while slave
    pub dd_sequence: u32,
    /// True when this router is the master of the exchange
    pub master: bool,
    /// (flags, sequence) of the last DD accepted, for duplicate detection
    last_dd: Option<(u8, u32)>,
    /// LSA headers still to be described to this neighbor
    pub db_summary: VecDeque<LsaHeader>,
    /// LSAs we must request from this neighbor (populated during Exchange)
    pub ls_requests: VecDeque<LsaKey>,
    /// Flooded LSAs not yet acknowledged, retransmitted until acked
    pub retransmits: HashMap<LsaKey, Lsa>,
    /// Last DD sent, re-sent verbatim when the master repeats itself
    pub last_sent_dd: Option<DatabaseDescription>,
}

impl Neighbor {
    pub fn new(router_id: Ipv4Addr, addr: Ipv4Addr, priority: u8) -> Self {
        Self {
            router_id,
            addr,
            priority,
            state: NeighborState::Down,
            designated_router: Ipv4Addr::UNSPECIFIED,
            backup_designated_router: Ipv4Addr::UNSPECIFIED,
            last_hello: Instant::now(),
            dd_sequence: 0,
            master: true,
            last_dd: None,
            db_summary: VecDeque::new(),
            ls_requests: VecDeque::new(),
            retransmits: HashMap::new(),
            last_sent_dd: None,
        }
    }

    pub fn is_adjacent(&self) -> bool {
        self.state == NeighborState::Full
    }

    fn clear_exchange_state(&mut self) {
        self.db_summary.clear();
        self.ls_requests.clear();
        self.retransmits.clear();
        self.last_dd = None;
        self.last_sent_dd = None;
    }

    fn start_exstart(&mut self) {
        // New exchange attempt: bump the sequence, claim mastership
        self.dd_sequence = self.dd_sequence.wrapping_add(1).max(1);
        self.master = true;
        self.clear_exchange_state();
    }

    pub fn handle_event(&mut self, event: NeighborEvent) -> NeighborState {
        use NeighborEvent::*;
        use NeighborState::*;

        let new_state = match (self.state, event) {
            (Down, Start) => Attempt,
            (Down | Attempt, HelloReceived) => Init,
            (_, HelloReceived) => self.state,
            (Init, TwoWayReceived { form_adjacency }) => {
                if form_adjacency {
                    self.start_exstart();
                    ExStart
                } else {
                    TwoWay
                }
            }
            (_, TwoWayReceived { .. }) => self.state,
            (ExStart, NegotiationDone) => Exchange,
            (Exchange, ExchangeDone) => {
                if self.ls_requests.is_empty() {
                    Full
                } else {
                    Loading
                }
            }
            (Loading, LoadingDone) => Full,
            (TwoWay, AdjOk { form_adjacency: true }) => {
                self.start_exstart();
                ExStart
            }
            (ExStart | Exchange | Loading | Full, AdjOk { form_adjacency: false }) => {
                self.clear_exchange_state();
                TwoWay
            }
            (_, AdjOk { .. }) => self.state,
            (Exchange | Loading | Full, SeqNumberMismatch | BadLsReq) => {
                warn!("Adjacency with {} restarting at ExStart", self.router_id);
                self.start_exstart();
                ExStart
            }
            (_, SeqNumberMismatch | BadLsReq) => self.state,
            (_, KillNbr | InactivityTimer) => {
                self.clear_exchange_state();
                Down
            }
            (TwoWay | ExStart | Exchange | Loading | Full, OneWayReceived) => {
                self.clear_exchange_state();
                Init
            }
            (_, OneWayReceived) => self.state,
            (_, NegotiationDone | ExchangeDone | LoadingDone) => self.state,
        };

        if new_state != self.state {
            debug!(
                "Neighbor {} went from {} to {}",
                self.router_id, self.state, new_state
            );
            self.state = new_state;
        }
        self.state
    }

    /// Seed the database summary list when entering Exchange
    pub fn load_db_summary(&mut self, lsdb: &Lsdb) {
        self.db_summary = lsdb.headers().into();
    }

    /// Add every DD-described LSA the database lacks (or holds older) to
    /// the request list. Must run to completion before ExchangeDone fires;
    /// a premature transition would skip Loading with an empty list.
    fn absorb_headers(&mut self, dd: &DatabaseDescription, lsdb: &Lsdb) {
        for header in &dd.headers {
            if lsdb.newness(header) == Newness::Newer
                && !self.ls_requests.contains(&header.key())
            {
                trace!("Requesting {} from {}", header.key(), self.router_id);
                self.ls_requests.push_back(header.key());
            }
        }
    }

    /// Process a Database-Description packet per our exchange role
    pub fn process_dd(
        &mut self,
        dd: &DatabaseDescription,
        my_router_id: Ipv4Addr,
        lsdb: &Lsdb,
    ) -> DdOutcome {
        match self.state {
            NeighborState::ExStart => {
                if dd.is_init() && dd.is_more() && dd.is_master() && dd.headers.is_empty() {
                    if self.router_id > my_router_id {
                        // Higher router-id wins mastership; adopt its sequence
                        self.master = false;
                        self.dd_sequence = dd.sequence;
                        self.last_dd = Some((dd.flags, dd.sequence));
                        self.load_db_summary(lsdb);
                        self.handle_event(NeighborEvent::NegotiationDone);
                        return DdOutcome::Negotiated;
                    }
                    return DdOutcome::Ignored;
                }
                if !dd.is_init() && !dd.is_master() && dd.sequence == self.dd_sequence {
                    if self.router_id < my_router_id {
                        // The neighbor accepted us as master
                        self.master = true;
                        self.last_dd = Some((dd.flags, dd.sequence));
                        self.load_db_summary(lsdb);
                        self.handle_event(NeighborEvent::NegotiationDone);
                        self.absorb_dd_in_exchange(dd, lsdb);
                        return DdOutcome::Negotiated;
                    }
                }
                DdOutcome::Ignored
            }
            NeighborState::Exchange => {
                if Some((dd.flags, dd.sequence)) == self.last_dd {
                    return DdOutcome::Duplicate;
                }
                if dd.is_init() || dd.is_master() == self.master {
                    self.handle_event(NeighborEvent::SeqNumberMismatch);
                    return DdOutcome::Mismatch;
                }
                let expected = if self.master {
                    // Slave echoes the sequence we last sent
                    self.dd_sequence
                } else {
                    self.dd_sequence.wrapping_add(1)
                };
                if dd.sequence != expected {
                    self.handle_event(NeighborEvent::SeqNumberMismatch);
                    return DdOutcome::Mismatch;
                }
                self.last_dd = Some((dd.flags, dd.sequence));
                self.absorb_dd_in_exchange(dd, lsdb);
                DdOutcome::Accepted
            }
            NeighborState::Loading | NeighborState::Full => {
                if Some((dd.flags, dd.sequence)) == self.last_dd {
                    return DdOutcome::Duplicate;
                }
                self.handle_event(NeighborEvent::SeqNumberMismatch);
                DdOutcome::Mismatch
            }
            _ => DdOutcome::Ignored,
        }
    }

    fn absorb_dd_in_exchange(&mut self, dd: &DatabaseDescription, lsdb: &Lsdb) {
        // Request list fills completely before any done signal
        self.absorb_headers(dd, lsdb);
        if self.master {
            self.dd_sequence = self.dd_sequence.wrapping_add(1);
            // Done only once our own final (M=0) DD is out and the slave
            // answered it with M=0; concluding earlier would strand the
            // slave waiting for a DD that never comes
            let sent_final = self
                .last_sent_dd
                .as_ref()
                .map(|sent| !sent.is_more())
                .unwrap_or(false);
            if !dd.is_more() && self.db_summary.is_empty() && sent_final {
                self.handle_event(NeighborEvent::ExchangeDone);
            }
        } else if !dd.is_more() && self.db_summary.len() <= DD_HEADERS_PER_PACKET {
            // Slave finishes after replying to the master's final DD
            self.dd_sequence = dd.sequence;
            self.handle_event(NeighborEvent::ExchangeDone);
        } else {
            self.dd_sequence = dd.sequence;
        }
    }

    /// Build the next Database-Description to send
    pub fn next_dd(&mut self, mtu: u16, options: u8) -> DatabaseDescription {
        let dd = match self.state {
            NeighborState::ExStart => DatabaseDescription {
                mtu,
                options,
                flags: dd_flags::INIT | dd_flags::MORE | dd_flags::MASTER,
                sequence: self.dd_sequence,
                headers: vec![],
            },
            _ => {
                let count = self.db_summary.len().min(DD_HEADERS_PER_PACKET);
                let headers: Vec<LsaHeader> = self.db_summary.drain(..count).collect();
                let mut flags = 0;
                if self.master {
                    flags |= dd_flags::MASTER;
                }
                if !self.db_summary.is_empty() {
                    flags |= dd_flags::MORE;
                }
                DatabaseDescription {
                    mtu,
                    options,
                    flags,
                    sequence: self.dd_sequence,
                    headers,
                }
            }
        };
        self.last_sent_dd = Some(dd.clone());
        dd
    }

    /// Remove a satisfied request; fires LoadingDone on the last one
    pub fn satisfy_request(&mut self, key: &LsaKey) {
        self.ls_requests.retain(|pending| pending != key);
        if self.state == NeighborState::Loading && self.ls_requests.is_empty() {
            self.handle_event(NeighborEvent::LoadingDone);
        }
    }

    pub fn hello_seen(&mut self) {
        self.last_hello = Instant::now();
    }
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Neighbor {} [{}] state={}>",
            self.router_id, self.addr, self.state
        )
    }
}
