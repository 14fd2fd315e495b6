mod codec;
pub mod fsm;
mod hold_timer;
pub(crate) mod manager;
mod message_counts;
mod poller;
mod session;

pub use codec::{CodecError, MessageCodec, MessageProtocol};
pub use fsm::{Fsm, FsmEvent, FsmState};
pub use manager::SessionManager;
pub use session::Session;

use hold_timer::HoldTimer;
use message_counts::MessageCounts;
use poller::{Poller, PollerTx};

use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::bgp::{BgpError, Family, Notification, Update};
use crate::config::PeerConfig;

/// An UPDATE received from an Established peer, with the session context
/// the import path needs
#[derive(Debug)]
pub struct LearnedUpdate {
    pub peer_ip: IpAddr,
    pub peer_id: Ipv4Addr,
    pub peer_asn: u32,
    pub config: Arc<PeerConfig>,
    pub update: Update,
}

/// A peer whose session ended, with its graceful-restart window (when
/// the capability was negotiated)
#[derive(Debug)]
pub struct EndedPeer {
    pub peer_ip: IpAddr,
    pub config: Arc<PeerConfig>,
    pub restart_time: Option<u16>,
    /// False for administrative stops, which never arm the stale window
    pub graceful: bool,
}

#[derive(Debug)]
pub enum SessionUpdate {
    /// Update received from a peer
    Learned(LearnedUpdate),
    /// Peer entered Established; run the initial advertisement pass
    Established {
        peer_ip: IpAddr,
        config: Arc<PeerConfig>,
    },
    /// End-of-RIB marker received (empty UPDATE) [RFC 4724]
    EndOfRib { peer_ip: IpAddr },
    /// Peer asked for a fresh export walk
    Refresh { peer_ip: IpAddr, family: Family },
    /// Sessions ended; clear (or stale-mark) RIB state for these peers
    Ended(Vec<EndedPeer>),
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer de-configured or administratively disabled
    Deconfigured,
    /// Received an unexpected ASN [received, expected]
    OpenAsnMismatch(u32, u32),
    /// Hold time expired [seconds]
    HoldTimeExpired(u16),
    /// Wire-format or validation error with its NOTIFICATION mapping
    Bgp(BgpError),
    /// The peer sent a NOTIFICATION and closed the session
    PeerNotification(Notification),
    /// Connection collision resolved against this session
    CollisionResolved,
    /// Something happened in transport
    TransportError(String),
    /// Some other issue happened
    Other(String),
}

impl SessionError {
    /// The NOTIFICATION this error obliges us to send, if any
    pub fn notification(&self) -> Option<Notification> {
        use crate::bgp::notification::{cease, code};
        match self {
            SessionError::Deconfigured => {
                Some(Notification::cease(cease::PEER_DECONFIGURED))
            }
            SessionError::OpenAsnMismatch(..) => Some(Notification::new(code::OPEN, 2)),
            SessionError::HoldTimeExpired(_) => Some(Notification::hold_timer_expired()),
            SessionError::Bgp(err) => Some(Notification::from(err)),
            SessionError::CollisionResolved => {
                Some(Notification::cease(cease::CONNECTION_COLLISION))
            }
            SessionError::PeerNotification(_)
            | SessionError::TransportError(_)
            | SessionError::Other(_) => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer de-configured"),
            OpenAsnMismatch(received, expected) => {
                write!(f, "Open ASN mismatch (received={}, expected={})", received, expected)
            }
            HoldTimeExpired(hold) => write!(f, "Hold time expired after {} seconds", hold),
            Bgp(err) => write!(f, "{}", err),
            PeerNotification(notification) => {
                write!(f, "Peer sent NOTIFICATION: {}", notification)
            }
            CollisionResolved => write!(f, "Connection collision resolved"),
            TransportError(reason) => write!(f, "Transport error [{}]", reason),
            Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::TransportError(error.to_string())
    }
}

impl From<CodecError> for SessionError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io(err) => SessionError::TransportError(err.to_string()),
            CodecError::Bgp(err) => SessionError::Bgp(err),
        }
    }
}

impl error::Error for SessionError {}
