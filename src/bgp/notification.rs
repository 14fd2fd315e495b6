use std::fmt;

use bytes::{BufMut, BytesMut};

use super::{open::OpenError, update::UpdateError, BgpError, Cursor, HeaderError};

/// NOTIFICATION error codes [RFC 4271 4.5]
pub mod code {
    pub const MESSAGE_HEADER: u8 = 1;
    pub const OPEN: u8 = 2;
    pub const UPDATE: u8 = 3;
    pub const HOLD_TIMER_EXPIRED: u8 = 4;
    pub const FSM: u8 = 5;
    pub const CEASE: u8 = 6;
}

/// Cease subcodes [RFC 4486]
pub mod cease {
    pub const ADMIN_SHUTDOWN: u8 = 2;
    pub const PEER_DECONFIGURED: u8 = 3;
    pub const CONNECTION_COLLISION: u8 = 7;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, subcode: u8) -> Self {
        Self {
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn with_data(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code,
            subcode,
            data,
        }
    }

    pub fn hold_timer_expired() -> Self {
        Self::new(code::HOLD_TIMER_EXPIRED, 0)
    }

    pub fn cease(subcode: u8) -> Self {
        Self::new(code::CEASE, subcode)
    }

    pub(super) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code);
        buf.put_u8(self.subcode);
        buf.put_slice(&self.data);
    }

    pub(super) fn decode(body: &[u8]) -> Result<Self, BgpError> {
        let mut cursor = Cursor::new(body);
        let code = cursor
            .get_u8()
            .ok_or(BgpError::Header(HeaderError::BadLength(body.len() as u16)))?;
        let subcode = cursor
            .get_u8()
            .ok_or(BgpError::Header(HeaderError::BadLength(body.len() as u16)))?;
        let data = cursor.take(cursor.remaining()).unwrap_or(&[]).to_vec();
        Ok(Self {
            code,
            subcode,
            data,
        })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = match (self.code, self.subcode) {
            (code::MESSAGE_HEADER, 1) => "Message Header: Connection Not Synchronized",
            (code::MESSAGE_HEADER, 2) => "Message Header: Bad Message Length",
            (code::MESSAGE_HEADER, 3) => "Message Header: Bad Message Type",
            (code::OPEN, 1) => "OPEN: Unsupported Version Number",
            (code::OPEN, 2) => "OPEN: Bad Peer AS",
            (code::OPEN, 3) => "OPEN: Bad BGP Identifier",
            (code::OPEN, 4) => "OPEN: Unsupported Optional Parameter",
            (code::OPEN, 6) => "OPEN: Unacceptable Hold Time",
            (code::UPDATE, 1) => "UPDATE: Malformed Attribute List",
            (code::UPDATE, 2) => "UPDATE: Unrecognized Well-known Attribute",
            (code::UPDATE, 3) => "UPDATE: Missing Well-known Attribute",
            (code::UPDATE, 4) => "UPDATE: Attribute Flags Error",
            (code::UPDATE, 5) => "UPDATE: Attribute Length Error",
            (code::UPDATE, 6) => "UPDATE: Invalid ORIGIN Attribute",
            (code::UPDATE, 8) => "UPDATE: Invalid NEXT_HOP Attribute",
            (code::UPDATE, 9) => "UPDATE: Optional Attribute Error",
            (code::UPDATE, 10) => "UPDATE: Invalid Network Field",
            (code::UPDATE, 11) => "UPDATE: Malformed AS_PATH",
            (code::HOLD_TIMER_EXPIRED, _) => "Hold Timer Expired",
            (code::FSM, _) => "Finite State Machine Error",
            (code::CEASE, cease::ADMIN_SHUTDOWN) => "Cease: Administrative Shutdown",
            (code::CEASE, cease::PEER_DECONFIGURED) => "Cease: Peer De-configured",
            (code::CEASE, cease::CONNECTION_COLLISION) => "Cease: Connection Collision Resolution",
            (code::CEASE, _) => "Cease",
            _ => "Unknown",
        };
        write!(f, "{} [{}/{}]", description, self.code, self.subcode)
    }
}

/// How an UPDATE validation error affects the session [RFC 7606]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateHandling {
    /// Tear the session with a NOTIFICATION
    SessionReset,
    /// Treat the NLRI in the faulty UPDATE as withdrawn, keep the session
    TreatAsWithdraw,
}

impl From<&BgpError> for Notification {
    fn from(err: &BgpError) -> Notification {
        match err {
            BgpError::Header(HeaderError::ConnectionNotSynchronized) => {
                Notification::new(code::MESSAGE_HEADER, 1)
            }
            BgpError::Header(HeaderError::BadLength(length)) => Notification::with_data(
                code::MESSAGE_HEADER,
                2,
                length.to_be_bytes().to_vec(),
            ),
            BgpError::Header(HeaderError::BadType(message_type)) => {
                Notification::with_data(code::MESSAGE_HEADER, 3, vec![*message_type])
            }
            BgpError::Open(err) => {
                let (subcode, data) = match err {
                    OpenError::UnsupportedVersion(version) => (1, vec![0, *version]),
                    OpenError::BadPeerAs => (2, vec![]),
                    OpenError::BadBgpIdentifier => (3, vec![]),
                    OpenError::UnsupportedOptionalParameter => (4, vec![]),
                    OpenError::UnacceptableHoldTime(hold_time) => {
                        (6, hold_time.to_be_bytes().to_vec())
                    }
                    OpenError::Malformed => (0, vec![]),
                };
                Notification::with_data(code::OPEN, subcode, data)
            }
            BgpError::Update(err) => {
                let (subcode, data) = match err {
                    UpdateError::MalformedAttributeList => (1, vec![]),
                    UpdateError::UnrecognizedWellKnown(type_code) => (2, vec![*type_code]),
                    UpdateError::MissingWellKnown(type_code) => (3, vec![*type_code]),
                    UpdateError::AttributeFlags { type_code, flags } => {
                        (4, vec![*flags, *type_code])
                    }
                    UpdateError::AttributeLength { type_code } => (5, vec![*type_code]),
                    UpdateError::InvalidOrigin(origin) => (6, vec![*origin]),
                    UpdateError::InvalidNextHop => (8, vec![]),
                    UpdateError::OptionalAttribute { type_code }
                    | UpdateError::IgnoredOptional { type_code } => (9, vec![*type_code]),
                    UpdateError::InvalidNetworkField => (10, vec![]),
                    UpdateError::MalformedAsPath => (11, vec![]),
                };
                Notification::with_data(code::UPDATE, subcode, data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::update::UpdateError;

    #[test]
    fn test_missing_well_known_notification() {
        let err = BgpError::Update(UpdateError::MissingWellKnown(1));
        let notification = Notification::from(&err);
        assert_eq!(notification.code, code::UPDATE);
        assert_eq!(notification.subcode, 3);
        assert_eq!(notification.data, vec![1]);
    }

    #[test]
    fn test_notification_round_trip() {
        let notification = Notification::with_data(code::OPEN, 6, vec![0, 2]);
        let mut buf = BytesMut::new();
        notification.encode(&mut buf);
        let decoded = Notification::decode(&buf).unwrap();
        assert_eq!(decoded, notification);
    }

    #[test]
    fn test_display() {
        let notification = Notification::new(code::HOLD_TIMER_EXPIRED, 0);
        assert_eq!(notification.to_string(), "Hold Timer Expired [4/0]");
    }
}
