pub mod attributes;
pub mod community;
pub mod notification;
pub mod open;
pub mod update;

pub use attributes::{AsPath, Origin, PathAttribute, Segment};
pub use community::{Community, CommunityList};
pub use notification::{Notification, UpdateHandling};
pub use open::{Capabilities, Open};
pub use update::Update;

use std::convert::TryFrom;
use std::fmt;

use bytes::{BufMut, BytesMut};
use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

/// Marker preamble for every BGP message
pub const MARKER: [u8; 16] = [0xff; 16];
/// Message header: marker + length + type
pub const HEADER_LENGTH: usize = 19;
pub const MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Afi {
    Ipv4,
    Ipv6,
}

impl Afi {
    pub fn code(self) -> u16 {
        match self {
            Afi::Ipv4 => 1,
            Afi::Ipv6 => 2,
        }
    }
}

impl TryFrom<u16> for Afi {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            1 => Ok(Afi::Ipv4),
            2 => Ok(Afi::Ipv6),
            other => Err(other),
        }
    }
}

impl fmt::Display for Afi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Afi::Ipv4 => write!(f, "IPv4"),
            Afi::Ipv6 => write!(f, "IPv6"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Safi {
    Unicast,
}

impl Safi {
    pub fn code(self) -> u8 {
        match self {
            Safi::Unicast => 1,
        }
    }
}

impl TryFrom<u8> for Safi {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Safi::Unicast),
            other => Err(other),
        }
    }
}

impl fmt::Display for Safi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Safi::Unicast => write!(f, "Unicast"),
        }
    }
}

/// An AFI/SAFI pair, negotiated via the Multiprotocol capability
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Family {
    pub afi: Afi,
    pub safi: Safi,
}

impl Family {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }

    pub fn ipv4_unicast() -> Self {
        Self::new(Afi::Ipv4, Safi::Unicast)
    }

    pub fn ipv6_unicast() -> Self {
        Self::new(Afi::Ipv6, Safi::Unicast)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.afi, self.safi)
    }
}

impl TryFrom<(u16, u8)> for Family {
    type Error = String;

    fn try_from(v: (u16, u8)) -> Result<Self, String> {
        let afi = Afi::try_from(v.0).map_err(|code| format!("Unsupported AFI: {}", code))?;
        let safi = Safi::try_from(v.1).map_err(|code| format!("Unsupported SAFI: {}", code))?;
        Ok(Self::new(afi, safi))
    }
}

impl Serialize for Family {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Family {
    fn deserialize<D>(deserializer: D) -> Result<Family, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.trim().split_whitespace().collect();
        if parts.len() != 2 {
            return Err(serde::de::Error::custom(format!(
                "Incorrect family format: '{}'",
                s
            )));
        }
        let afi = match parts[0].to_lowercase().as_str() {
            "ipv4" => Afi::Ipv4,
            "ipv6" => Afi::Ipv6,
            family => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported AFI: '{}'",
                    family
                )))
            }
        };
        let safi = match parts[1].to_lowercase().as_str() {
            "unicast" => Safi::Unicast,
            sfamily => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported SAFI: '{}'",
                    sfamily
                )))
            }
        };
        Ok(Family::new(afi, safi))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    Keepalive,
    RouteRefresh(Family),
}

impl Message {
    pub fn message_type(&self) -> u8 {
        match self {
            Message::Open(_) => 1,
            Message::Update(_) => 2,
            Message::Notification(_) => 3,
            Message::Keepalive => 4,
            Message::RouteRefresh(_) => 5,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open(_) => "OPEN",
            Message::Update(_) => "UPDATE",
            Message::Notification(_) => "NOTIFICATION",
            Message::Keepalive => "KEEPALIVE",
            Message::RouteRefresh(_) => "ROUTEREFRESH",
        }
    }

    /// Encode a full message (header included) into the destination buffer
    pub fn encode(&self, dst: &mut BytesMut, caps: &Capabilities) -> Result<(), BgpError> {
        let mut body = BytesMut::with_capacity(64);
        match self {
            Message::Open(open) => open.encode(&mut body),
            Message::Update(update) => update.encode(&mut body, caps)?,
            Message::Notification(notification) => notification.encode(&mut body),
            Message::Keepalive => (),
            Message::RouteRefresh(family) => {
                body.put_u16(family.afi.code());
                body.put_u8(0);
                body.put_u8(family.safi.code());
            }
        }
        let length = HEADER_LENGTH + body.len();
        if length > MAX_MESSAGE_LENGTH {
            return Err(BgpError::Header(HeaderError::BadLength(length as u16)));
        }
        dst.reserve(length);
        dst.put_slice(&MARKER);
        dst.put_u16(length as u16);
        dst.put_u8(self.message_type());
        dst.put_slice(&body);
        Ok(())
    }

    /// Decode a message body (header already consumed and validated)
    pub fn decode(message_type: u8, body: &[u8], caps: &Capabilities) -> Result<Message, BgpError> {
        match message_type {
            1 => Ok(Message::Open(Open::decode(body)?)),
            2 => Ok(Message::Update(Update::decode(body, caps)?)),
            3 => Ok(Message::Notification(Notification::decode(body)?)),
            4 => {
                if !body.is_empty() {
                    return Err(BgpError::Header(HeaderError::BadLength(
                        (HEADER_LENGTH + body.len()) as u16,
                    )));
                }
                Ok(Message::Keepalive)
            }
            5 => {
                let mut cursor = Cursor::new(body);
                let afi = cursor
                    .get_u16()
                    .ok_or(BgpError::Header(HeaderError::BadLength(body.len() as u16)))?;
                let _reserved = cursor.get_u8();
                let safi = cursor
                    .get_u8()
                    .ok_or(BgpError::Header(HeaderError::BadLength(body.len() as u16)))?;
                let family = Family::try_from((afi, safi))
                    .map_err(|_| BgpError::Header(HeaderError::BadType(5)))?;
                Ok(Message::RouteRefresh(family))
            }
            other => Err(BgpError::Header(HeaderError::BadType(other))),
        }
    }
}

/// Validate the 19-byte header, returning (type, total message length)
pub fn decode_header(header: &[u8]) -> Result<(u8, u16), BgpError> {
    if header.len() < HEADER_LENGTH {
        return Err(BgpError::Header(HeaderError::BadLength(header.len() as u16)));
    }
    if header[..16] != MARKER {
        return Err(BgpError::Header(HeaderError::ConnectionNotSynchronized));
    }
    let length = u16::from_be_bytes([header[16], header[17]]);
    if usize::from(length) < HEADER_LENGTH || usize::from(length) > MAX_MESSAGE_LENGTH {
        return Err(BgpError::Header(HeaderError::BadLength(length)));
    }
    let message_type = header[18];
    if !(1..=5).contains(&message_type) {
        return Err(BgpError::Header(HeaderError::BadType(message_type)));
    }
    Ok((message_type, length))
}

#[derive(Clone, Debug, PartialEq)]
pub enum HeaderError {
    ConnectionNotSynchronized,
    BadLength(u16),
    BadType(u8),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderError::ConnectionNotSynchronized => write!(f, "Connection not synchronized"),
            HeaderError::BadLength(length) => write!(f, "Bad message length [{}]", length),
            HeaderError::BadType(t) => write!(f, "Bad message type [{}]", t),
        }
    }
}

/// Typed decode/validation error, mapped to a NOTIFICATION by the session layer
#[derive(Clone, Debug, PartialEq)]
pub enum BgpError {
    Header(HeaderError),
    Open(open::OpenError),
    Update(update::UpdateError),
}

impl fmt::Display for BgpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BgpError::Header(err) => write!(f, "Message header error: {}", err),
            BgpError::Open(err) => write!(f, "OPEN message error: {}", err),
            BgpError::Update(err) => write!(f, "UPDATE message error: {}", err),
        }
    }
}

impl std::error::Error for BgpError {}

impl From<open::OpenError> for BgpError {
    fn from(err: open::OpenError) -> Self {
        BgpError::Open(err)
    }
}

impl From<update::UpdateError> for BgpError {
    fn from(err: update::UpdateError) -> Self {
        BgpError::Update(err)
    }
}

pub(crate) use crate::utils::Cursor;
