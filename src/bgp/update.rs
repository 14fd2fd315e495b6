use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use itertools::Itertools;

use super::attributes::{flags, PathAttribute};
use super::notification::UpdateHandling;
use super::{Afi, BgpError, Capabilities, Cursor};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateError {
    MalformedAttributeList,
    UnrecognizedWellKnown(u8),
    MissingWellKnown(u8),
    AttributeFlags { type_code: u8, flags: u8 },
    AttributeLength { type_code: u8 },
    InvalidOrigin(u8),
    InvalidNextHop,
    OptionalAttribute { type_code: u8 },
    InvalidNetworkField,
    MalformedAsPath,
    /// Unrecognized non-transitive optional attribute; dropped, never fatal
    IgnoredOptional { type_code: u8 },
}

impl UpdateError {
    /// Session impact per RFC 7606 revised error handling
    pub fn handling(&self) -> UpdateHandling {
        match self {
            UpdateError::MalformedAttributeList
            | UpdateError::UnrecognizedWellKnown(_)
            | UpdateError::MissingWellKnown(_)
            | UpdateError::InvalidNetworkField => UpdateHandling::SessionReset,
            UpdateError::AttributeFlags { .. }
            | UpdateError::AttributeLength { .. }
            | UpdateError::InvalidOrigin(_)
            | UpdateError::InvalidNextHop
            | UpdateError::OptionalAttribute { .. }
            | UpdateError::MalformedAsPath
            | UpdateError::IgnoredOptional { .. } => UpdateHandling::TreatAsWithdraw,
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpdateError::MalformedAttributeList => write!(f, "Malformed attribute list"),
            UpdateError::UnrecognizedWellKnown(t) => {
                write!(f, "Unrecognized well-known attribute [{}]", t)
            }
            UpdateError::MissingWellKnown(t) => {
                write!(f, "Missing well-known attribute [{}]", t)
            }
            UpdateError::AttributeFlags { type_code, flags } => {
                write!(f, "Attribute flags error [type={} flags={:#x}]", type_code, flags)
            }
            UpdateError::AttributeLength { type_code } => {
                write!(f, "Attribute length error [type={}]", type_code)
            }
            UpdateError::InvalidOrigin(value) => write!(f, "Invalid ORIGIN value [{}]", value),
            UpdateError::InvalidNextHop => write!(f, "Invalid NEXT_HOP"),
            UpdateError::OptionalAttribute { type_code } => {
                write!(f, "Optional attribute error [type={}]", type_code)
            }
            UpdateError::InvalidNetworkField => write!(f, "Invalid network field"),
            UpdateError::MalformedAsPath => write!(f, "Malformed AS_PATH"),
            UpdateError::IgnoredOptional { type_code } => {
                write!(f, "Ignored optional attribute [type={}]", type_code)
            }
        }
    }
}

impl std::error::Error for UpdateError {}

/// Encode a prefix as (length-in-bits, masked prefix octets)
pub(crate) fn encode_prefix(prefix: &IpNetwork, buf: &mut BytesMut) {
    let length = prefix.prefix();
    let octets = (usize::from(length) + 7) / 8;
    buf.put_u8(length);
    match prefix {
        IpNetwork::V4(v4) => buf.put_slice(&v4.network().octets()[..octets]),
        IpNetwork::V6(v6) => buf.put_slice(&v6.network().octets()[..octets]),
    }
}

/// Decode a (length, prefix) pair for the given address family
pub(crate) fn decode_prefix(afi: Afi, cursor: &mut Cursor) -> Result<IpNetwork, UpdateError> {
    let length = cursor.get_u8().ok_or(UpdateError::InvalidNetworkField)?;
    let max_length = match afi {
        Afi::Ipv4 => 32,
        Afi::Ipv6 => 128,
    };
    if length > max_length {
        return Err(UpdateError::InvalidNetworkField);
    }
    let octets = (usize::from(length) + 7) / 8;
    let bytes = cursor
        .take(octets)
        .ok_or(UpdateError::InvalidNetworkField)?;
    match afi {
        Afi::Ipv4 => {
            let mut addr = [0u8; 4];
            addr[..octets].copy_from_slice(bytes);
            mask_trailing_bits(&mut addr, length);
            Ipv4Network::new(Ipv4Addr::from(addr), length)
                .map(IpNetwork::V4)
                .map_err(|_| UpdateError::InvalidNetworkField)
        }
        Afi::Ipv6 => {
            let mut addr = [0u8; 16];
            addr[..octets].copy_from_slice(bytes);
            mask_trailing_bits(&mut addr, length);
            Ipv6Network::new(Ipv6Addr::from(addr), length)
                .map(IpNetwork::V6)
                .map_err(|_| UpdateError::InvalidNetworkField)
        }
    }
}

// Zero any set bits past the prefix length
fn mask_trailing_bits(addr: &mut [u8], length: u8) {
    let length = usize::from(length);
    for (i, byte) in addr.iter_mut().enumerate() {
        let bit_offset = i * 8;
        if bit_offset >= length {
            *byte = 0;
        } else if bit_offset + 8 > length {
            let keep = length - bit_offset;
            *byte &= 0xffu8 << (8 - keep);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    pub withdrawn: Vec<IpNetwork>,
    pub attributes: Vec<PathAttribute>,
    pub announced: Vec<IpNetwork>,
    /// Set when decode hit a treat-as-withdraw class error [RFC 7606]
    pub malformed: Option<UpdateError>,
}

impl Update {
    pub fn get(&self, type_code: u8) -> Option<&PathAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.type_code() == type_code)
    }

    pub fn mp_reach(&self) -> Option<&super::attributes::MpReach> {
        self.attributes.iter().find_map(|attr| match attr {
            PathAttribute::MpReachNlri(mp_reach) => Some(mp_reach),
            _ => None,
        })
    }

    pub fn mp_unreach(&self) -> Option<&super::attributes::MpUnreach> {
        self.attributes.iter().find_map(|attr| match attr {
            PathAttribute::MpUnreachNlri(mp_unreach) => Some(mp_unreach),
            _ => None,
        })
    }

    /// Does this UPDATE announce any reachable NLRI (v4 or MP)?
    pub fn has_announcements(&self) -> bool {
        !self.announced.is_empty() || self.mp_reach().map(|mp| !mp.nlri.is_empty()).unwrap_or(false)
    }

    /// An empty UPDATE is the End-of-RIB marker [RFC 4724]
    pub fn is_end_of_rib(&self) -> bool {
        self.withdrawn.is_empty() && self.announced.is_empty() && self.attributes.is_empty()
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, caps: &Capabilities) -> Result<(), BgpError> {
        let mut withdrawn = BytesMut::with_capacity(4);
        for prefix in &self.withdrawn {
            encode_prefix(prefix, &mut withdrawn);
        }
        buf.put_u16(withdrawn.len() as u16);
        buf.put_slice(&withdrawn);

        let mut attributes = BytesMut::with_capacity(32);
        for attribute in self
            .attributes
            .iter()
            .sorted_by_key(|attr| attr.type_code())
        {
            attribute.encode(&mut attributes, caps.four_octet_asn);
        }
        buf.put_u16(attributes.len() as u16);
        buf.put_slice(&attributes);

        for prefix in &self.announced {
            encode_prefix(prefix, buf);
        }
        Ok(())
    }

    pub(super) fn decode(body: &[u8], caps: &Capabilities) -> Result<Update, BgpError> {
        let mut cursor = Cursor::new(body);
        let mut update = Update::default();

        let withdrawn_length = cursor
            .get_u16()
            .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
        let withdrawn_bytes = cursor
            .take(withdrawn_length.into())
            .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
        let mut withdrawn_cursor = Cursor::new(withdrawn_bytes);
        while withdrawn_cursor.remaining() > 0 {
            update
                .withdrawn
                .push(decode_prefix(Afi::Ipv4, &mut withdrawn_cursor)?);
        }

        let attributes_length = cursor
            .get_u16()
            .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
        let attribute_bytes = cursor
            .take(attributes_length.into())
            .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
        let mut attr_cursor = Cursor::new(attribute_bytes);
        while attr_cursor.remaining() > 0 {
            let attr_flags = attr_cursor
                .get_u8()
                .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
            let type_code = attr_cursor
                .get_u8()
                .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
            let length = if attr_flags & flags::EXTENDED_LENGTH != 0 {
                attr_cursor.get_u16()
            } else {
                attr_cursor.get_u8().map(u16::from)
            }
            .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;
            let value = attr_cursor
                .take(length.into())
                .ok_or(BgpError::Update(UpdateError::MalformedAttributeList))?;

            match PathAttribute::decode(attr_flags, type_code, value, caps.four_octet_asn) {
                Ok(attribute) => {
                    // First occurrence wins on duplicates
                    if update.get(attribute.type_code()).is_none() {
                        update.attributes.push(attribute);
                    }
                }
                Err(UpdateError::IgnoredOptional { .. }) => (),
                Err(err) => match err.handling() {
                    UpdateHandling::SessionReset => return Err(BgpError::Update(err)),
                    UpdateHandling::TreatAsWithdraw => {
                        if update.malformed.is_none() {
                            update.malformed = Some(err);
                        }
                    }
                },
            }
        }

        while cursor.remaining() > 0 {
            update.announced.push(decode_prefix(Afi::Ipv4, &mut cursor)?);
        }

        update.validate()?;
        Ok(update)
    }

    /// Mandatory-attribute checks when any NLRI is announced
    fn validate(&self) -> Result<(), BgpError> {
        if !self.has_announcements() {
            return Ok(());
        }
        // A treat-as-withdraw error already voids the announcement
        if self.malformed.is_some() {
            return Ok(());
        }
        if self.get(1).is_none() {
            return Err(BgpError::Update(UpdateError::MissingWellKnown(1)));
        }
        if self.get(2).is_none() {
            return Err(BgpError::Update(UpdateError::MissingWellKnown(2)));
        }
        if !self.announced.is_empty() && self.get(3).is_none() {
            return Err(BgpError::Update(UpdateError::MissingWellKnown(3)));
        }
        Ok(())
    }
}
