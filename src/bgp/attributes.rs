use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use ipnetwork::IpNetwork;

use super::community::Community;
use super::update::{decode_prefix, encode_prefix, UpdateError};
use super::{Afi, Cursor, Family};
use crate::utils::{bytes_to_ipv6, u32_to_dotted};

pub mod flags {
    pub const OPTIONAL: u8 = 0x80;
    pub const TRANSITIVE: u8 = 0x40;
    pub const PARTIAL: u8 = 0x20;
    pub const EXTENDED_LENGTH: u8 = 0x10;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    WellKnownMandatory,
    WellKnownDiscretionary,
    OptionalTransitive,
    OptionalNonTransitive,
}

impl Category {
    /// The flag bits (ignoring Partial/Extended-Length) this category requires
    pub fn base_flags(self) -> u8 {
        match self {
            Category::WellKnownMandatory | Category::WellKnownDiscretionary => flags::TRANSITIVE,
            Category::OptionalTransitive => flags::OPTIONAL | flags::TRANSITIVE,
            Category::OptionalNonTransitive => flags::OPTIONAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl Origin {
    pub fn code(self) -> u8 {
        match self {
            Origin::Igp => 0,
            Origin::Egp => 1,
            Origin::Incomplete => 2,
        }
    }
}

impl TryFrom<u8> for Origin {
    type Error = UpdateError;

    fn try_from(value: u8) -> Result<Self, UpdateError> {
        match value {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            other => Err(UpdateError::InvalidOrigin(other)),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Origin::Igp => write!(f, "IGP"),
            Origin::Egp => write!(f, "EGP"),
            Origin::Incomplete => write!(f, "Incomplete"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    AsSequence(Vec<u32>),
    AsSet(Vec<u32>),
}

impl Segment {
    /// Path-length contribution: an AS_SET counts as 1 [RFC 4271 9.1.2.2a]
    pub fn length(&self) -> u32 {
        match self {
            Segment::AsSequence(asns) => asns.len() as u32,
            Segment::AsSet(_) => 1,
        }
    }

    pub fn asns(&self) -> &[u32] {
        match self {
            Segment::AsSequence(asns) | Segment::AsSet(asns) => asns,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AsPath {
    pub segments: Vec<Segment>,
}

impl AsPath {
    pub fn empty() -> Self {
        Self { segments: vec![] }
    }

    pub fn from_sequence(asns: Vec<u32>) -> Self {
        Self {
            segments: vec![Segment::AsSequence(asns)],
        }
    }

    pub fn length(&self) -> u32 {
        self.segments.iter().map(Segment::length).sum()
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|s| s.asns().contains(&asn))
    }

    /// Leftmost AS in the first AS_SEQUENCE (the neighboring AS for MED comparison)
    pub fn first_asn(&self) -> Option<u32> {
        self.segments.first().and_then(|s| match s {
            Segment::AsSequence(asns) => asns.first().copied(),
            Segment::AsSet(_) => None,
        })
    }

    /// Rightmost AS: the route's originator (used for RPKI validation)
    pub fn origin_asn(&self) -> Option<u32> {
        self.segments.last().and_then(|s| match s {
            Segment::AsSequence(asns) => asns.last().copied(),
            Segment::AsSet(_) => None,
        })
    }

    pub fn prepend(&mut self, asn: u32, count: u8) {
        let prefix = vec![asn; count as usize];
        match self.segments.first_mut() {
            Some(Segment::AsSequence(asns)) => {
                asns.splice(0..0, prefix);
            }
            _ => self.segments.insert(0, Segment::AsSequence(prefix)),
        }
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = self
            .segments
            .iter()
            .map(|segment| {
                let asns = segment
                    .asns()
                    .iter()
                    .map(|asn| u32_to_dotted(*asn, '.'))
                    .collect::<Vec<String>>()
                    .join(" ");
                match segment {
                    Segment::AsSequence(_) => asns,
                    Segment::AsSet(_) => format!("{{{}}}", asns),
                }
            })
            .collect::<Vec<String>>()
            .join("; ");
        write!(f, "{}", display)
    }
}

/// Next-hop and prefixes for a negotiated (AFI, SAFI) [RFC 4760]
#[derive(Clone, Debug, PartialEq)]
pub struct MpReach {
    pub family: Family,
    pub next_hop: IpAddr,
    pub link_local: Option<Ipv6Addr>,
    pub nlri: Vec<IpNetwork>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MpUnreach {
    pub family: Family,
    pub withdrawn: Vec<IpNetwork>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PathAttribute {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { asn: u32, speaker: Ipv4Addr },
    Communities(Vec<Community>),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    MpReachNlri(MpReach),
    MpUnreachNlri(MpUnreach),
    /// Unknown optional attribute carried through unmodified (transitive only)
    Unrecognized {
        type_code: u8,
        attr_flags: u8,
        value: Vec<u8>,
    },
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => 1,
            PathAttribute::AsPath(_) => 2,
            PathAttribute::NextHop(_) => 3,
            PathAttribute::MultiExitDisc(_) => 4,
            PathAttribute::LocalPref(_) => 5,
            PathAttribute::AtomicAggregate => 6,
            PathAttribute::Aggregator { .. } => 7,
            PathAttribute::Communities(_) => 8,
            PathAttribute::OriginatorId(_) => 9,
            PathAttribute::ClusterList(_) => 10,
            PathAttribute::MpReachNlri(_) => 14,
            PathAttribute::MpUnreachNlri(_) => 15,
            PathAttribute::Unrecognized { type_code, .. } => *type_code,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            PathAttribute::Origin(_) | PathAttribute::AsPath(_) | PathAttribute::NextHop(_) => {
                Category::WellKnownMandatory
            }
            PathAttribute::LocalPref(_) | PathAttribute::AtomicAggregate => {
                Category::WellKnownDiscretionary
            }
            PathAttribute::Aggregator { .. }
            | PathAttribute::Communities(_)
            | PathAttribute::Unrecognized { .. } => Category::OptionalTransitive,
            PathAttribute::MultiExitDisc(_)
            | PathAttribute::OriginatorId(_)
            | PathAttribute::ClusterList(_)
            | PathAttribute::MpReachNlri(_)
            | PathAttribute::MpUnreachNlri(_) => Category::OptionalNonTransitive,
        }
    }

    fn encode_value(&self, buf: &mut BytesMut, four_octet_asn: bool) {
        match self {
            PathAttribute::Origin(origin) => buf.put_u8(origin.code()),
            PathAttribute::AsPath(as_path) => {
                for segment in &as_path.segments {
                    let (segment_type, asns) = match segment {
                        Segment::AsSet(asns) => (1u8, asns),
                        Segment::AsSequence(asns) => (2u8, asns),
                    };
                    // Segments hold at most 255 ASNs on the wire
                    for chunk in asns.chunks(255) {
                        buf.put_u8(segment_type);
                        buf.put_u8(chunk.len() as u8);
                        for asn in chunk {
                            if four_octet_asn {
                                buf.put_u32(*asn);
                            } else {
                                buf.put_u16(if *asn > u32::from(u16::MAX) {
                                    // AS_TRANS [RFC 6793]
                                    23456
                                } else {
                                    *asn as u16
                                });
                            }
                        }
                    }
                }
            }
            PathAttribute::NextHop(next_hop) => buf.put_slice(&next_hop.octets()),
            PathAttribute::MultiExitDisc(med) => buf.put_u32(*med),
            PathAttribute::LocalPref(local_pref) => buf.put_u32(*local_pref),
            PathAttribute::AtomicAggregate => (),
            PathAttribute::Aggregator { asn, speaker } => {
                if four_octet_asn {
                    buf.put_u32(*asn);
                } else {
                    buf.put_u16(*asn as u16);
                }
                buf.put_slice(&speaker.octets());
            }
            PathAttribute::Communities(communities) => {
                for community in communities {
                    buf.put_u32(community.0);
                }
            }
            PathAttribute::OriginatorId(originator) => buf.put_slice(&originator.octets()),
            PathAttribute::ClusterList(cluster_ids) => {
                for cluster_id in cluster_ids {
                    buf.put_slice(&cluster_id.octets());
                }
            }
            PathAttribute::MpReachNlri(mp_reach) => {
                buf.put_u16(mp_reach.family.afi.code());
                buf.put_u8(mp_reach.family.safi.code());
                match (mp_reach.next_hop, mp_reach.link_local) {
                    (IpAddr::V4(next_hop), _) => {
                        buf.put_u8(4);
                        buf.put_slice(&next_hop.octets());
                    }
                    (IpAddr::V6(next_hop), None) => {
                        buf.put_u8(16);
                        buf.put_slice(&next_hop.octets());
                    }
                    (IpAddr::V6(next_hop), Some(link_local)) => {
                        buf.put_u8(32);
                        buf.put_slice(&next_hop.octets());
                        buf.put_slice(&link_local.octets());
                    }
                }
                buf.put_u8(0); // Reserved
                for prefix in &mp_reach.nlri {
                    encode_prefix(prefix, buf);
                }
            }
            PathAttribute::MpUnreachNlri(mp_unreach) => {
                buf.put_u16(mp_unreach.family.afi.code());
                buf.put_u8(mp_unreach.family.safi.code());
                for prefix in &mp_unreach.withdrawn {
                    encode_prefix(prefix, buf);
                }
            }
            PathAttribute::Unrecognized { value, .. } => buf.put_slice(value),
        }
    }

    /// Encode with flags and (extended when needed) length octets
    pub fn encode(&self, buf: &mut BytesMut, four_octet_asn: bool) {
        let mut value = BytesMut::with_capacity(8);
        self.encode_value(&mut value, four_octet_asn);

        let mut attr_flags = match self {
            PathAttribute::Unrecognized { attr_flags, .. } => {
                (attr_flags & !flags::EXTENDED_LENGTH) | flags::PARTIAL
            }
            _ => self.category().base_flags(),
        };
        if value.len() > 255 {
            attr_flags |= flags::EXTENDED_LENGTH;
        }
        buf.put_u8(attr_flags);
        buf.put_u8(self.type_code());
        if attr_flags & flags::EXTENDED_LENGTH != 0 {
            buf.put_u16(value.len() as u16);
        } else {
            buf.put_u8(value.len() as u8);
        }
        buf.put_slice(&value);
    }

    /// Decode a single attribute value; flags have already been read
    pub fn decode(
        attr_flags: u8,
        type_code: u8,
        value: &[u8],
        four_octet_asn: bool,
    ) -> Result<PathAttribute, UpdateError> {
        let attribute = match type_code {
            1 => {
                if value.len() != 1 {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                PathAttribute::Origin(Origin::try_from(value[0])?)
            }
            2 => PathAttribute::AsPath(decode_as_path(value, four_octet_asn)?),
            3 => {
                if value.len() != 4 {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                let next_hop = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                if next_hop.is_unspecified() {
                    return Err(UpdateError::InvalidNextHop);
                }
                PathAttribute::NextHop(next_hop)
            }
            4 => PathAttribute::MultiExitDisc(decode_u32_value(type_code, value)?),
            5 => PathAttribute::LocalPref(decode_u32_value(type_code, value)?),
            6 => {
                if !value.is_empty() {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                PathAttribute::AtomicAggregate
            }
            7 => {
                let mut cursor = Cursor::new(value);
                let asn = if four_octet_asn {
                    cursor.get_u32()
                } else {
                    cursor.get_u16().map(u32::from)
                }
                .ok_or(UpdateError::AttributeLength { type_code })?;
                let speaker = cursor
                    .take(4)
                    .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
                    .ok_or(UpdateError::AttributeLength { type_code })?;
                if cursor.remaining() != 0 {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                PathAttribute::Aggregator { asn, speaker }
            }
            8 => {
                if value.len() % 4 != 0 {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                let communities = value
                    .chunks(4)
                    .map(|b| Community(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
                    .collect();
                PathAttribute::Communities(communities)
            }
            9 => {
                if value.len() != 4 {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                PathAttribute::OriginatorId(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
            }
            10 => {
                if value.len() % 4 != 0 {
                    return Err(UpdateError::AttributeLength { type_code });
                }
                let cluster_ids = value
                    .chunks(4)
                    .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
                    .collect();
                PathAttribute::ClusterList(cluster_ids)
            }
            14 => PathAttribute::MpReachNlri(decode_mp_reach(value)?),
            15 => PathAttribute::MpUnreachNlri(decode_mp_unreach(value)?),
            _ => {
                if attr_flags & flags::OPTIONAL == 0 {
                    return Err(UpdateError::UnrecognizedWellKnown(type_code));
                }
                if attr_flags & flags::TRANSITIVE == 0 {
                    // Unrecognized non-transitive optional attributes are quietly ignored
                    return Err(UpdateError::IgnoredOptional { type_code });
                }
                return Ok(PathAttribute::Unrecognized {
                    type_code,
                    attr_flags,
                    value: value.to_vec(),
                });
            }
        };

        let base = attr_flags & (flags::OPTIONAL | flags::TRANSITIVE);
        if base != attribute.category().base_flags() {
            return Err(UpdateError::AttributeFlags {
                type_code,
                flags: attr_flags,
            });
        }
        Ok(attribute)
    }
}

fn decode_u32_value(type_code: u8, value: &[u8]) -> Result<u32, UpdateError> {
    if value.len() != 4 {
        return Err(UpdateError::AttributeLength { type_code });
    }
    Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

fn decode_as_path(value: &[u8], four_octet_asn: bool) -> Result<AsPath, UpdateError> {
    let mut cursor = Cursor::new(value);
    let mut segments = Vec::with_capacity(1);
    while cursor.remaining() > 0 {
        let segment_type = cursor.get_u8().ok_or(UpdateError::MalformedAsPath)?;
        let count = cursor.get_u8().ok_or(UpdateError::MalformedAsPath)?;
        let mut asns = Vec::with_capacity(count.into());
        for _ in 0..count {
            let asn = if four_octet_asn {
                cursor.get_u32()
            } else {
                cursor.get_u16().map(u32::from)
            }
            .ok_or(UpdateError::MalformedAsPath)?;
            asns.push(asn);
        }
        match segment_type {
            1 => segments.push(Segment::AsSet(asns)),
            2 => segments.push(Segment::AsSequence(asns)),
            _ => return Err(UpdateError::MalformedAsPath),
        }
    }
    Ok(AsPath { segments })
}

fn decode_mp_reach(value: &[u8]) -> Result<MpReach, UpdateError> {
    let type_code = 14;
    let mut cursor = Cursor::new(value);
    let afi = cursor
        .get_u16()
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let safi = cursor
        .get_u8()
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let family =
        Family::try_from((afi, safi)).map_err(|_| UpdateError::OptionalAttribute { type_code })?;
    let next_hop_len = cursor
        .get_u8()
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let next_hop_bytes = cursor
        .take(next_hop_len.into())
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let (next_hop, link_local) = match next_hop_len {
        4 => (
            IpAddr::from(Ipv4Addr::new(
                next_hop_bytes[0],
                next_hop_bytes[1],
                next_hop_bytes[2],
                next_hop_bytes[3],
            )),
            None,
        ),
        16 => (IpAddr::V6(bytes_to_ipv6(next_hop_bytes)), None),
        32 => (
            IpAddr::V6(bytes_to_ipv6(&next_hop_bytes[..16])),
            Some(bytes_to_ipv6(&next_hop_bytes[16..])),
        ),
        _ => return Err(UpdateError::InvalidNextHop),
    };
    let _reserved = cursor
        .get_u8()
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let mut nlri = Vec::new();
    while cursor.remaining() > 0 {
        nlri.push(decode_prefix(family.afi, &mut cursor)?);
    }
    Ok(MpReach {
        family,
        next_hop,
        link_local,
        nlri,
    })
}

fn decode_mp_unreach(value: &[u8]) -> Result<MpUnreach, UpdateError> {
    let type_code = 15;
    let mut cursor = Cursor::new(value);
    let afi = cursor
        .get_u16()
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let safi = cursor
        .get_u8()
        .ok_or(UpdateError::AttributeLength { type_code })?;
    let family =
        Family::try_from((afi, safi)).map_err(|_| UpdateError::OptionalAttribute { type_code })?;
    let mut withdrawn = Vec::new();
    while cursor.remaining() > 0 {
        withdrawn.push(decode_prefix(family.afi, &mut cursor)?);
    }
    Ok(MpUnreach { family, withdrawn })
}
