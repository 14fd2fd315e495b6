use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::packet::PacketError;
use crate::utils::Cursor;

/// LSAs at MaxAge are flushed from the domain
pub const MAX_AGE: u16 = 3600;
/// Age difference below which two instances are considered simultaneous
pub const MAX_AGE_DIFF: u16 = 900;
/// Self-originated LSAs are refreshed this often (seconds)
pub const LS_REFRESH_TIME: u16 = 1800;
/// First sequence number assigned to a new LSA instance
pub const INITIAL_SEQUENCE: u32 = 0x8000_0001;

pub const HEADER_LENGTH: usize = 20;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LsType {
    Router,
    Network,
    Summary,
    AsbrSummary,
    External,
}

impl LsType {
    pub fn code(self) -> u8 {
        match self {
            LsType::Router => 1,
            LsType::Network => 2,
            LsType::Summary => 3,
            LsType::AsbrSummary => 4,
            LsType::External => 5,
        }
    }
}

impl TryFrom<u8> for LsType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            1 => Ok(LsType::Router),
            2 => Ok(LsType::Network),
            3 => Ok(LsType::Summary),
            4 => Ok(LsType::AsbrSummary),
            5 => Ok(LsType::External),
            other => Err(PacketError::UnknownLsType(other)),
        }
    }
}

impl fmt::Display for LsType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LsType::Router => write!(f, "Router"),
            LsType::Network => write!(f, "Network"),
            LsType::Summary => write!(f, "Summary"),
            LsType::AsbrSummary => write!(f, "ASBR-Summary"),
            LsType::External => write!(f, "External"),
        }
    }
}

/// The LSDB identity of an LSA instance
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LsaKey {
    pub ls_type: LsType,
    pub id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
}

impl fmt::Display for LsaKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}[{} from {}]",
            self.ls_type, self.id, self.advertising_router
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LsaHeader {
    pub age: u16,
    pub options: u8,
    pub ls_type: LsType,
    pub id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
    pub sequence: u32,
    pub checksum: u16,
    pub length: u16,
}

impl LsaHeader {
    pub fn key(&self) -> LsaKey {
        LsaKey {
            ls_type: self.ls_type,
            id: self.id,
            advertising_router: self.advertising_router,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.age);
        buf.put_u8(self.options);
        buf.put_u8(self.ls_type.code());
        buf.put_slice(&self.id.octets());
        buf.put_slice(&self.advertising_router.octets());
        buf.put_u32(self.sequence);
        buf.put_u16(self.checksum);
        buf.put_u16(self.length);
    }

    pub fn decode(cursor: &mut Cursor) -> Result<LsaHeader, PacketError> {
        let age = cursor.get_u16().ok_or(PacketError::Truncated)?;
        let options = cursor.get_u8().ok_or(PacketError::Truncated)?;
        let ls_type = LsType::try_from(cursor.get_u8().ok_or(PacketError::Truncated)?)?;
        let id = read_addr(cursor)?;
        let advertising_router = read_addr(cursor)?;
        let sequence = cursor.get_u32().ok_or(PacketError::Truncated)?;
        let checksum = cursor.get_u16().ok_or(PacketError::Truncated)?;
        let length = cursor.get_u16().ok_or(PacketError::Truncated)?;
        Ok(LsaHeader {
            age,
            options,
            ls_type,
            id,
            advertising_router,
            sequence,
            checksum,
            length,
        })
    }
}

/// Which of two instances of the same LSA is more recent [RFC 2328 13.1]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Newness {
    Newer,
    Same,
    Older,
}

impl LsaHeader {
    pub fn compare(&self, other: &LsaHeader) -> Newness {
        // Sequence numbers are signed on the wire
        let (own, theirs) = (self.sequence as i32, other.sequence as i32);
        if own != theirs {
            return if own > theirs {
                Newness::Newer
            } else {
                Newness::Older
            };
        }
        if self.checksum != other.checksum {
            return if self.checksum > other.checksum {
                Newness::Newer
            } else {
                Newness::Older
            };
        }
        match (self.age >= MAX_AGE, other.age >= MAX_AGE) {
            (true, false) => return Newness::Newer,
            (false, true) => return Newness::Older,
            _ => (),
        }
        if self.age.abs_diff(other.age) > MAX_AGE_DIFF {
            return if self.age < other.age {
                Newness::Newer
            } else {
                Newness::Older
            };
        }
        Newness::Same
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkKind {
    PointToPoint,
    Transit,
    Stub,
    Virtual,
}

impl LinkKind {
    pub fn code(self) -> u8 {
        match self {
            LinkKind::PointToPoint => 1,
            LinkKind::Transit => 2,
            LinkKind::Stub => 3,
            LinkKind::Virtual => 4,
        }
    }
}

impl TryFrom<u8> for LinkKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            1 => Ok(LinkKind::PointToPoint),
            2 => Ok(LinkKind::Transit),
            3 => Ok(LinkKind::Stub),
            4 => Ok(LinkKind::Virtual),
            other => Err(PacketError::UnknownLinkType(other)),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterLink {
    /// Neighbor router-id, transit DR address, or stub network address
    pub id: Ipv4Addr,
    /// Local interface address, or stub network mask
    pub data: Ipv4Addr,
    pub kind: LinkKind,
    pub metric: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LsaBody {
    Router {
        flags: u8,
        links: Vec<RouterLink>,
    },
    Network {
        mask: Ipv4Addr,
        attached: Vec<Ipv4Addr>,
    },
    Summary {
        mask: Ipv4Addr,
        metric: u32,
    },
    AsbrSummary {
        mask: Ipv4Addr,
        metric: u32,
    },
    External {
        mask: Ipv4Addr,
        type2: bool,
        metric: u32,
        forwarding: Ipv4Addr,
        tag: u32,
    },
}

impl LsaBody {
    pub fn ls_type(&self) -> LsType {
        match self {
            LsaBody::Router { .. } => LsType::Router,
            LsaBody::Network { .. } => LsType::Network,
            LsaBody::Summary { .. } => LsType::Summary,
            LsaBody::AsbrSummary { .. } => LsType::AsbrSummary,
            LsaBody::External { .. } => LsType::External,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            LsaBody::Router { flags, links } => {
                buf.put_u8(*flags);
                buf.put_u8(0);
                buf.put_u16(links.len() as u16);
                for link in links {
                    buf.put_slice(&link.id.octets());
                    buf.put_slice(&link.data.octets());
                    buf.put_u8(link.kind.code());
                    buf.put_u8(0); // TOS count
                    buf.put_u16(link.metric);
                }
            }
            LsaBody::Network { mask, attached } => {
                buf.put_slice(&mask.octets());
                for router in attached {
                    buf.put_slice(&router.octets());
                }
            }
            LsaBody::Summary { mask, metric } | LsaBody::AsbrSummary { mask, metric } => {
                buf.put_slice(&mask.octets());
                buf.put_u32(metric & 0x00ff_ffff);
            }
            LsaBody::External {
                mask,
                type2,
                metric,
                forwarding,
                tag,
            } => {
                buf.put_slice(&mask.octets());
                let mut metric_word = metric & 0x00ff_ffff;
                if *type2 {
                    metric_word |= 0x8000_0000;
                }
                buf.put_u32(metric_word);
                buf.put_slice(&forwarding.octets());
                buf.put_u32(*tag);
            }
        }
    }

    fn decode(ls_type: LsType, cursor: &mut Cursor) -> Result<LsaBody, PacketError> {
        match ls_type {
            LsType::Router => {
                let flags = cursor.get_u8().ok_or(PacketError::Truncated)?;
                let _reserved = cursor.get_u8().ok_or(PacketError::Truncated)?;
                let count = cursor.get_u16().ok_or(PacketError::Truncated)?;
                let mut links = Vec::with_capacity(count.into());
                for _ in 0..count {
                    let id = read_addr(cursor)?;
                    let data = read_addr(cursor)?;
                    let kind = LinkKind::try_from(cursor.get_u8().ok_or(PacketError::Truncated)?)?;
                    let tos_count = cursor.get_u8().ok_or(PacketError::Truncated)?;
                    let metric = cursor.get_u16().ok_or(PacketError::Truncated)?;
                    // TOS metrics are obsolete, skip them
                    cursor
                        .take(usize::from(tos_count) * 4)
                        .ok_or(PacketError::Truncated)?;
                    links.push(RouterLink {
                        id,
                        data,
                        kind,
                        metric,
                    });
                }
                Ok(LsaBody::Router { flags, links })
            }
            LsType::Network => {
                let mask = read_addr(cursor)?;
                let mut attached = Vec::with_capacity(2);
                while cursor.remaining() >= 4 {
                    attached.push(read_addr(cursor)?);
                }
                Ok(LsaBody::Network { mask, attached })
            }
            LsType::Summary | LsType::AsbrSummary => {
                let mask = read_addr(cursor)?;
                let metric = cursor.get_u32().ok_or(PacketError::Truncated)? & 0x00ff_ffff;
                if ls_type == LsType::Summary {
                    Ok(LsaBody::Summary { mask, metric })
                } else {
                    Ok(LsaBody::AsbrSummary { mask, metric })
                }
            }
            LsType::External => {
                let mask = read_addr(cursor)?;
                let metric_word = cursor.get_u32().ok_or(PacketError::Truncated)?;
                let forwarding = read_addr(cursor)?;
                let tag = cursor.get_u32().ok_or(PacketError::Truncated)?;
                Ok(LsaBody::External {
                    mask,
                    type2: metric_word & 0x8000_0000 != 0,
                    metric: metric_word & 0x00ff_ffff,
                    forwarding,
                    tag,
                })
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lsa {
    pub header: LsaHeader,
    pub body: LsaBody,
}

impl Lsa {
    /// Build an LSA, filling in length and checksum
    pub fn new(age: u16, options: u8, id: Ipv4Addr, advertising_router: Ipv4Addr, sequence: u32, body: LsaBody) -> Lsa {
        let mut lsa = Lsa {
            header: LsaHeader {
                age,
                options,
                ls_type: body.ls_type(),
                id,
                advertising_router,
                sequence,
                checksum: 0,
                length: 0,
            },
            body,
        };
        lsa.finalize();
        lsa
    }

    pub fn key(&self) -> LsaKey {
        self.header.key()
    }

    /// Recompute length and Fletcher checksum after any mutation
    pub fn finalize(&mut self) {
        let mut buf = BytesMut::with_capacity(64);
        self.header.checksum = 0;
        self.header.length = 0;
        self.header.encode(&mut buf);
        self.body.encode(&mut buf);
        let length = buf.len() as u16;
        self.header.length = length;
        buf[18..20].copy_from_slice(&length.to_be_bytes());
        // Checksum covers everything after the age field
        self.header.checksum = fletcher16(&buf[2..], 14);
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        self.body.encode(buf);
    }

    /// Decode one LSA and verify its checksum
    pub fn decode(cursor: &mut Cursor) -> Result<Lsa, PacketError> {
        let header = LsaHeader::decode(cursor)?;
        if usize::from(header.length) < HEADER_LENGTH {
            return Err(PacketError::Truncated);
        }
        let body_bytes = cursor
            .take(usize::from(header.length) - HEADER_LENGTH)
            .ok_or(PacketError::Truncated)?;

        let mut check = BytesMut::with_capacity(header.length.into());
        let mut zeroed = header.clone();
        zeroed.checksum = 0;
        zeroed.encode(&mut check);
        check.put_slice(body_bytes);
        let expected = fletcher16(&check[2..], 14);
        if expected != header.checksum {
            return Err(PacketError::LsaChecksum {
                expected,
                found: header.checksum,
            });
        }

        let mut body_cursor = Cursor::new(body_bytes);
        let body = LsaBody::decode(header.ls_type, &mut body_cursor)?;
        Ok(Lsa { header, body })
    }

    /// The verbatim copy sent when flushing: same instance at MaxAge
    pub fn at_max_age(&self) -> Lsa {
        let mut lsa = self.clone();
        lsa.header.age = MAX_AGE;
        lsa
    }
}

fn read_addr(cursor: &mut Cursor) -> Result<Ipv4Addr, PacketError> {
    cursor
        .take(4)
        .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        .ok_or(PacketError::Truncated)
}

/// Fletcher-16 checkword (RFC 905 Annex B) over `data` with the two
/// checksum octets (at `checksum_pos`, already zeroed) placed so the
/// whole block sums to zero.
pub(crate) fn fletcher16(data: &[u8], checksum_pos: usize) -> u16 {
    let mut c0: i64 = 0;
    let mut c1: i64 = 0;
    for byte in data {
        c0 = (c0 + i64::from(*byte)) % 255;
        c1 = (c1 + c0) % 255;
    }
    let length = data.len() as i64;
    let mut x = ((length - checksum_pos as i64 - 1) * c0 - c1) % 255;
    if x <= 0 {
        x += 255;
    }
    let mut y = 510 - c0 - x;
    if y > 255 {
        y -= 255;
    }
    ((x as u16) << 8) | (y as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_lsa(sequence: u32) -> Lsa {
        Lsa::new(
            1,
            0x02,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            sequence,
            LsaBody::Router {
                flags: 0,
                links: vec![RouterLink {
                    id: Ipv4Addr::new(10, 0, 0, 2),
                    data: Ipv4Addr::new(192, 0, 2, 1),
                    kind: LinkKind::PointToPoint,
                    metric: 10,
                }],
            },
        )
    }

    #[test]
    fn test_lsa_round_trip() {
        let lsa = router_lsa(INITIAL_SEQUENCE);
        let mut buf = BytesMut::new();
        lsa.encode(&mut buf);
        let mut cursor = Cursor::new(&buf);
        let decoded = Lsa::decode(&mut cursor).unwrap();
        assert_eq!(decoded, lsa);
    }

    #[test]
    fn test_lsa_checksum_detects_corruption() {
        let lsa = router_lsa(INITIAL_SEQUENCE);
        let mut buf = BytesMut::new();
        lsa.encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let mut cursor = Cursor::new(&buf);
        assert!(matches!(
            Lsa::decode(&mut cursor),
            Err(PacketError::LsaChecksum { .. })
        ));
    }

    #[test]
    fn test_newness_by_sequence() {
        let older = router_lsa(INITIAL_SEQUENCE);
        let newer = router_lsa(INITIAL_SEQUENCE + 1);
        assert_eq!(newer.header.compare(&older.header), Newness::Newer);
        assert_eq!(older.header.compare(&newer.header), Newness::Older);
    }

    #[test]
    fn test_newness_max_age_wins() {
        let fresh = router_lsa(INITIAL_SEQUENCE);
        let mut flushed = fresh.clone();
        flushed.header.age = MAX_AGE;
        assert_eq!(flushed.header.compare(&fresh.header), Newness::Newer);
    }

    #[test]
    fn test_newness_same_instance() {
        let a = router_lsa(INITIAL_SEQUENCE);
        let mut b = a.clone();
        b.header.age += 5;
        assert_eq!(a.header.compare(&b.header), Newness::Same);
    }

    #[test]
    fn test_newness_large_age_difference() {
        let a = router_lsa(INITIAL_SEQUENCE);
        let mut b = a.clone();
        b.header.age = a.header.age + MAX_AGE_DIFF + 1;
        assert_eq!(a.header.compare(&b.header), Newness::Newer);
    }

    #[test]
    fn test_external_round_trip() {
        let lsa = Lsa::new(
            1,
            0x02,
            Ipv4Addr::new(203, 0, 113, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            INITIAL_SEQUENCE,
            LsaBody::External {
                mask: Ipv4Addr::new(255, 255, 255, 0),
                type2: true,
                metric: 20,
                forwarding: Ipv4Addr::UNSPECIFIED,
                tag: 0,
            },
        );
        let mut buf = BytesMut::new();
        lsa.encode(&mut buf);
        let mut cursor = Cursor::new(&buf);
        assert_eq!(Lsa::decode(&mut cursor).unwrap(), lsa);
    }
}
