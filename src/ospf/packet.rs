use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::lsa::{Lsa, LsaHeader, LsaKey, LsType};
use crate::utils::Cursor;

pub const OSPF_VERSION: u8 = 2;
pub const HEADER_LENGTH: usize = 24;
/// IP protocol number for OSPF
pub const IP_PROTO_OSPF: i32 = 89;
/// AllSPFRouters multicast group
pub const ALL_SPF_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 5);

/// Options field: E-bit (external routing capable)
pub const OPTIONS_E: u8 = 0x02;

pub mod dd_flags {
    pub const MASTER: u8 = 0x01;
    pub const MORE: u8 = 0x02;
    pub const INIT: u8 = 0x04;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketError {
    Truncated,
    BadVersion(u8),
    BadType(u8),
    BadChecksum { expected: u16, found: u16 },
    BadAuthType(u16),
    LsaChecksum { expected: u16, found: u16 },
    UnknownLsType(u8),
    UnknownLinkType(u8),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Truncated => write!(f, "Truncated packet"),
            PacketError::BadVersion(version) => write!(f, "Bad OSPF version [{}]", version),
            PacketError::BadType(t) => write!(f, "Bad packet type [{}]", t),
            PacketError::BadChecksum { expected, found } => {
                write!(f, "Bad checksum [expected={:#06x} found={:#06x}]", expected, found)
            }
            PacketError::BadAuthType(autype) => write!(f, "Unsupported AuType [{}]", autype),
            PacketError::LsaChecksum { expected, found } => {
                write!(f, "Bad LSA checksum [expected={:#06x} found={:#06x}]", expected, found)
            }
            PacketError::UnknownLsType(t) => write!(f, "Unknown LS type [{}]", t),
            PacketError::UnknownLinkType(t) => write!(f, "Unknown link type [{}]", t),
        }
    }
}

impl std::error::Error for PacketError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hello {
    pub network_mask: Ipv4Addr,
    pub hello_interval: u16,
    pub options: u8,
    pub priority: u8,
    pub dead_interval: u32,
    pub designated_router: Ipv4Addr,
    pub backup_designated_router: Ipv4Addr,
    /// Router-ids seen on this network within the dead interval
    pub neighbors: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatabaseDescription {
    pub mtu: u16,
    pub options: u8,
    pub flags: u8,
    pub sequence: u32,
    pub headers: Vec<LsaHeader>,
}

impl DatabaseDescription {
    pub fn is_init(&self) -> bool {
        self.flags & dd_flags::INIT != 0
    }
    pub fn is_more(&self) -> bool {
        self.flags & dd_flags::MORE != 0
    }
    pub fn is_master(&self) -> bool {
        self.flags & dd_flags::MASTER != 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketBody {
    Hello(Hello),
    DatabaseDescription(DatabaseDescription),
    LinkStateRequest(Vec<LsaKey>),
    LinkStateUpdate(Vec<Lsa>),
    LinkStateAck(Vec<LsaHeader>),
}

impl PacketBody {
    pub fn packet_type(&self) -> u8 {
        match self {
            PacketBody::Hello(_) => 1,
            PacketBody::DatabaseDescription(_) => 2,
            PacketBody::LinkStateRequest(_) => 3,
            PacketBody::LinkStateUpdate(_) => 4,
            PacketBody::LinkStateAck(_) => 5,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::Hello(_) => "HELLO",
            PacketBody::DatabaseDescription(_) => "DBDESC",
            PacketBody::LinkStateRequest(_) => "LSREQUEST",
            PacketBody::LinkStateUpdate(_) => "LSUPDATE",
            PacketBody::LinkStateAck(_) => "LSACK",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub router_id: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(router_id: Ipv4Addr, area_id: Ipv4Addr, body: PacketBody) -> Self {
        Self {
            router_id,
            area_id,
            body,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(64);
        match &self.body {
            PacketBody::Hello(hello) => {
                body.put_slice(&hello.network_mask.octets());
                body.put_u16(hello.hello_interval);
                body.put_u8(hello.options);
                body.put_u8(hello.priority);
                body.put_u32(hello.dead_interval);
                body.put_slice(&hello.designated_router.octets());
                body.put_slice(&hello.backup_designated_router.octets());
                for neighbor in &hello.neighbors {
                    body.put_slice(&neighbor.octets());
                }
            }
            PacketBody::DatabaseDescription(dd) => {
                body.put_u16(dd.mtu);
                body.put_u8(dd.options);
                body.put_u8(dd.flags);
                body.put_u32(dd.sequence);
                for header in &dd.headers {
                    header.encode(&mut body);
                }
            }
            PacketBody::LinkStateRequest(requests) => {
                for request in requests {
                    body.put_u32(u32::from(request.ls_type.code()));
                    body.put_slice(&request.id.octets());
                    body.put_slice(&request.advertising_router.octets());
                }
            }
            PacketBody::LinkStateUpdate(lsas) => {
                body.put_u32(lsas.len() as u32);
                for lsa in lsas {
                    lsa.encode(&mut body);
                }
            }
            PacketBody::LinkStateAck(headers) => {
                for header in headers {
                    header.encode(&mut body);
                }
            }
        }

        let length = (HEADER_LENGTH + body.len()) as u16;
        let start = buf.len();
        buf.put_u8(OSPF_VERSION);
        buf.put_u8(self.body.packet_type());
        buf.put_u16(length);
        buf.put_slice(&self.router_id.octets());
        buf.put_slice(&self.area_id.octets());
        buf.put_u16(0); // Checksum placeholder
        buf.put_u16(0); // AuType 0 (null)
        buf.put_u64(0); // Authentication
        buf.put_slice(&body);
        let checksum = ones_complement_sum(&buf[start..]);
        buf[start + 12..start + 14].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Packet, PacketError> {
        if data.len() < HEADER_LENGTH {
            return Err(PacketError::Truncated);
        }
        let version = data[0];
        if version != OSPF_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let packet_type = data[1];
        let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if length < HEADER_LENGTH || length > data.len() {
            return Err(PacketError::Truncated);
        }
        let data = &data[..length];
        let router_id = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
        let area_id = Ipv4Addr::new(data[8], data[9], data[10], data[11]);
        let found = u16::from_be_bytes([data[12], data[13]]);
        let autype = u16::from_be_bytes([data[14], data[15]]);
        if autype != 0 {
            return Err(PacketError::BadAuthType(autype));
        }

        // Checksum over the packet with checksum and authentication zeroed
        let mut check = data.to_vec();
        check[12] = 0;
        check[13] = 0;
        for byte in check.iter_mut().take(24).skip(16) {
            *byte = 0;
        }
        let expected = ones_complement_sum(&check);
        if expected != found {
            return Err(PacketError::BadChecksum { expected, found });
        }

        let mut cursor = Cursor::new(&data[HEADER_LENGTH..]);
        let body = match packet_type {
            1 => {
                let network_mask = read_addr(&mut cursor)?;
                let hello_interval = cursor.get_u16().ok_or(PacketError::Truncated)?;
                let options = cursor.get_u8().ok_or(PacketError::Truncated)?;
                let priority = cursor.get_u8().ok_or(PacketError::Truncated)?;
                let dead_interval = cursor.get_u32().ok_or(PacketError::Truncated)?;
                let designated_router = read_addr(&mut cursor)?;
                let backup_designated_router = read_addr(&mut cursor)?;
                let mut neighbors = Vec::with_capacity(cursor.remaining() / 4);
                while cursor.remaining() >= 4 {
                    neighbors.push(read_addr(&mut cursor)?);
                }
                PacketBody::Hello(Hello {
                    network_mask,
                    hello_interval,
                    options,
                    priority,
                    dead_interval,
                    designated_router,
                    backup_designated_router,
                    neighbors,
                })
            }
            2 => {
                let mtu = cursor.get_u16().ok_or(PacketError::Truncated)?;
                let options = cursor.get_u8().ok_or(PacketError::Truncated)?;
                let flags = cursor.get_u8().ok_or(PacketError::Truncated)?;
                let sequence = cursor.get_u32().ok_or(PacketError::Truncated)?;
                let mut headers = Vec::with_capacity(cursor.remaining() / 20);
                while cursor.remaining() > 0 {
                    headers.push(LsaHeader::decode(&mut cursor)?);
                }
                PacketBody::DatabaseDescription(DatabaseDescription {
                    mtu,
                    options,
                    flags,
                    sequence,
                    headers,
                })
            }
            3 => {
                let mut requests = Vec::with_capacity(cursor.remaining() / 12);
                while cursor.remaining() > 0 {
                    let raw_type = cursor.get_u32().ok_or(PacketError::Truncated)?;
                    let ls_type = LsType::try_from(raw_type as u8)?;
                    let id = read_addr(&mut cursor)?;
                    let advertising_router = read_addr(&mut cursor)?;
                    requests.push(LsaKey {
                        ls_type,
                        id,
                        advertising_router,
                    });
                }
                PacketBody::LinkStateRequest(requests)
            }
            4 => {
                let count = cursor.get_u32().ok_or(PacketError::Truncated)?;
                let mut lsas = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    lsas.push(Lsa::decode(&mut cursor)?);
                }
                PacketBody::LinkStateUpdate(lsas)
            }
            5 => {
                let mut headers = Vec::with_capacity(cursor.remaining() / 20);
                while cursor.remaining() > 0 {
                    headers.push(LsaHeader::decode(&mut cursor)?);
                }
                PacketBody::LinkStateAck(headers)
            }
            other => return Err(PacketError::BadType(other)),
        };
        Ok(Packet {
            router_id,
            area_id,
            body,
        })
    }
}

fn read_addr(cursor: &mut Cursor) -> Result<Ipv4Addr, PacketError> {
    cursor
        .take(4)
        .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        .ok_or(PacketError::Truncated)
}

/// RFC 1071 internet checksum (16-bit one's complement of the one's
/// complement sum); input must already have checksum/auth fields zeroed
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u32::from(u16::from_be_bytes([chunk[0], chunk[1]]))
        } else {
            u32::from(chunk[0]) << 8
        };
        sum += word;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ospf::lsa::{LsaBody, INITIAL_SEQUENCE};

    fn sample_hello() -> Packet {
        Packet::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::UNSPECIFIED,
            PacketBody::Hello(Hello {
                network_mask: Ipv4Addr::new(255, 255, 255, 252),
                hello_interval: 10,
                options: OPTIONS_E,
                priority: 1,
                dead_interval: 40,
                designated_router: Ipv4Addr::UNSPECIFIED,
                backup_designated_router: Ipv4Addr::UNSPECIFIED,
                neighbors: vec![Ipv4Addr::new(10, 0, 0, 2)],
            }),
        )
    }

    #[test]
    fn test_hello_round_trip() {
        let packet = sample_hello();
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let packet = sample_hello();
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(
            Packet::decode(&buf),
            Err(PacketError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_nonzero_autype_rejected() {
        let packet = sample_hello();
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        buf[15] = 1;
        // Re-checksum so only the auth type is at fault
        buf[12] = 0;
        buf[13] = 0;
        let mut check = buf.to_vec();
        for byte in check.iter_mut().take(24).skip(16) {
            *byte = 0;
        }
        let checksum = ones_complement_sum(&check);
        buf[12..14].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(Packet::decode(&buf), Err(PacketError::BadAuthType(1)));
    }

    #[test]
    fn test_dd_round_trip() {
        let lsa = Lsa::new(
            1,
            OPTIONS_E,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            INITIAL_SEQUENCE,
            LsaBody::Router {
                flags: 0,
                links: vec![],
            },
        );
        let packet = Packet::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::UNSPECIFIED,
            PacketBody::DatabaseDescription(DatabaseDescription {
                mtu: 1500,
                options: OPTIONS_E,
                flags: dd_flags::INIT | dd_flags::MORE | dd_flags::MASTER,
                sequence: 0x1234,
                headers: vec![lsa.header],
            }),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_lsu_round_trip() {
        let lsa = Lsa::new(
            1,
            OPTIONS_E,
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            INITIAL_SEQUENCE,
            LsaBody::Network {
                mask: Ipv4Addr::new(255, 255, 255, 0),
                attached: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
            },
        );
        let packet = Packet::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::UNSPECIFIED,
            PacketBody::LinkStateUpdate(vec![lsa]),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_lsr_round_trip() {
        let packet = Packet::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::UNSPECIFIED,
            PacketBody::LinkStateRequest(vec![LsaKey {
                ls_type: LsType::Router,
                id: Ipv4Addr::new(10, 0, 0, 2),
                advertising_router: Ipv4Addr::new(10, 0, 0, 2),
            }]),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }
}
