use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{BgpError, Cursor, Family};

/// Capability codes within the OPEN optional parameters [RFC 5492]
mod capability {
    pub const MULTIPROTOCOL: u8 = 1;
    pub const ROUTE_REFRESH: u8 = 2;
    pub const GRACEFUL_RESTART: u8 = 64;
    pub const FOUR_OCTET_ASN: u8 = 65;
}

const PARAMETER_CAPABILITIES: u8 = 2;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OpenError {
    UnsupportedVersion(u8),
    BadPeerAs,
    BadBgpIdentifier,
    UnsupportedOptionalParameter,
    UnacceptableHoldTime(u16),
    Malformed,
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpenError::UnsupportedVersion(version) => {
                write!(f, "Unsupported version number [{}]", version)
            }
            OpenError::BadPeerAs => write!(f, "Bad peer AS"),
            OpenError::BadBgpIdentifier => write!(f, "Bad BGP identifier"),
            OpenError::UnsupportedOptionalParameter => {
                write!(f, "Unsupported optional parameter")
            }
            OpenError::UnacceptableHoldTime(hold_time) => {
                write!(f, "Unacceptable hold time [{}]", hold_time)
            }
            OpenError::Malformed => write!(f, "Malformed OPEN message"),
        }
    }
}

impl std::error::Error for OpenError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GracefulRestart {
    pub restart_time: u16,
    pub families: Vec<Family>,
}

/// The capability set offered in an OPEN (and the negotiated intersection)
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub families: BTreeSet<Family>,
    pub route_refresh: bool,
    pub four_octet_asn: bool,
    pub graceful_restart: Option<GracefulRestart>,
}

impl Capabilities {
    /// The set negotiated with a peer: capabilities the peer did not echo
    /// are un-negotiated. The peer's Graceful-Restart timing is authoritative.
    pub fn common(&self, peer: &Capabilities) -> Capabilities {
        Capabilities {
            families: self.families.intersection(&peer.families).copied().collect(),
            route_refresh: self.route_refresh && peer.route_refresh,
            four_octet_asn: self.four_octet_asn && peer.four_octet_asn,
            graceful_restart: peer.graceful_restart.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Open {
    pub version: u8,
    /// The 2-octet My-AS field (AS_TRANS when the real ASN needs 4 octets)
    pub asn: u16,
    pub hold_time: u16,
    pub identifier: Ipv4Addr,
    pub capabilities: Capabilities,
    /// The full ASN carried in the 4-octet-AS capability, when present
    pub four_octet_asn: Option<u32>,
}

impl Open {
    /// The peer's ASN: 4-octet capability first, fallback to the My-AS field
    pub fn remote_asn(&self) -> u32 {
        if self.capabilities.four_octet_asn {
            if let Some(asn) = self.four_octet_asn {
                return asn;
            }
        }
        u32::from(self.asn)
    }

    pub(super) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u16(self.asn);
        buf.put_u16(self.hold_time);
        buf.put_slice(&self.identifier.octets());

        let mut caps = BytesMut::with_capacity(16);
        for family in &self.capabilities.families {
            caps.put_u8(capability::MULTIPROTOCOL);
            caps.put_u8(4);
            caps.put_u16(family.afi.code());
            caps.put_u8(0);
            caps.put_u8(family.safi.code());
        }
        if self.capabilities.route_refresh {
            caps.put_u8(capability::ROUTE_REFRESH);
            caps.put_u8(0);
        }
        if let Some(graceful_restart) = &self.capabilities.graceful_restart {
            caps.put_u8(capability::GRACEFUL_RESTART);
            caps.put_u8(2 + 4 * graceful_restart.families.len() as u8);
            // Restart-state flag clear; restart time in the low 12 bits
            caps.put_u16(graceful_restart.restart_time & 0x0fff);
            for family in &graceful_restart.families {
                caps.put_u16(family.afi.code());
                caps.put_u8(family.safi.code());
                caps.put_u8(0);
            }
        }
        if let Some(asn) = self.four_octet_asn {
            caps.put_u8(capability::FOUR_OCTET_ASN);
            caps.put_u8(4);
            caps.put_u32(asn);
        }

        if caps.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_u8(caps.len() as u8 + 2);
            buf.put_u8(PARAMETER_CAPABILITIES);
            buf.put_u8(caps.len() as u8);
            buf.put_slice(&caps);
        }
    }

    pub(super) fn decode(body: &[u8]) -> Result<Open, BgpError> {
        let mut cursor = Cursor::new(body);
        let version = cursor.get_u8().ok_or(BgpError::Open(OpenError::Malformed))?;
        if version != 4 {
            return Err(BgpError::Open(OpenError::UnsupportedVersion(version)));
        }
        let asn = cursor.get_u16().ok_or(BgpError::Open(OpenError::Malformed))?;
        let hold_time = cursor.get_u16().ok_or(BgpError::Open(OpenError::Malformed))?;
        if hold_time == 1 || hold_time == 2 {
            return Err(BgpError::Open(OpenError::UnacceptableHoldTime(hold_time)));
        }
        let identifier = cursor
            .take(4)
            .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            .ok_or(BgpError::Open(OpenError::Malformed))?;
        if identifier.is_unspecified() {
            return Err(BgpError::Open(OpenError::BadBgpIdentifier));
        }

        let parameters_length = cursor.get_u8().ok_or(BgpError::Open(OpenError::Malformed))?;
        if usize::from(parameters_length) != cursor.remaining() {
            return Err(BgpError::Open(OpenError::Malformed));
        }

        let mut open = Open {
            version,
            asn,
            hold_time,
            identifier,
            capabilities: Capabilities::default(),
            four_octet_asn: None,
        };
        while cursor.remaining() > 0 {
            let parameter_type = cursor.get_u8().ok_or(BgpError::Open(OpenError::Malformed))?;
            let length = cursor.get_u8().ok_or(BgpError::Open(OpenError::Malformed))?;
            let value = cursor
                .take(length.into())
                .ok_or(BgpError::Open(OpenError::Malformed))?;
            if parameter_type != PARAMETER_CAPABILITIES {
                return Err(BgpError::Open(OpenError::UnsupportedOptionalParameter));
            }
            open.decode_capabilities(value)?;
        }
        Ok(open)
    }

    fn decode_capabilities(&mut self, value: &[u8]) -> Result<(), BgpError> {
        let mut cursor = Cursor::new(value);
        while cursor.remaining() > 0 {
            let code = cursor.get_u8().ok_or(BgpError::Open(OpenError::Malformed))?;
            let length = cursor.get_u8().ok_or(BgpError::Open(OpenError::Malformed))?;
            let value = cursor
                .take(length.into())
                .ok_or(BgpError::Open(OpenError::Malformed))?;
            match code {
                capability::MULTIPROTOCOL => {
                    if value.len() != 4 {
                        return Err(BgpError::Open(OpenError::Malformed));
                    }
                    let afi = u16::from_be_bytes([value[0], value[1]]);
                    let safi = value[3];
                    // Families we don't implement are simply not negotiated
                    if let Ok(family) = Family::try_from((afi, safi)) {
                        self.capabilities.families.insert(family);
                    }
                }
                capability::ROUTE_REFRESH => self.capabilities.route_refresh = true,
                capability::FOUR_OCTET_ASN => {
                    if value.len() != 4 {
                        return Err(BgpError::Open(OpenError::Malformed));
                    }
                    self.capabilities.four_octet_asn = true;
                    self.four_octet_asn =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                capability::GRACEFUL_RESTART => {
                    if value.len() < 2 || (value.len() - 2) % 4 != 0 {
                        return Err(BgpError::Open(OpenError::Malformed));
                    }
                    let restart_time = u16::from_be_bytes([value[0], value[1]]) & 0x0fff;
                    let families = value[2..]
                        .chunks(4)
                        .filter_map(|chunk| {
                            let afi = u16::from_be_bytes([chunk[0], chunk[1]]);
                            Family::try_from((afi, chunk[2])).ok()
                        })
                        .collect();
                    self.capabilities.graceful_restart = Some(GracefulRestart {
                        restart_time,
                        families,
                    });
                }
                // Unknown capabilities are not negotiated, not fatal
                _ => (),
            }
        }
        Ok(())
    }
}
