use std::fs::File;
use std::io::{self, Read};

use ipnetwork::IpNetwork;
use log::info;
use serde::Deserialize;

use crate::config::RpkiConfig;
use crate::rib::ValidationState;

/// A Route Origin Authorization loaded from the configured source
#[derive(Clone, Debug, Deserialize)]
pub struct Roa {
    pub prefix: IpNetwork,
    pub max_length: u8,
    pub asn: u32,
}

/// Origin validation against a static ROA table [RFC 6811 semantics].
/// The RPKI-to-router transport is out of scope; ROAs come from a file.
#[derive(Debug, Default)]
pub struct RoaValidator {
    roas: Vec<Roa>,
    reject_invalid: bool,
    configured: bool,
}

impl RoaValidator {
    pub fn new(config: Option<&RpkiConfig>) -> io::Result<Self> {
        let Some(config) = config else {
            return Ok(Self::default());
        };
        let mut contents = String::new();
        File::open(&config.roa_source)?.read_to_string(&mut contents)?;
        let roas: Vec<Roa> = serde_json::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        info!("Loaded {} ROAs from {}", roas.len(), config.roa_source);
        Ok(Self {
            roas,
            reject_invalid: config.reject_invalid,
            configured: true,
        })
    }

    pub fn from_roas(roas: Vec<Roa>, reject_invalid: bool) -> Self {
        Self {
            roas,
            reject_invalid,
            configured: true,
        }
    }

    /// Should Invalid routes be dropped at import?
    pub fn reject_invalid(&self) -> bool {
        self.reject_invalid
    }

    /// Validate a prefix against the ROA table for the originating AS
    /// (the rightmost AS in the AS_PATH)
    pub fn validate(&self, prefix: &IpNetwork, origin_asn: Option<u32>) -> ValidationState {
        if !self.configured {
            return ValidationState::Unverified;
        }
        let covering: Vec<&Roa> = self
            .roas
            .iter()
            .filter(|roa| {
                roa.prefix.contains(prefix.ip()) && prefix.prefix() >= roa.prefix.prefix()
            })
            .collect();
        if covering.is_empty() {
            return ValidationState::NotFound;
        }
        let valid = covering.iter().any(|roa| {
            Some(roa.asn) == origin_asn && prefix.prefix() <= roa.max_length
        });
        if valid {
            ValidationState::Valid
        } else {
            ValidationState::Invalid
        }
    }
}
