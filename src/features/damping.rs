use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::RouteControl;
use crate::config::FlapDampingConfig;

/// Penalty added for each withdrawal [RFC 2439 4.2]
const WITHDRAWAL_PENALTY: f64 = 1000.0;
/// Penalty added for each re-announcement of a known-flapping prefix
const REANNOUNCE_PENALTY: f64 = 500.0;

#[derive(Debug)]
struct PenaltyEntry {
    penalty: f64,
    suppressed: bool,
    last_event: DateTime<Utc>,
}

/// Route-flap damping: repeated flaps accumulate a decaying penalty;
/// past the suppress threshold the route is withheld from the decision
/// process until the penalty falls below the reuse threshold.
#[derive(Debug, Default)]
pub struct FlapDamping {
    config: Option<FlapDampingConfig>,
    penalties: HashMap<(IpAddr, IpNetwork), PenaltyEntry>,
}

impl FlapDamping {
    pub fn new(config: Option<FlapDampingConfig>) -> Self {
        Self {
            config,
            penalties: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Number of currently suppressed (peer, prefix) pairs
    pub fn suppressed_count(&self) -> usize {
        self.penalties
            .values()
            .filter(|entry| entry.suppressed)
            .count()
    }

    /// Checkpoint on every announcement/withdrawal from a peer
    pub fn route_received(
        &mut self,
        peer_ip: IpAddr,
        prefix: IpNetwork,
        withdrawal: bool,
    ) -> RouteControl {
        let Some(config) = self.config else {
            return RouteControl::Accept;
        };
        let now = Utc::now();
        let entry = self
            .penalties
            .entry((peer_ip, prefix))
            .or_insert(PenaltyEntry {
                penalty: 0.0,
                suppressed: false,
                last_event: now,
            });

        // Exponential decay since the last event
        let elapsed = (now - entry.last_event).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 && config.half_life > 0 {
            entry.penalty *= 0.5_f64.powf(elapsed / config.half_life as f64);
        }
        entry.last_event = now;

        if withdrawal {
            entry.penalty += WITHDRAWAL_PENALTY;
        } else if entry.penalty > 0.0 {
            entry.penalty += REANNOUNCE_PENALTY;
        }

        if !entry.suppressed && entry.penalty >= f64::from(config.suppress_threshold) {
            debug!(
                "Damping {} from {} (penalty {:.0})",
                prefix, peer_ip, entry.penalty
            );
            entry.suppressed = true;
        } else if entry.suppressed && entry.penalty <= f64::from(config.reuse_threshold) {
            debug!("Reusing {} from {} (penalty {:.0})", prefix, peer_ip, entry.penalty);
            entry.suppressed = false;
        }

        if entry.suppressed {
            trace!("{} from {} suppressed", prefix, peer_ip);
            RouteControl::Suppress
        } else {
            RouteControl::Accept
        }
    }

    /// Session teardown wipes the peer's damping history
    pub fn session_down(&mut self, peer_ip: IpAddr) {
        self.penalties.retain(|(peer, _), _| *peer != peer_ip);
    }
}
