use log::{debug, trace};

use super::lsa::{Lsa, LsaHeader, Newness};
use super::lsdb::Lsdb;
use super::neighbor::Neighbor;

/// Retransmission interval for unacknowledged LSAs (seconds)
pub const RETRANSMIT_INTERVAL: u64 = 5;

/// What to do with the LSAs of one received Link-State-Update
#[derive(Debug, Default)]
pub struct FloodPlan {
    /// Strictly newer instances: install, then flood onward
    pub install: Vec<Lsa>,
    /// Headers to acknowledge back to the sender
    pub ack: Vec<LsaHeader>,
    /// The sender is behind; send our newer copy back directly
    pub send_back: Vec<Lsa>,
}

/// Classify each received LSA against the database [RFC 2328 13]
pub fn plan_update(lsdb: &Lsdb, received: Vec<Lsa>, sender: &mut Neighbor) -> FloodPlan {
    let mut plan = FloodPlan::default();
    for lsa in received {
        let key = lsa.key();
        match lsdb.newness(&lsa.header) {
            Newness::Newer => {
                // An arriving copy acknowledges (and supersedes) any pending
                // retransmission of the older instance
                sender.retransmits.remove(&key);
                sender.satisfy_request(&key);
                plan.ack.push(lsa.header.clone());
                plan.install.push(lsa);
            }
            Newness::Same => {
                // Duplicate: an implied ack if we were retransmitting it
                if sender.retransmits.remove(&key).is_some() {
                    trace!("Implied ack of {} from {}", key, sender.router_id);
                } else {
                    plan.ack.push(lsa.header.clone());
                }
                sender.satisfy_request(&key);
            }
            Newness::Older => {
                if let Some(ours) = lsdb.get(&key) {
                    debug!(
                        "{} sent stale {} (seq {:#x} < {:#x})",
                        sender.router_id, key, lsa.header.sequence, ours.header.sequence
                    );
                    plan.send_back.push(ours.clone());
                }
            }
        }
    }
    plan
}

/// Record an acknowledgement: drop the LSA from the retransmission list
/// when the acked instance is at least as new as the one pending
pub fn process_ack(headers: &[LsaHeader], neighbor: &mut Neighbor) {
    for header in headers {
        let key = header.key();
        if let Some(pending) = neighbor.retransmits.get(&key) {
            match header.compare(&pending.header) {
                Newness::Same | Newness::Newer => {
                    trace!("{} acked {}", neighbor.router_id, key);
                    neighbor.retransmits.remove(&key);
                }
                Newness::Older => {
                    debug!("{} acked an old instance of {}", neighbor.router_id, key);
                }
            }
        }
    }
}

/// Queue an LSA for reliable delivery to a neighbor being flooded to
pub fn enqueue_flood(lsa: &Lsa, neighbor: &mut Neighbor) {
    neighbor.retransmits.insert(lsa.key(), lsa.clone());
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::ospf::lsa::{LsaBody, INITIAL_SEQUENCE};
    use crate::ospf::neighbor::{NeighborEvent, NeighborState};

    fn lsa(id: u8, sequence: u32) -> Lsa {
        Lsa::new(
            1,
            0x02,
            Ipv4Addr::new(10, 0, 0, id),
            Ipv4Addr::new(10, 0, 0, id),
            sequence,
            LsaBody::Router {
                flags: 0,
                links: vec![],
            },
        )
    }

    fn full_neighbor() -> Neighbor {
        let mut neighbor = Neighbor::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(192, 0, 2, 2),
            1,
        );
        neighbor.handle_event(NeighborEvent::HelloReceived);
        neighbor.handle_event(NeighborEvent::TwoWayReceived {
            form_adjacency: true,
        });
        neighbor
    }

    #[test]
    fn test_newer_lsa_installed_and_acked() {
        let lsdb = Lsdb::new();
        let mut sender = full_neighbor();
        let plan = plan_update(&lsdb, vec![lsa(3, INITIAL_SEQUENCE)], &mut sender);
        assert_eq!(plan.install.len(), 1);
        assert_eq!(plan.ack.len(), 1);
        assert!(plan.send_back.is_empty());
    }

    #[test]
    fn test_duplicate_dropped_not_flooded() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(3, INITIAL_SEQUENCE));
        let mut sender = full_neighbor();
        let plan = plan_update(&lsdb, vec![lsa(3, INITIAL_SEQUENCE)], &mut sender);
        assert!(plan.install.is_empty());
        assert!(plan.send_back.is_empty());
        // Still acknowledged
        assert_eq!(plan.ack.len(), 1);
    }

    #[test]
    fn test_duplicate_is_implied_ack() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(3, INITIAL_SEQUENCE));
        let mut sender = full_neighbor();
        enqueue_flood(&lsa(3, INITIAL_SEQUENCE), &mut sender);
        let plan = plan_update(&lsdb, vec![lsa(3, INITIAL_SEQUENCE)], &mut sender);
        assert!(sender.retransmits.is_empty());
        // Implied ack: no explicit LSAck needed
        assert!(plan.ack.is_empty());
    }

    #[test]
    fn test_stale_lsa_answered_with_newer_copy() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(3, INITIAL_SEQUENCE + 5));
        let mut sender = full_neighbor();
        let plan = plan_update(&lsdb, vec![lsa(3, INITIAL_SEQUENCE)], &mut sender);
        assert!(plan.install.is_empty());
        assert!(plan.ack.is_empty());
        assert_eq!(plan.send_back.len(), 1);
        assert_eq!(plan.send_back[0].header.sequence, INITIAL_SEQUENCE + 5);
    }

    #[test]
    fn test_ack_clears_retransmission() {
        let mut neighbor = full_neighbor();
        let flooded = lsa(3, INITIAL_SEQUENCE);
        enqueue_flood(&flooded, &mut neighbor);
        assert_eq!(neighbor.retransmits.len(), 1);
        process_ack(&[flooded.header.clone()], &mut neighbor);
        assert!(neighbor.retransmits.is_empty());
    }

    #[test]
    fn test_old_ack_keeps_retransmission() {
        let mut neighbor = full_neighbor();
        let flooded = lsa(3, INITIAL_SEQUENCE + 1);
        enqueue_flood(&flooded, &mut neighbor);
        process_ack(&[lsa(3, INITIAL_SEQUENCE).header], &mut neighbor);
        assert_eq!(neighbor.retransmits.len(), 1);
    }

    #[test]
    fn test_update_satisfies_pending_request() {
        let mut lsdb = Lsdb::new();
        let mut sender = full_neighbor();
        // Drive the neighbor into Loading with one request outstanding
        let dd = crate::ospf::packet::DatabaseDescription {
            mtu: 1500,
            options: 0x02,
            flags: 0,
            sequence: sender.dd_sequence,
            headers: vec![lsa(3, INITIAL_SEQUENCE).header],
        };
        sender.process_dd(&dd, Ipv4Addr::new(10, 0, 0, 9), &lsdb);
        assert_eq!(sender.state, NeighborState::Loading);

        let plan = plan_update(&lsdb, vec![lsa(3, INITIAL_SEQUENCE)], &mut sender);
        for lsa in plan.install {
            lsdb.install(lsa);
        }
        assert_eq!(sender.state, NeighborState::Full);
    }
}
