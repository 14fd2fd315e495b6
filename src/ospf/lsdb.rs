use std::collections::HashMap;

use log::{debug, trace};

use super::lsa::{Lsa, LsaHeader, LsaKey, Newness, MAX_AGE};

/// The area link-state database, keyed by (type, id, advertising router).
/// Holds at most one instance per key; aged by a 1 Hz tick.
#[derive(Debug, Default)]
pub struct Lsdb {
    entries: HashMap<LsaKey, Lsa>,
}

impl Lsdb {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(32),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &LsaKey) -> Option<&Lsa> {
        self.entries.get(key)
    }

    /// Compare a received instance against the stored copy
    pub fn newness(&self, header: &LsaHeader) -> Newness {
        match self.entries.get(&header.key()) {
            Some(stored) => header.compare(&stored.header),
            None => Newness::Newer,
        }
    }

    /// Install an instance, replacing any stored copy. Returns the replaced one.
    pub fn install(&mut self, lsa: Lsa) -> Option<Lsa> {
        trace!("Installing {} seq={:#x}", lsa.key(), lsa.header.sequence);
        self.entries.insert(lsa.key(), lsa)
    }

    pub fn remove(&mut self, key: &LsaKey) -> Option<Lsa> {
        self.entries.remove(key)
    }

    /// All LSA headers, for Database-Description exchange
    pub fn headers(&self) -> Vec<LsaHeader> {
        self.entries.values().map(|lsa| lsa.header.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lsa> {
        self.entries.values()
    }

    /// Bump every entry's age by one second. Entries reaching MaxAge are
    /// removed and returned so the caller can flood them once at MaxAge.
    pub fn age_tick(&mut self) -> Vec<Lsa> {
        for lsa in self.entries.values_mut() {
            if lsa.header.age < MAX_AGE {
                lsa.header.age += 1;
            }
        }
        let expired: Vec<LsaKey> = self
            .entries
            .values()
            .filter(|lsa| lsa.header.age >= MAX_AGE)
            .map(|lsa| lsa.key())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let lsa = self.entries.remove(&key);
                if lsa.is_some() {
                    debug!("{} reached MaxAge, flushing", key);
                }
                lsa.map(|lsa| lsa.at_max_age())
            })
            .collect()
    }

    /// Self-originated LSAs due for refresh (age has passed the given bound)
    pub fn due_for_refresh(&self, router_id: std::net::Ipv4Addr, age_bound: u16) -> Vec<Lsa> {
        self.entries
            .values()
            .filter(|lsa| lsa.header.advertising_router == router_id)
            .filter(|lsa| lsa.header.age >= age_bound && lsa.header.age < MAX_AGE)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::ospf::lsa::{LsaBody, INITIAL_SEQUENCE};

    fn lsa(id: u8, sequence: u32, age: u16) -> Lsa {
        Lsa::new(
            age,
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

    #[test]
    fn test_one_entry_per_key() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(1, INITIAL_SEQUENCE, 1));
        lsdb.install(lsa(1, INITIAL_SEQUENCE + 1, 1));
        assert_eq!(lsdb.len(), 1);
        let stored = lsdb.get(&lsa(1, 0, 0).key()).unwrap();
        assert_eq!(stored.header.sequence, INITIAL_SEQUENCE + 1);
    }

    #[test]
    fn test_newness_against_store() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(1, INITIAL_SEQUENCE + 1, 1));
        assert_eq!(
            lsdb.newness(&lsa(1, INITIAL_SEQUENCE, 1).header),
            Newness::Older
        );
        assert_eq!(
            lsdb.newness(&lsa(1, INITIAL_SEQUENCE + 2, 1).header),
            Newness::Newer
        );
        assert_eq!(
            lsdb.newness(&lsa(2, INITIAL_SEQUENCE, 1).header),
            Newness::Newer
        );
    }

    #[test]
    fn test_age_tick_flushes_at_max_age() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(1, INITIAL_SEQUENCE, MAX_AGE - 1));
        lsdb.install(lsa(2, INITIAL_SEQUENCE, 10));
        let flushed = lsdb.age_tick();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].header.age, MAX_AGE);
        assert_eq!(lsdb.len(), 1);
        // Flushed entries leave the database entirely
        assert!(lsdb.get(&flushed[0].key()).is_none());
    }

    #[test]
    fn test_due_for_refresh() {
        let mut lsdb = Lsdb::new();
        lsdb.install(lsa(1, INITIAL_SEQUENCE, 1799));
        lsdb.install(lsa(2, INITIAL_SEQUENCE, 10));
        lsdb.age_tick();
        let due = lsdb.due_for_refresh(Ipv4Addr::new(10, 0, 0, 1), 1800);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].header.advertising_router, Ipv4Addr::new(10, 0, 0, 1));
        assert!(lsdb
            .due_for_refresh(Ipv4Addr::new(10, 0, 0, 2), 1800)
            .is_empty());
    }
}
