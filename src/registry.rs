//! The set of live queries and the views the engine needs on it.
//!
//! A query is owned by the registry from `insert` until `remove` (or
//! `drain`) hands it back. For that whole interval it is reachable by key,
//! by transaction ID and by deadline; outside it, by none of them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::time::Instant;

use crate::alloc::{self, Site};
use crate::error::Error;
use crate::query::{Query, QueryKey};

#[derive(Default)]
pub struct Registry {
    next_key: u64,
    // owner of every record, iterates in submission order
    all: BTreeMap<QueryKey, Box<Query>>,
    // several live queries may share an ID
    by_id: HashMap<u16, Vec<QueryKey>>,
    // an unset deadline sorts first
    by_deadline: BTreeSet<(Option<Instant>, QueryKey)>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a query in every view.
    ///
    /// All the room the views need is reserved before any of them changes,
    /// so on failure the query comes back and the registry is untouched.
    pub fn insert(&mut self, query: Box<Query>) -> Result<QueryKey, (Box<Query>, Error)> {
        if let Err(e) = alloc::check(Site::AllQueries) {
            return Err((query, e));
        }

        let id = query.id;
        let fresh = match self.by_id.get_mut(&id) {
            Some(bucket) => {
                if let Err(e) = alloc::reserve_slot(Site::IdIndex, bucket) {
                    return Err((query, e));
                }
                None
            }
            None => {
                let mut bucket = Vec::new();
                let reserved = alloc::reserve_slot(Site::IdIndex, &mut bucket)
                    .and_then(|_| alloc::reserve_entry(Site::IdIndex, &mut self.by_id));
                if let Err(e) = reserved {
                    return Err((query, e));
                }
                Some(bucket)
            }
        };

        let key = QueryKey(self.next_key);
        self.next_key += 1;

        match fresh {
            Some(mut bucket) => {
                bucket.push(key);
                self.by_id.insert(id, bucket);
            }
            None => {
                if let Some(bucket) = self.by_id.get_mut(&id) {
                    bucket.push(key);
                }
            }
        }
        self.by_deadline.insert((query.deadline, key));
        self.all.insert(key, query);
        Ok(key)
    }

    /// Takes a query out of every view.
    pub fn remove(&mut self, key: QueryKey) -> Option<Box<Query>> {
        let query = self.all.remove(&key)?;
        self.by_deadline.remove(&(query.deadline, key));

        let now_empty = match self.by_id.get_mut(&query.id) {
            Some(bucket) => {
                bucket.retain(|k| *k != key);
                bucket.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_id.remove(&query.id);
        }

        Some(query)
    }

    pub fn get(&self, key: QueryKey) -> Option<&Query> {
        self.all.get(&key).map(|q| &**q)
    }

    /// Mutable access for the engine. Use `set_deadline` for the deadline,
    /// it is part of the ordering.
    pub fn get_mut(&mut self, key: QueryKey) -> Option<&mut Query> {
        self.all.get_mut(&key).map(|q| &mut **q)
    }

    /// Keys of the live queries using transaction ID `id`, oldest first.
    pub fn matching(&self, id: u16) -> &[QueryKey] {
        self.by_id.get(&id).map(|keys| &keys[..]).unwrap_or(&[])
    }

    pub fn set_deadline(&mut self, key: QueryKey, deadline: Option<Instant>) {
        if let Some(query) = self.all.get_mut(&key) {
            self.by_deadline.remove(&(query.deadline, key));
            query.deadline = deadline;
            self.by_deadline.insert((deadline, key));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.iter().filter_map(|&(deadline, _)| deadline).next()
    }

    /// Queries whose deadline is at or before `now`, earliest first.
    pub fn expired(&self, now: Instant) -> Vec<QueryKey> {
        self.by_deadline
            .iter()
            .skip_while(|&&(deadline, _)| deadline.is_none())
            .take_while(|&&(deadline, _)| deadline.map_or(false, |d| d <= now))
            .map(|&(_, key)| key)
            .collect()
    }

    /// Keys in submission order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.all.keys().cloned().collect()
    }

    /// Empties the registry, returning the queries in submission order.
    pub fn drain(&mut self) -> Vec<Box<Query>> {
        self.by_id.clear();
        self.by_deadline.clear();
        mem::take(&mut self.all).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    #[cfg(test)]
    pub fn assert_consistent(&self) {
        let indexed: usize = self.by_id.values().map(|b| b.len()).sum();
        assert_eq!(indexed, self.all.len());
        assert_eq!(self.by_deadline.len(), self.all.len());
        for (key, query) in &self.all {
            assert!(self.matching(query.id).contains(key));
            assert!(self.by_deadline.contains(&(query.deadline, *key)));
        }
        assert!(self.by_id.values().all(|b| !b.is_empty()));
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};
    use super::*;
    use crate::alloc::failpoint;
    use crate::error::Result;
    use crate::query::Protocol;

    fn query(id: u16) -> Box<Query> {
        let mut msg = vec![0u8; 12];
        msg[0] = (id >> 8) as u8;
        msg[1] = id as u8;
        Query::new(&msg, Box::new(|_: Result<&[u8]>, _: usize| {}), Protocol::Udp, 0)
            .ok()
            .unwrap()
    }

    #[test]
    fn insert_and_remove() {
        let mut registry = Registry::new();
        let key = registry.insert(query(7)).ok().unwrap();
        registry.assert_consistent();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.matching(7), &[key]);
        assert_eq!(registry.get(key).unwrap().id(), 7);

        let removed = registry.remove(key).unwrap();
        assert_eq!(removed.id(), 7);
        assert!(registry.is_empty());
        assert!(registry.matching(7).is_empty());
        assert!(registry.remove(key).is_none());
        registry.assert_consistent();
    }

    #[test]
    fn shared_ids_are_kept_apart() {
        let mut registry = Registry::new();
        let first = registry.insert(query(42)).ok().unwrap();
        let second = registry.insert(query(42)).ok().unwrap();
        assert!(first < second);
        assert_eq!(registry.matching(42), &[first, second]);

        registry.remove(first);
        assert_eq!(registry.matching(42), &[second]);
        registry.assert_consistent();
    }

    #[test]
    fn failed_insert_leaves_nothing_behind() {
        let mut registry = Registry::new();
        let kept = registry.insert(query(1)).ok().unwrap();

        for &(site, id) in &[(Site::AllQueries, 1), (Site::IdIndex, 1), (Site::IdIndex, 2)] {
            failpoint::arm(site);
            match registry.insert(query(id)) {
                Err((back, Error::NoMemory)) => assert_eq!(back.id(), id),
                _ => panic!("insert should fail at {:?}", site),
            }
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.matching(1), &[kept]);
            assert!(registry.matching(2).is_empty());
            registry.assert_consistent();
        }
        failpoint::disarm();
    }

    #[test]
    fn deadlines_are_ordered() {
        let mut registry = Registry::new();
        let now = Instant::now();
        let a = registry.insert(query(1)).ok().unwrap();
        let b = registry.insert(query(2)).ok().unwrap();
        let c = registry.insert(query(3)).ok().unwrap();
        assert_eq!(registry.next_deadline(), None);
        assert!(registry.expired(now + Duration::from_secs(60)).is_empty());

        registry.set_deadline(a, Some(now + Duration::from_secs(3)));
        registry.set_deadline(b, Some(now + Duration::from_secs(1)));
        registry.set_deadline(c, Some(now + Duration::from_secs(2)));
        registry.assert_consistent();

        assert_eq!(registry.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(registry.expired(now), vec![]);
        assert_eq!(registry.expired(now + Duration::from_secs(2)), vec![b, c]);

        registry.set_deadline(b, Some(now + Duration::from_secs(5)));
        assert_eq!(registry.expired(now + Duration::from_secs(3)), vec![c, a]);
        registry.assert_consistent();
    }

    #[test]
    fn drain_in_submission_order() {
        let mut registry = Registry::new();
        for id in &[9u16, 3, 5] {
            registry.insert(query(*id)).ok().unwrap();
        }
        let ids: Vec<u16> = registry.drain().iter().map(|q| q.id()).collect();
        assert_eq!(ids, vec![9, 3, 5]);
        assert!(registry.is_empty());
        assert!(registry.matching(3).is_empty());
        assert_eq!(registry.next_deadline(), None);
    }
}
