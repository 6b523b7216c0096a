//! Allocation points of the admission path.
//!
//! Every allocation a submission makes goes through here so that running
//! out of memory is reported as `Error::NoMemory` instead of aborting.
//! Test builds can arm a fail point to make one site fail.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Record,
    Message,
    AllQueries,
    IdIndex,
}

/// Checks whether `site` may allocate.
pub fn check(site: Site) -> Result<()> {
    if failpoint::hit(site) {
        return Err(Error::NoMemory);
    }
    Ok(())
}

/// Copies a caller's message into storage the engine owns.
pub fn copy_message(msg: &[u8]) -> Result<Vec<u8>> {
    check(Site::Message)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(msg.len()).map_err(|_| Error::NoMemory)?;
    buf.extend_from_slice(msg);
    Ok(buf)
}

/// Makes room for one more entry in `map`.
pub fn reserve_entry<K: Eq + Hash, V>(site: Site, map: &mut HashMap<K, V>) -> Result<()> {
    check(site)?;
    map.try_reserve(1).map_err(|_| Error::NoMemory)
}

/// Makes room for one more element in `v`.
pub fn reserve_slot<T>(site: Site, v: &mut Vec<T>) -> Result<()> {
    check(site)?;
    v.try_reserve(1).map_err(|_| Error::NoMemory)
}

#[cfg(not(test))]
mod failpoint {
    use super::Site;

    #[inline]
    pub fn hit(_site: Site) -> bool {
        false
    }
}


#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use super::*;

    #[test]
    fn copy_is_owned() {
        let msg = vec![1u8, 2, 3];
        let copy = copy_message(&msg).unwrap();
        drop(msg);
        assert_eq!(copy, vec![1, 2, 3]);
    }

    #[test]
    fn armed_site_fails_once() {
        failpoint::arm(Site::Message);
        assert!(matches!(copy_message(&[0; 12]), Err(Error::NoMemory)));
        assert!(copy_message(&[0; 12]).is_ok());

        let mut map: HashMap<u16, ()> = HashMap::new();
        failpoint::arm(Site::IdIndex);
        assert!(reserve_entry(Site::AllQueries, &mut map).is_ok());
        assert!(matches!(reserve_entry(Site::IdIndex, &mut map), Err(Error::NoMemory)));
        failpoint::disarm();
    }
}
