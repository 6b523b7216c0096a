use std::time::Instant;

use crate::alloc::{self, Site};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::parser::query_id;

/// Completion handler of a submission.
///
/// Gets the final status, with the answer on success, and the number of
/// timeouts seen along the way. The answer is only borrowed for the call.
pub type Callback = Box<dyn FnOnce(Result<&[u8]>, usize)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Identifies a registered query; later submissions get larger keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey(pub(crate) u64);

/// One submitted query and everything needed to retry and complete it.
pub struct Query {
    pub(crate) id: u16,
    pub(crate) msg: Vec<u8>,
    callback: Callback,
    pub(crate) attempts: usize,
    pub(crate) timeouts: usize,
    pub(crate) deadline: Option<Instant>,
    pub(crate) proto: Protocol,
    // last error seen, reported if we run out of attempts
    pub(crate) status: Option<Error>,
    pub(crate) server: usize,
}

impl Query {
    /// Builds a record from an admitted submission.
    ///
    /// On failure the callback is handed back uncalled together with the
    /// reason, and nothing stays allocated.
    pub fn new(msg: &[u8],
               callback: Callback,
               proto: Protocol,
               server: usize)
               -> std::result::Result<Box<Query>, (Callback, Error)> {
        if let Err(e) = alloc::check(Site::Record) {
            return Err((callback, e));
        }
        let msg = match alloc::copy_message(msg) {
            Ok(msg) => msg,
            Err(e) => return Err((callback, e)),
        };
        // admission guarantees a full header
        let id = query_id(&msg).unwrap_or(0);

        Ok(Box::new(Query {
            id: id,
            msg: msg,
            callback: callback,
            attempts: 0,
            timeouts: 0,
            deadline: None,
            proto: proto,
            status: None,
            server: server,
        }))
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Runs the callback. Consumes the record, so it happens once.
    pub fn finish(self: Box<Self>, result: Result<&[u8]>) {
        let Query { callback, timeouts, .. } = *self;
        callback(result, timeouts)
    }
}

/// Picks UDP or TCP for a message of `len` bytes.
pub fn select_protocol(len: usize, options: &Options) -> Protocol {
    if options.use_tcp || len > options.udp_max() {
        Protocol::Tcp
    } else {
        Protocol::Udp
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;
    use super::*;
    use crate::alloc::failpoint;
    use crate::options::{Options, PACKET_SIZE};

    #[test]
    fn legacy_size_threshold() {
        let options = Options::new();
        assert_eq!(select_protocol(PACKET_SIZE, &options), Protocol::Udp);
        assert_eq!(select_protocol(PACKET_SIZE + 1, &options), Protocol::Tcp);
    }

    #[test]
    fn edns_size_threshold() {
        let options = Options::new().edns(4096);
        assert_eq!(select_protocol(4096, &options), Protocol::Udp);
        assert_eq!(select_protocol(4097, &options), Protocol::Tcp);
        assert_eq!(select_protocol(PACKET_SIZE + 1, &options), Protocol::Udp);
    }

    #[test]
    fn forced_tcp() {
        let options = Options::new().use_tcp(true);
        assert_eq!(select_protocol(12, &options), Protocol::Tcp);
    }

    #[test]
    fn new_query_state() {
        let mut msg = vec![0u8; 20];
        msg[0] = 0xab;
        msg[1] = 0xcd;
        let query = Query::new(&msg, Box::new(|_: Result<&[u8]>, _: usize| {}), Protocol::Udp, 1).ok().unwrap();
        assert_eq!(query.id(), 0xabcd);
        assert_eq!(query.message(), &msg[..]);
        assert_eq!(query.attempts(), 0);
        assert_eq!(query.timeouts(), 0);
        assert!(query.deadline().is_none());
        assert!(query.status.is_none());
        assert_eq!(query.server, 1);
    }

    #[test]
    fn finish_reports_timeouts() {
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let mut query = Query::new(&[0u8; 12],
                                   Box::new(move |res: Result<&[u8]>, timeouts| {
                                       *sink.borrow_mut() = Some((res.map(|a| a.to_vec()).ok(), timeouts));
                                   }),
                                   Protocol::Udp,
                                   0)
            .ok()
            .unwrap();
        query.timeouts = 2;
        query.finish(Ok(&[1u8, 2, 3][..]));
        assert_eq!(*seen.borrow(), Some((Some(vec![1, 2, 3]), 2)));
    }

    #[test]
    fn failed_allocation_returns_callback() {
        for site in [Site::Record, Site::Message] {
            failpoint::arm(site);
            match Query::new(&[0u8; 12], Box::new(|_: Result<&[u8]>, _: usize| {}), Protocol::Udp, 0) {
                Err((_callback, Error::NoMemory)) => {}
                _ => panic!("allocation at {:?} should fail", site),
            }
        }
        failpoint::disarm();
    }
}
