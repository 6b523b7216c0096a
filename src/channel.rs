use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::parser::{build_request, HEADER_LEN, MAX_MESSAGE_LEN};
use crate::query::{select_protocol, Callback, Query};
use crate::transport::{MioTransport, Transport};

/// A resolver instance: name servers, options and every query in flight.
///
/// Nothing happens in the background. The owner drives the channel by
/// calling `process` (or `run`) from a single thread, and callbacks run
/// from inside those calls, except for failures detected while
/// submitting, which are reported before `send` returns.
///
/// Dropping the channel cancels whatever is still pending.
pub struct Channel<T: Transport = MioTransport> {
    engine: Engine<T>,
}

impl Channel<MioTransport> {
    pub fn new(options: Options) -> Result<Channel> {
        let transport = MioTransport::new(&options.servers)?;
        Ok(Channel::with_transport(options, transport))
    }
}

impl<T: Transport> Channel<T> {
    pub fn with_transport(options: Options, transport: T) -> Channel<T> {
        Channel { engine: Engine::new(options, transport) }
    }

    pub fn options(&self) -> &Options {
        &self.engine.options
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.engine.options.servers
    }

    /// Number of queries waiting for an answer.
    pub fn pending(&self) -> usize {
        self.engine.registry.len()
    }

    /// Submits an encoded query.
    ///
    /// `msg` is copied; the caller may reuse it as soon as this returns.
    /// `callback` runs exactly once. If the query cannot even be started it
    /// runs right away and the same error is returned; `Ok(())` means the
    /// query is pending.
    pub fn send<F>(&mut self, msg: &[u8], callback: F) -> Result<()>
        where F: FnOnce(Result<&[u8]>, usize) + 'static
    {
        self.submit(msg, Box::new(callback), Instant::now())
    }

    /// Builds a query for `name` and `qtype` and submits it.
    pub fn query<F>(&mut self, name: &str, qtype: u16, callback: F) -> Result<()>
        where F: FnOnce(Result<&[u8]>, usize) + 'static
    {
        let options = &self.engine.options;
        let edns = if options.edns { Some(options.edns_payload_size) } else { None };
        match build_request(name, qtype, options.recurse, edns) {
            Some(msg) => self.send(&msg, callback),
            None => {
                debug!(qname = name, "cannot encode query");
                Err(reject(Box::new(callback), Error::BadQuery))
            }
        }
    }

    pub(crate) fn submit(&mut self, msg: &[u8], callback: Callback, now: Instant) -> Result<()> {
        if msg.len() < HEADER_LEN || msg.len() >= MAX_MESSAGE_LEN {
            debug!(len = msg.len(), "rejecting query of impossible size");
            return Err(reject(callback, Error::BadQuery));
        }
        let nservers = self.engine.options.servers.len();
        if nservers == 0 {
            debug!("rejecting query, no name servers configured");
            return Err(reject(callback, Error::ServFail));
        }

        let proto = select_protocol(msg.len(), &self.engine.options);
        let first_server = if self.engine.options.rotate {
            rand::random::<usize>() % nservers
        } else {
            0
        };

        let query = match Query::new(msg, callback, proto, first_server) {
            Ok(query) => query,
            Err((callback, e)) => {
                debug!(error = %e, "cannot allocate query");
                return Err(reject(callback, e));
            }
        };
        let key = match self.engine.registry.insert(query) {
            Ok(key) => key,
            Err((query, e)) => {
                debug!(id = query.id(), error = %e, "cannot register query");
                let status = e.duplicate();
                query.finish(Err(e));
                return Err(status);
            }
        };

        self.engine.begin_first_attempt(key, now)
    }

    /// Time until the next query needs attention, but no more than `max`.
    pub fn next_timeout(&self, max: Option<Duration>) -> Option<Duration> {
        self.engine.next_timeout(Instant::now(), max)
    }

    /// Waits for answers up to `max_wait` or the next query deadline,
    /// whichever comes first, and acts on what happened.
    ///
    /// With nothing pending and no `max_wait` there is nothing to wait
    /// for, and this returns at once.
    pub fn process(&mut self, max_wait: Option<Duration>) -> Result<()> {
        if max_wait.is_none() && self.pending() == 0 {
            return Ok(());
        }
        let wait = self.engine.next_timeout(Instant::now(), max_wait);
        let mut events = Vec::new();
        self.engine.transport.poll(wait, &mut events)?;

        let now = Instant::now();
        for event in events {
            self.engine.handle_event(event, now);
        }
        self.engine.handle_timeouts(now);
        Ok(())
    }

    /// Processes until no query is pending.
    pub fn run(&mut self) -> Result<()> {
        while self.pending() > 0 {
            self.process(None)?;
        }
        Ok(())
    }

    /// Completes every pending query with `Error::Cancelled`.
    pub fn cancel_all(&mut self) {
        let queries = self.engine.registry.drain();
        if !queries.is_empty() {
            debug!(count = queries.len(), "cancelling pending queries");
        }
        for query in queries {
            query.finish(Err(Error::Cancelled));
        }
    }

    /// Tears the channel down; pending queries are cancelled.
    pub fn destroy(self) {}
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// Reports a status to a callback that never made it into a query.
fn reject(callback: Callback, error: Error) -> Error {
    let status = error.duplicate();
    callback(Err(error), 0);
    status
}
