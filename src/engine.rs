//! The send and retry loop behind a channel.
//!
//! Once admitted, a query is sent to one server at a time. A timeout, a
//! failing server or an answer the server should not have given moves it
//! to the next server; after `tries` rounds over the server list it ends
//! with the last problem seen.

use std::cmp;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::options::Options;
use crate::parser::{parse_header, same_questions, Rcode};
use crate::query::{Protocol, QueryKey};
use crate::registry::Registry;
use crate::transport::{Event, Transport};

pub struct Engine<T> {
    pub(crate) options: Options,
    pub(crate) registry: Registry,
    pub(crate) transport: T,
}

impl<T: Transport> Engine<T> {
    pub fn new(options: Options, transport: T) -> Engine<T> {
        Engine {
            options: options,
            registry: Registry::new(),
            transport: transport,
        }
    }

    /// Hands a freshly registered query to its first server.
    ///
    /// `Err` means the query could not be sent anywhere; its callback has
    /// already run with the same status.
    pub fn begin_first_attempt(&mut self, key: QueryKey, now: Instant) -> Result<()> {
        self.send_query(key, now)
    }

    fn max_attempts(&self) -> usize {
        cmp::max(self.options.tries, 1) * self.options.servers.len()
    }

    // Every round over the server list doubles the timeout.
    fn attempt_timeout(&self, attempts: usize) -> Duration {
        let nservers = cmp::max(self.options.servers.len(), 1);
        let round = cmp::min(attempts / nservers, 16) as u32;
        let timeout = self.options.timeout.checked_mul(1 << round).unwrap_or(self.options.max_timeout);
        cmp::min(timeout, self.options.max_timeout)
    }

    /// Transmits the query to its current server, moving on to the next
    /// server for as long as sending fails.
    fn send_query(&mut self, key: QueryKey, now: Instant) -> Result<()> {
        let nservers = self.options.servers.len();
        loop {
            let (server, proto, attempts, id) = match self.registry.get(key) {
                Some(query) => (query.server, query.proto, query.attempts, query.id),
                None => return Ok(()),
            };

            if nservers == 0 {
                return self.fail_query(key, Error::ServFail);
            }
            if attempts >= self.max_attempts() {
                let status = self.registry
                    .get_mut(key)
                    .and_then(|query| query.status.take())
                    .unwrap_or(Error::Timeout);
                return self.fail_query(key, status);
            }

            let sent = match self.registry.get(key) {
                Some(query) => self.transport.send(server, proto, &query.msg),
                None => return Ok(()),
            };
            if let Some(query) = self.registry.get_mut(key) {
                query.attempts += 1;
            }

            match sent {
                Ok(()) => {
                    let timeout = self.attempt_timeout(attempts);
                    trace!(id, server, ?proto, attempt = attempts + 1, ?timeout, "query sent");
                    self.registry.set_deadline(key, Some(now + timeout));
                    return Ok(());
                }
                Err(e) => {
                    debug!(id, server, ?proto, error = %e, "failed to send query");
                    if let Some(query) = self.registry.get_mut(key) {
                        query.status = Some(Error::ConnRefused);
                        query.server = (server + 1) % nservers;
                    }
                    // a stream that failed a write is gone, with everything on it
                    if proto == Protocol::Tcp {
                        self.requeue_stranded(server, proto, Some(key), now);
                    }
                }
            }
        }
    }

    /// Gives up on the current server and tries the next one.
    fn next_server(&mut self, key: QueryKey, now: Instant) {
        let nservers = self.options.servers.len();
        if let Some(query) = self.registry.get_mut(key) {
            if nservers > 0 {
                query.server = (query.server + 1) % nservers;
            }
        }
        let _ = self.send_query(key, now);
    }

    /// Removes the query and completes it with an error, which is also
    /// returned.
    fn fail_query(&mut self, key: QueryKey, error: Error) -> Result<()> {
        let status = error.duplicate();
        if let Some(query) = self.registry.remove(key) {
            debug!(id = query.id, attempts = query.attempts, timeouts = query.timeouts, %error,
                   "query failed");
            query.finish(Err(error));
        }
        Err(status)
    }

    fn end_query(&mut self, key: QueryKey, answer: &[u8]) {
        if let Some(query) = self.registry.remove(key) {
            trace!(id = query.id, len = answer.len(), "query answered");
            query.finish(Ok(answer));
        }
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Answer { server, proto, bytes } => self.handle_answer(server, proto, &bytes, now),
            Event::Failed { server, proto, error } => self.handle_failure(server, proto, error, now),
        }
    }

    fn handle_answer(&mut self, server: usize, proto: Protocol, answer: &[u8], now: Instant) {
        let header = match parse_header(answer) {
            Some(header) if header.qr => header,
            _ => {
                trace!(server, ?proto, len = answer.len(), "dropping malformed answer");
                return;
            }
        };

        // An ID may be shared by several live queries; the answer belongs
        // to the one waiting on this server and transport that asked the
        // same questions.
        let registry = &self.registry;
        let key = registry.matching(header.id)
            .iter()
            .cloned()
            .find(|&key| {
                registry.get(key).map_or(false, |query| {
                    query.server == server && query.proto == proto && query.deadline.is_some() &&
                    same_questions(&query.msg, answer)
                })
            });
        let key = match key {
            Some(key) => key,
            None => {
                trace!(id = header.id, server, ?proto, "no query waiting for this answer");
                return;
            }
        };

        if header.tc && proto == Protocol::Udp && !self.options.ignore_tc {
            debug!(id = header.id, server, "answer truncated, retrying over tcp");
            if let Some(query) = self.registry.get_mut(key) {
                // the truncated exchange does not count as an attempt
                query.proto = Protocol::Tcp;
                query.attempts = query.attempts.saturating_sub(1);
            }
            let _ = self.send_query(key, now);
            return;
        }

        if !self.options.no_check_resp {
            let status = match header.rcode {
                Rcode::SERVFAIL => Some(Error::ServFail),
                Rcode::NOTIMP => Some(Error::NotImp),
                Rcode::REFUSED => Some(Error::Refused),
                Rcode::FORMERR => Some(Error::FormErr),
                _ => None,
            };
            if let Some(status) = status {
                debug!(id = header.id, server, rcode = header.rcode, "server failed the query");
                if let Some(query) = self.registry.get_mut(key) {
                    query.status = Some(status);
                }
                self.next_server(key, now);
                return;
            }
        }

        self.end_query(key, answer);
    }

    /// Everything in flight on a broken socket goes to the next server.
    fn handle_failure(&mut self, server: usize, proto: Protocol, error: std::io::Error, now: Instant) {
        debug!(server, ?proto, %error, "connection to server failed");
        self.transport.close(server, proto);
        self.requeue_stranded(server, proto, None, now);
    }

    // Sends every query waiting on `server` over `proto`, bar `except`, on
    // to the next server.
    fn requeue_stranded(&mut self, server: usize, proto: Protocol, except: Option<QueryKey>, now: Instant) {
        let stranded: Vec<QueryKey> = self.registry
            .keys()
            .into_iter()
            .filter(|&key| Some(key) != except)
            .filter(|&key| {
                self.registry.get(key).map_or(false, |query| {
                    query.server == server && query.proto == proto && query.deadline.is_some()
                })
            })
            .collect();
        for key in stranded {
            if let Some(query) = self.registry.get_mut(key) {
                query.status = Some(Error::ConnRefused);
            }
            self.next_server(key, now);
        }
    }

    /// Moves every query whose deadline has passed on to its next server.
    pub fn handle_timeouts(&mut self, now: Instant) {
        for key in self.registry.expired(now) {
            if let Some(query) = self.registry.get_mut(key) {
                query.timeouts += 1;
                query.status = Some(Error::Timeout);
                debug!(id = query.id, server = query.server, timeouts = query.timeouts, "query timed out");
            }
            self.next_server(key, now);
        }
    }

    /// How long the caller may wait before something needs doing.
    pub fn next_timeout(&self, now: Instant, max: Option<Duration>) -> Option<Duration> {
        let next = self.registry
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (next, max) {
            (Some(next), Some(max)) => Some(cmp::min(next, max)),
            (next, None) => next,
            (None, max) => max,
        }
    }
}
