//! Moving messages to and from the name servers.

use std::io;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::{Events, Poll, PollOpt, Ready, Token};
use mio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::network::*;
use crate::query::Protocol;

const BUF_SIZE: usize = 65536;
const EVENTS_CAPACITY: usize = 1024;

/// Something that happened on the wire during `Transport::poll`.
#[derive(Debug)]
pub enum Event {
    Answer {
        server: usize,
        proto: Protocol,
        bytes: Vec<u8>,
    },
    /// The socket towards a server broke and was closed. Whatever was in
    /// flight on it is lost.
    Failed {
        server: usize,
        proto: Protocol,
        error: io::Error,
    },
}

/// The socket layer under a `Channel`.
///
/// Servers are addressed by their index in `Options::servers`.
pub trait Transport {
    /// Queues `msg` for `server`. An error means it surely did not go out.
    ///
    /// A failed datagram affects only itself. A failed stream write drops
    /// the connection along with everything in flight on it.
    fn send(&mut self, server: usize, proto: Protocol, msg: &[u8]) -> io::Result<()>;

    /// Waits up to `timeout` for the sockets and appends what happened to
    /// `events`.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()>;

    /// Drops the socket for `server` and `proto`, if any.
    fn close(&mut self, server: usize, proto: Protocol);
}

fn token(server: usize, proto: Protocol) -> Token {
    match proto {
        Protocol::Udp => Token(server * 2),
        Protocol::Tcp => Token(server * 2 + 1),
    }
}

fn from_token(token: Token) -> (usize, Protocol) {
    let proto = if token.0 % 2 == 0 { Protocol::Udp } else { Protocol::Tcp };
    (token.0 / 2, proto)
}

/// Prefixes `msg` with its length, as messages travel over TCP.
fn frame(msg: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    if msg.len() > u16::max_value() as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "message too long"));
    }
    try_pack!(u16, out, msg.len() as u16);
    out.extend_from_slice(msg);
    Ok(())
}

/// Moves every complete length-prefixed message out of `buf`.
fn unframe(buf: &mut Vec<u8>, frames: &mut Vec<Vec<u8>>) {
    let mut start = 0;
    while let Some(len) = u16_at(buf, start) {
        let end = start + 2 + len as usize;
        if buf.len() < end {
            break;
        }
        frames.push(buf[start + 2..end].to_vec());
        start = end;
    }
    buf.drain(..start);
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::NotConnected
}

struct TcpConn {
    stream: TcpStream,
    out: Vec<u8>,
    inbuf: Vec<u8>,
}

impl TcpConn {
    fn flush(&mut self) -> io::Result<()> {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed")),
                Ok(n) => {
                    self.out.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if would_block(e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // Ok(false) once the peer has closed the connection.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.inbuf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if would_block(e) => return Ok(true),
                Err(e) => return Err(e),
            }
        }
    }
}

struct Server {
    addr: SocketAddr,
    udp: Option<UdpSocket>,
    tcp: Option<TcpConn>,
}

/// `Transport` on top of a private `mio::Poll`.
///
/// Sockets are opened on first use: one UDP socket and at most one TCP
/// connection per server.
pub struct MioTransport {
    poll: Poll,
    events: Events,
    servers: Vec<Server>,
    receive_buf: Vec<u8>,
}

impl MioTransport {
    pub fn new(servers: &[SocketAddr]) -> io::Result<MioTransport> {
        let servers = servers.iter()
            .map(|addr| {
                Server {
                    addr: *addr,
                    udp: None,
                    tcp: None,
                }
            })
            .collect();

        Ok(MioTransport {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            servers: servers,
            receive_buf: vec![0; BUF_SIZE],
        })
    }

    fn send_udp(&mut self, server: usize, msg: &[u8]) -> io::Result<()> {
        let poll = &self.poll;
        let srv = self.servers
            .get_mut(server)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such server"))?;
        if srv.udp.is_none() {
            let sock = UdpSocket::bind(&local_addr_for(&srv.addr))?;
            poll.register(&sock, token(server, Protocol::Udp), Ready::readable(), PollOpt::edge())?;
            srv.udp = Some(sock);
        }
        match srv.udp {
            Some(ref sock) => sock.send_to(msg, &srv.addr).map(|_| ()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        }
    }

    fn send_tcp(&mut self, server: usize, msg: &[u8]) -> io::Result<()> {
        let mut framed = Vec::with_capacity(msg.len() + 2);
        frame(msg, &mut framed)?;

        let poll = &self.poll;
        let srv = self.servers
            .get_mut(server)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such server"))?;
        if srv.tcp.is_none() {
            let stream = TcpStream::connect(&srv.addr)?;
            poll.register(&stream,
                          token(server, Protocol::Tcp),
                          Ready::readable() | Ready::writable(),
                          PollOpt::edge())?;
            debug!(server = %srv.addr, "opened tcp connection");
            srv.tcp = Some(TcpConn {
                stream: stream,
                out: Vec::new(),
                inbuf: Vec::new(),
            });
        }
        match srv.tcp {
            Some(ref mut conn) => {
                conn.out.extend_from_slice(&framed);
                conn.flush()
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")),
        }
    }

    fn receive_udp(&mut self, server: usize, events: &mut Vec<Event>) {
        let srv = match self.servers.get_mut(server) {
            Some(srv) => srv,
            None => return,
        };
        let mut failed = None;
        if let Some(ref sock) = srv.udp {
            loop {
                match sock.recv_from(&mut self.receive_buf) {
                    Ok((nread, from)) => {
                        if from != srv.addr {
                            trace!(%from, server = %srv.addr, "dropping datagram from unexpected address");
                            continue;
                        }
                        events.push(Event::Answer {
                            server: server,
                            proto: Protocol::Udp,
                            bytes: self.receive_buf[..nread].to_vec(),
                        });
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(error) = failed {
            self.close(server, Protocol::Udp);
            events.push(Event::Failed {
                server: server,
                proto: Protocol::Udp,
                error: error,
            });
        }
    }

    fn ready_tcp(&mut self, server: usize, readiness: Ready, events: &mut Vec<Event>) {
        let srv = match self.servers.get_mut(server) {
            Some(srv) => srv,
            None => return,
        };
        let mut failed = None;
        if let Some(ref mut conn) = srv.tcp {
            if readiness.is_writable() {
                if let Err(e) = conn.flush() {
                    failed = Some(e);
                }
            }
            if failed.is_none() && readiness.is_readable() {
                match conn.fill(&mut self.receive_buf) {
                    Ok(open) => {
                        let mut frames = Vec::new();
                        unframe(&mut conn.inbuf, &mut frames);
                        for bytes in frames {
                            events.push(Event::Answer {
                                server: server,
                                proto: Protocol::Tcp,
                                bytes: bytes,
                            });
                        }
                        if !open {
                            failed = Some(io::Error::new(io::ErrorKind::ConnectionAborted,
                                                         "connection closed by server"));
                        }
                    }
                    Err(e) => failed = Some(e),
                }
            }
        }
        if let Some(error) = failed {
            self.close(server, Protocol::Tcp);
            events.push(Event::Failed {
                server: server,
                proto: Protocol::Tcp,
                error: error,
            });
        }
    }
}

impl Transport for MioTransport {
    fn send(&mut self, server: usize, proto: Protocol, msg: &[u8]) -> io::Result<()> {
        match proto {
            // a datagram that cannot go out leaves the socket usable
            Protocol::Udp => self.send_udp(server, msg),
            Protocol::Tcp => {
                let res = self.send_tcp(server, msg);
                if let Err(ref e) = res {
                    if e.kind() != io::ErrorKind::InvalidInput {
                        self.close(server, proto);
                    }
                }
                res
            }
        }
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, Ready)> = self.events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();
        for (token, readiness) in ready {
            match from_token(token) {
                (server, Protocol::Udp) => self.receive_udp(server, events),
                (server, Protocol::Tcp) => self.ready_tcp(server, readiness, events),
            }
        }
        Ok(())
    }

    fn close(&mut self, server: usize, proto: Protocol) {
        let poll = &self.poll;
        if let Some(srv) = self.servers.get_mut(server) {
            match proto {
                Protocol::Udp => {
                    if let Some(sock) = srv.udp.take() {
                        let _ = poll.deregister(&sock);
                    }
                }
                Protocol::Tcp => {
                    if let Some(conn) = srv.tcp.take() {
                        debug!(server = %srv.addr, "closing tcp connection");
                        let _ = poll.deregister(&conn.stream);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::io;
    use std::rc::Rc;
    use std::time::Duration;

    use super::{Event, Transport};
    use crate::error::{Error, Result};
    use crate::query::Protocol;

    #[derive(Default)]
    pub struct State {
        pub sent: Vec<(usize, Protocol, Vec<u8>)>,
        pub incoming: Vec<Event>,
        pub unreachable: HashSet<usize>,
        pub closed: Vec<(usize, Protocol)>,
        pub polls: usize,
    }

    /// In-memory transport; the test keeps a handle on the shared state.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub state: Rc<RefCell<State>>,
    }

    impl MockTransport {
        pub fn sent(&self) -> Vec<(usize, Protocol, Vec<u8>)> {
            self.state.borrow().sent.clone()
        }

        pub fn deliver(&self, server: usize, proto: Protocol, bytes: Vec<u8>) {
            self.state.borrow_mut().incoming.push(Event::Answer {
                server: server,
                proto: proto,
                bytes: bytes,
            });
        }

        pub fn break_socket(&self, server: usize, proto: Protocol) {
            self.state.borrow_mut().incoming.push(Event::Failed {
                server: server,
                proto: proto,
                error: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
            });
        }

        pub fn unreachable(&self, server: usize) {
            self.state.borrow_mut().unreachable.insert(server);
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, server: usize, proto: Protocol, msg: &[u8]) -> io::Result<()> {
            let mut state = self.state.borrow_mut();
            if state.unreachable.contains(&server) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            state.sent.push((server, proto, msg.to_vec()));
            Ok(())
        }

        fn poll(&mut self, _timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
            let mut state = self.state.borrow_mut();
            state.polls += 1;
            events.extend(state.incoming.drain(..));
            Ok(())
        }

        fn close(&mut self, server: usize, proto: Protocol) {
            self.state.borrow_mut().closed.push((server, proto));
        }
    }

    /// What each callback received, in the order they ran.
    #[derive(Clone, Default)]
    pub struct Calls {
        pub log: Rc<RefCell<Vec<(usize, Result<Vec<u8>>, usize)>>>,
    }

    impl Calls {
        /// A callback that records itself under `tag`.
        pub fn callback(&self, tag: usize) -> impl FnOnce(Result<&[u8]>, usize) + 'static {
            let log = self.log.clone();
            move |res: Result<&[u8]>, timeouts: usize| {
                log.borrow_mut().push((tag, res.map(|answer| answer.to_vec()), timeouts));
            }
        }

        pub fn len(&self) -> usize {
            self.log.borrow().len()
        }

        pub fn count(&self, tag: usize) -> usize {
            self.log.borrow().iter().filter(|entry| entry.0 == tag).count()
        }

        /// Status and timeouts of the only call made for `tag`.
        pub fn only(&self, tag: usize) -> (std::result::Result<Vec<u8>, String>, usize) {
            let log = self.log.borrow();
            let calls: Vec<_> = log.iter().filter(|entry| entry.0 == tag).collect();
            assert_eq!(calls.len(), 1, "callback {} ran {} times", tag, calls.len());
            let (_, ref res, timeouts) = *calls[0];
            let res = match *res {
                Ok(ref answer) => Ok(answer.clone()),
                Err(ref e) => Err(e.to_string()),
            };
            (res, timeouts)
        }

        pub fn error(&self, tag: usize) -> Error {
            let log = self.log.borrow();
            let entry = log.iter().find(|entry| entry.0 == tag).expect("callback did not run");
            match entry.1 {
                Ok(_) => panic!("callback {} succeeded", tag),
                Err(ref e) => e.duplicate(),
            }
        }
    }

    /// A query for `name` with a fixed ID.
    pub fn query_msg(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut msg = crate::parser::build_request(name, qtype, true, None).unwrap();
        msg[0] = (id >> 8) as u8;
        msg[1] = id as u8;
        msg
    }

    /// The answer a server would give to `query`, with no records.
    pub fn answer_to(query: &[u8], rcode: u8, truncated: bool) -> Vec<u8> {
        let mut answer = query.to_vec();
        answer[2] |= 0b10000000;
        if truncated {
            answer[2] |= 0b00000010;
        }
        answer[3] = (answer[3] & 0xf0) | rcode;
        answer
    }
}
