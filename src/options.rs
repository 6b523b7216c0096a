use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;
use crate::network::parse_server;

/// Largest message a plain (non-EDNS) UDP exchange may carry.
pub const PACKET_SIZE: usize = 512;
/// Payload size advertised when EDNS is on and nothing else is configured.
pub const DEFAULT_EDNS_PAYLOAD: u16 = 1232;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Name servers in order of preference.
    pub servers: Vec<SocketAddr>,
    /// Always talk TCP.
    pub use_tcp: bool,
    /// Queries carry an OPT record and may use larger UDP messages.
    pub edns: bool,
    pub edns_payload_size: u16,
    /// Time to wait for the first attempt; doubles each round over the
    /// server list.
    pub timeout: Duration,
    pub max_timeout: Duration,
    /// Rounds over the server list before giving up.
    pub tries: usize,
    /// Start each query at a random server instead of the first one.
    pub rotate: bool,
    /// Keep truncated UDP answers instead of retrying over TCP.
    pub ignore_tc: bool,
    /// Deliver SERVFAIL, NOTIMP and REFUSED answers instead of moving on
    /// to the next server.
    pub no_check_resp: bool,
    /// Set RD on queries built by `Channel::query`.
    pub recurse: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            servers: Vec::new(),
            use_tcp: false,
            edns: false,
            edns_payload_size: DEFAULT_EDNS_PAYLOAD,
            timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(30),
            tries: 3,
            rotate: false,
            ignore_tc: false,
            no_check_resp: false,
            recurse: true,
        }
    }
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// Appends a name server, see `network::parse_server` for the syntax.
    pub fn server(mut self, server: &str) -> Result<Options> {
        let addr = parse_server(server)?;
        self.servers.push(addr);
        Ok(self)
    }

    pub fn use_tcp(mut self, yes: bool) -> Options {
        self.use_tcp = yes;
        self
    }

    /// Turns EDNS on with the given payload size.
    pub fn edns(mut self, payload_size: u16) -> Options {
        self.edns = true;
        self.edns_payload_size = payload_size;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Options {
        self.timeout = timeout;
        self
    }

    pub fn tries(mut self, tries: usize) -> Options {
        self.tries = tries;
        self
    }

    pub fn rotate(mut self, yes: bool) -> Options {
        self.rotate = yes;
        self
    }

    /// Largest message that still goes out over UDP.
    pub fn udp_max(&self) -> usize {
        if self.edns {
            self.edns_payload_size as usize
        } else {
            PACKET_SIZE
        }
    }
}
