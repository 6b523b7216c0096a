//! An asynchronous DNS stub resolver engine on top of mio.
//!
//! Callers hand a [`Channel`] already encoded queries; the channel copies
//! each one, picks UDP or TCP for it, and keeps sending it to the
//! configured name servers until an answer arrives, every attempt has
//! timed out, or the channel is dropped. Whatever happens, the query's
//! callback runs exactly once.
//!
//! ```no_run
//! use mio_dns_stub::{Channel, Options, QType};
//!
//! let options = Options::new().server("8.8.8.8").unwrap();
//! let mut channel = Channel::new(options).unwrap();
//! channel.query("example.com", QType::A, |answer, timeouts| {
//!     match answer {
//!         Ok(msg) => println!("{} bytes after {} timeouts", msg.len(), timeouts),
//!         Err(e) => println!("failed: {}", e),
//!     }
//! }).unwrap();
//! channel.run().unwrap();
//! ```
#[macro_use]
extern crate try_opt;
extern crate byteorder;
extern crate rand;
extern crate mio;

#[allow(dead_code, non_snake_case)]
pub mod QType {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const OPT: u16 = 41;
    pub const ANY: u16 = 255;
}

#[allow(dead_code, non_snake_case)]
pub mod QClass {
    pub const IN: u16 = 1;
}

#[macro_use]
mod network;
mod alloc;
mod channel;
mod engine;
mod error;
mod options;
mod parser;
mod query;
mod registry;
pub mod transport;

pub use channel::Channel;
pub use error::{Error, Result};
pub use options::{Options, DEFAULT_EDNS_PAYLOAD, PACKET_SIZE};
pub use parser::{HEADER_LEN, MAX_MESSAGE_LEN};
pub use query::{Callback, Protocol};
pub use transport::{Event, MioTransport, Transport};
