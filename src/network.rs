use std::io;
use std::io::Cursor;
use std::str::FromStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const DNS_PORT: u16 = 53;

pub fn pair2addr4(ip: &str, port: u16) -> io::Result<SocketAddr> {
    match Ipv4Addr::from_str(ip) {
        Ok(addr) => Ok(SocketAddr::new(IpAddr::V4(addr), port)),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

pub fn pair2addr6(ip: &str, port: u16) -> io::Result<SocketAddr> {
    match Ipv6Addr::from_str(ip) {
        Ok(addr) => Ok(SocketAddr::new(IpAddr::V6(addr), port)),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

pub fn pair2addr(ip: &str, port: u16) -> io::Result<SocketAddr> {
    pair2addr4(ip, port).or_else(|_| pair2addr6(ip, port))
}

/// Parses a name server given as `ip`, `ip:port` or `[ipv6]:port`.
///
/// A bare address gets the DNS port.
pub fn parse_server(server: &str) -> Result<SocketAddr> {
    let server = server.trim();
    if let Ok(addr) = SocketAddr::from_str(server) {
        return Ok(addr);
    }
    pair2addr(server, DNS_PORT).map_err(|_| Error::InvalidServer(server.to_string()))
}

/// The wildcard address of the same family as `server`, for binding a
/// socket that talks to it.
pub fn local_addr_for(server: &SocketAddr) -> SocketAddr {
    match *server {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

pub trait NetworkWriteBytes: WriteBytesExt {
    fn put_u8(&mut self, num: u8) -> io::Result<()> {
        self.write_u8(num)
    }

    fn put_u16(&mut self, num: u16) -> io::Result<()> {
        self.write_u16::<NetworkEndian>(num)
    }

    fn put_u32(&mut self, num: u32) -> io::Result<()> {
        self.write_u32::<NetworkEndian>(num)
    }
}

impl NetworkWriteBytes for Vec<u8> {}

pub trait NetworkReadBytes: ReadBytesExt {
    fn get_u8(&mut self) -> io::Result<u8> {
        self.read_u8()
    }

    fn get_u16(&mut self) -> io::Result<u16> {
        self.read_u16::<NetworkEndian>()
    }
}

impl<'a> NetworkReadBytes for Cursor<&'a [u8]> {}

/// Reads a big-endian `u16` at `offset`, if the slice is long enough.
pub fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Cursor::new(bytes).get_u16().ok()
}

macro_rules! pack {
    (u32, $r:expr, $v:expr) => ( try_opt!($r.put_u32($v).ok()) );
    (u16, $r:expr, $v:expr) => ( try_opt!($r.put_u16($v).ok()) );
    (u8, $r:expr, $v:expr) => ( try_opt!($r.put_u8($v).ok()) );
}

macro_rules! unpack {
    (u16, $r:expr) => ( try_opt!($r.get_u16().ok()) );
    (u8, $r:expr) => ( try_opt!($r.get_u8().ok()) );
}

macro_rules! try_pack {
    (u16, $r:expr, $v:expr) => ( $r.put_u16($v)? );
}
