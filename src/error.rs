use std::io;
use std::result;

use thiserror::Error;

/// Every status a submission can end with.
///
/// The first three are reported synchronously by `Channel::send`; the rest
/// arrive later through the completion callback.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed query")]
    BadQuery,
    #[error("no usable name server")]
    ServFail,
    #[error("out of memory")]
    NoMemory,
    #[error("timeout")]
    Timeout,
    #[error("query refused by name server")]
    Refused,
    #[error("name server could not interpret the query")]
    FormErr,
    #[error("query type not implemented by name server")]
    NotImp,
    #[error("could not contact name server")]
    ConnRefused,
    #[error("query cancelled")]
    Cancelled,
    #[error("invalid server {0}")]
    InvalidServer(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Copies a status so it can go both to the callback and back to the
    /// caller. `io::Error` is not `Clone`; its kind and message survive.
    pub(crate) fn duplicate(&self) -> Error {
        match *self {
            Error::BadQuery => Error::BadQuery,
            Error::ServFail => Error::ServFail,
            Error::NoMemory => Error::NoMemory,
            Error::Timeout => Error::Timeout,
            Error::Refused => Error::Refused,
            Error::FormErr => Error::FormErr,
            Error::NotImp => Error::NotImp,
            Error::ConnRefused => Error::ConnRefused,
            Error::Cancelled => Error::Cancelled,
            Error::InvalidServer(ref server) => Error::InvalidServer(server.clone()),
            Error::Io(ref e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            e => {
                let errmsg = format!("dns resolve error: {}", e);
                io::Error::new(io::ErrorKind::Other, errmsg)
            }
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
