//! Errors that can occur while starting up or configuring the relay.
//!
//! Per-datagram processing never surfaces an error here: a malformed query is
//! dropped, an unparseable upstream answer just skips the cache insert. Only
//! problems that should abort the process (bad CLI input, a file that can't
//! be read, a socket that can't bind) flow through `RelayError`.
use std::fmt;
use std::io;
use std::net::AddrParseError;

#[derive(Debug)]
pub enum RelayError {
    Io(io::Error),
    AddrParse(AddrParseError),
    /// the upstream resolver would create a forwarding loop
    DisallowedUpstream(String),
    Config(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Io(e) => write!(f, "I/O error: {e}"),
            RelayError::AddrParse(e) => write!(f, "invalid address: {e}"),
            RelayError::DisallowedUpstream(s) => {
                write!(f, "upstream resolver {s} would create a forwarding loop")
            }
            RelayError::Config(s) => write!(f, "configuration error: {s}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::Io(err)
    }
}

impl From<AddrParseError> for RelayError {
    fn from(err: AddrParseError) -> Self {
        RelayError::AddrParse(err)
    }
}
