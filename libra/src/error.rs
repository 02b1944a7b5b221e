//! Error taxonomy shared by the wire codec, auth negotiator, client
//! dialers and server session.

use crate::codec::socks4;
use crate::codec::socks5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol parse error: {0}")]
    ProtocolParseError(String),

    #[error("socks version {0:#x} not supported")]
    VersionNotSupported(u8),

    #[error("command {0:#x} not supported")]
    CommandNotSupported(u8),

    #[error("socks4 user-id invalid")]
    UserIdInvalid,

    #[error("socks5 authentication rejected")]
    AuthRejected,

    #[error("no acceptable socks5 authentication methods")]
    NoAcceptableMethods,

    #[error("socks5 server requires authentication this client cannot satisfy")]
    NeedsAuth,

    #[error("address invalid: {0}")]
    AddressInvalid(String),

    #[error("socks5 udp datagram could not be unmarshalled")]
    UdpDataUnmarshalFailure,

    #[error("socks4 does not support ipv6 addresses")]
    Ipv6NotSupportedBySocks4,

    #[error("network {0} not supported")]
    NetworkNotSupported(String),

    /// A non-success reply code read back from a server, carrying the
    /// code and its human-readable meaning.
    #[error("{1} ({0:#x})")]
    Reply(u8, &'static str),

    #[error("operation timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps an error encountered while servicing a request to the SOCKS5
    /// reply code that should be sent back, per spec.md §4.6/§7.
    pub fn to_socks5_reply(&self) -> u8 {
        match self {
            Error::CommandNotSupported(_) => socks5::rep::COMMAND_NOT_SUPPORTED,
            Error::AddressInvalid(_) => socks5::rep::ADDRESS_TYPE_NOT_SUPPORTED,
            Error::NetworkNotSupported(_) => socks5::rep::NETWORK_UNREACHABLE,
            Error::Timeout(_) => socks5::rep::TTL_EXPIRED,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => socks5::rep::CONNECTION_REFUSED,
                std::io::ErrorKind::TimedOut => socks5::rep::TTL_EXPIRED,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::AddrNotAvailable => {
                    socks5::rep::HOST_UNREACHABLE
                }
                _ => socks5::rep::GENERAL_FAILURE,
            },
            _ => socks5::rep::GENERAL_FAILURE,
        }
    }

    /// Maps an error to the SOCKS4 reply code that should be sent back.
    /// SOCKS4 has no rich taxonomy: everything besides a user-id mismatch
    /// collapses to "rejected or failed".
    pub fn to_socks4_reply(&self) -> u8 {
        match self {
            Error::UserIdInvalid => socks4::rep::REJECTED_DIFFERENT_USER_ID,
            _ => socks4::rep::REJECTED_FAILED,
        }
    }
}
