#![allow(dead_code)]

//! `libra` — a SOCKS4, SOCKS4a and SOCKS5 proxy toolkit: client-side
//! dialers plus a server that negotiates version/authentication and
//! dispatches CONNECT, BIND and (SOCKS5-only) UDPASSOCIATE.

pub mod addr;
pub mod auth;
pub mod client;
pub mod codec;
pub mod error;
pub mod server;
pub mod stream;

pub use addr::Address;
pub use error::Error;
pub use stream::{box_stream, DynStream, Stream};

use std::io;
use std::net::SocketAddr;

/// A thing with a local and a remote socket address — TCP streams on
/// every platform this crate targets.
pub trait Peer {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn remote_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        Ok((self.local_addr()?, self.remote_addr()?))
    }
}

impl Peer for tokio::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::local_addr(self)
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self)
    }
}
