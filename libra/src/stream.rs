//! The "any duplex byte stream" abstraction shared by the auth
//! negotiator, the client dialers and the server session — lets an auth
//! handler (or a chained upstream dialer) hand back a replacement
//! stream instead of the raw TCP connection, while still exposing the
//! local/remote addresses the unspecified-address substitution rule
//! (spec.md §9) needs.

use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::Peer;

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + Peer {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Peer> Stream for T {}

pub type DynStream = Pin<Box<dyn Stream>>;

pub fn box_stream<T: Stream + 'static>(s: T) -> DynStream {
    Box::pin(s)
}

impl Peer for DynStream {
    fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        (**self).remote_addr()
    }
}
