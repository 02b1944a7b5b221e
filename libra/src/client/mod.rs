//! Client-side dialers: one per `(version, cmd)` pair, composing a
//! handshake against a remote SOCKS server and handing back either a
//! live stream (CONNECT/BIND) or a packet handle (SOCKS5 UDPASSOCIATE).

pub mod socks4;
pub mod socks5;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::{TcpStream, UdpSocket};

use crate::stream::{box_stream, DynStream};

/// An outbound TCP dialer, injected so one SOCKS dialer can be chained
/// through another (proxy-through-proxy) instead of opening a raw TCP
/// connection itself.
pub type Dialer = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<DynStream>> + Send + Sync>;

/// An injected UDP socket factory, used by the UDPASSOCIATE dialer in
/// place of opening a local ephemeral UDP socket directly.
pub type PacketListener =
    Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, io::Result<UdpSocket>> + Send + Sync>;

/// The callback a BIND dialer invokes with the server's advertised
/// listening address, so the caller can trigger the third party to
/// connect to it.
pub type BindCallback = Arc<dyn Fn(crate::addr::Address) -> BoxFuture<'static, io::Result<()>> + Send + Sync>;

pub(crate) async fn default_dial(addr: &str) -> io::Result<DynStream> {
    let stream = TcpStream::connect(addr).await?;
    Ok(box_stream(stream))
}

pub(crate) async fn dial_proxy(forward: &Option<Dialer>, addr: &str) -> io::Result<DynStream> {
    match forward {
        Some(f) => f(addr.to_owned()).await,
        None => default_dial(addr).await,
    }
}
