//! The BIND handler: listen on an ephemeral port, reply with its
//! address, wait for a peer matching the request's `raddr`, reply again,
//! then relay. Two replies on the same client stream, per invariant I3.

use std::net::{Ipv4Addr, SocketAddr};

use log::debug;
use tokio::net::TcpStream;

use super::{session::relay, ServerConfig};
use crate::addr::Address;
use crate::codec::{socks4, socks5};
use crate::error::Error;
use crate::stream::{box_stream, Stream};

pub(crate) async fn run_socks4(mut stream: TcpStream, raddr: Address, config: &ServerConfig) -> Result<(), Error> {
    let listener = config.listen_tcp().await.map_err(Error::Io)?;
    let listener_addr = Address::from(listener.local_addr()?);
    socks4::write_reply(&mut stream, socks4::rep::GRANTED, &listener_addr).await?;

    match accept_matching_listener(listener, raddr, config.bind_timeout).await {
        Ok((peer_addr, conn)) => {
            socks4::write_reply(&mut stream, socks4::rep::GRANTED, &peer_addr).await?;
            relay(stream, box_stream(conn)).await;
            Ok(())
        }
        Err(e) => {
            socks4::write_reply(&mut stream, e.to_socks4_reply(), &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0)).await?;
            Err(e)
        }
    }
}

pub(crate) async fn run_socks5<S>(mut stream: S, raddr: Address, config: &ServerConfig) -> Result<(), Error>
where
    S: Stream + 'static,
{
    let listener = config.listen_tcp().await.map_err(Error::Io)?;
    let listener_addr = Address::from(listener.local_addr()?);
    socks5::write_reply(&mut stream, socks5::rep::SUCCEEDED, &listener_addr).await?;

    match accept_matching_listener(listener, raddr, config.bind_timeout).await {
        Ok((peer_addr, conn)) => {
            socks5::write_reply(&mut stream, socks5::rep::SUCCEEDED, &peer_addr).await?;
            relay(stream, box_stream(conn)).await;
            Ok(())
        }
        Err(e) => {
            socks5::write_reply(&mut stream, e.to_socks5_reply(), &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0))
                .await
                .ok();
            Err(e)
        }
    }
}

async fn accept_matching_listener(
    listener: tokio::net::TcpListener,
    raddr: Address,
    bind_timeout: std::time::Duration,
) -> Result<(Address, TcpStream), Error> {
    let accept_loop = async {
        loop {
            let (conn, peer) = listener.accept().await?;
            if peer_matches(&raddr, peer) {
                return Ok::<_, std::io::Error>((conn, peer));
            }
            debug!("bind: dropping non-matching peer {peer}");
        }
    };

    let (conn, peer) = match tokio::time::timeout(bind_timeout, accept_loop).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(Error::Io(e)),
        Err(elapsed) => return Err(Error::from(elapsed)),
    };
    Ok((Address::from(peer), conn))
}

fn peer_matches(raddr: &Address, peer: SocketAddr) -> bool {
    match raddr.to_socket_addr() {
        Some(want) if want.port() == 0 => want.ip() == peer.ip(),
        Some(want) => want == peer,
        // A domain-name raddr (unusual for BIND) matches any peer; the
        // caller supplied a name, not an address, to filter against.
        None => true,
    }
}
