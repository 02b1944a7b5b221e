//! Per-connection state machine: `ACCEPT -> version dispatch -> GREETING
//! -> AUTH -> REQUEST -> RELAYING`, per spec.md §4.5.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::{associate, bind, connect, ServerConfig};
use crate::addr::Address;
use crate::auth::{run_no_auth, run_subnegotiation, select_method};
use crate::codec::socks4::{self, UserIdAuthCode};
use crate::codec::socks5::{self, method};
use crate::codec::{SOCKS4_VERSION, SOCKS5_VERSION};
use crate::error::Error;
use crate::stream::{DynStream, Stream};

/// Drives one accepted connection to completion: reads the version
/// byte, dispatches to the SOCKS4 or SOCKS5 path, and (on a successful
/// handler) relays until either side closes.
pub(crate) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let handshake = run_handshake(stream, peer, &config, &cancel);
    if config.conn_timeout.is_zero() {
        handshake.await
    } else {
        tokio::time::timeout(config.conn_timeout, handshake).await?
    }
}

async fn run_handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let ver = stream.read_u8().await?;
    match ver {
        SOCKS4_VERSION if config.version_switch.socks4 => run_socks4(stream, peer, config).await,
        SOCKS5_VERSION if config.version_switch.socks5 => run_socks5(stream, peer, config, cancel).await,
        other => {
            debug!("rejecting connection from {peer}: unsupported version {other:#x}");
            Err(Error::VersionNotSupported(other))
        }
    }
}

async fn run_socks4(mut stream: TcpStream, peer: SocketAddr, config: &ServerConfig) -> Result<(), Error> {
    let req = socks4::read_request(&mut stream).await?;
    trace!("socks4 request from {peer}: cmd={:#x} addr={}", req.cmd, req.addr);

    if let Some(validator) = &config.s4_user_id_auth {
        let code = validator(req.user_id.clone()).await;
        if code != UserIdAuthCode::Granted {
            socks4::write_reply(&mut stream, code.to_reply_code(), &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0)).await?;
            return Err(Error::UserIdInvalid);
        }
    }

    let enabled = match req.cmd {
        socks4::cmd::CONNECT => config.cmd_switch.connect,
        socks4::cmd::BIND => config.cmd_switch.bind,
        _ => false,
    };
    if !enabled {
        socks4::write_reply(&mut stream, socks4::rep::REJECTED_FAILED, &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0))
            .await?;
        return Err(Error::CommandNotSupported(req.cmd));
    }

    match req.cmd {
        socks4::cmd::CONNECT => connect::run_socks4(stream, req.addr, config).await,
        socks4::cmd::BIND => bind::run_socks4(stream, req.addr, config).await,
        other => Err(Error::CommandNotSupported(other)),
    }
}

async fn run_socks5(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let offered = socks5::read_greeting(&mut stream).await?;
    let chosen = select_method(&config.s5_auth, &offered);

    let authenticated: DynStream = match chosen {
        None => {
            socks5::write_method_selection(&mut stream, method::REJECTED).await?;
            return Err(Error::NoAcceptableMethods);
        }
        Some(method::NOAUTH) => {
            // NOAUTH has no wire sub-negotiation, so the accept/reject
            // decision happens before the method-selection reply: spec.md
            // §4.3 has the server answer 0xFF on reject.
            let (mut s, accepted) = run_no_auth(&config.s5_auth, stream).await?;
            if !accepted {
                socks5::write_method_selection(&mut s, method::REJECTED).await?;
                return Err(Error::AuthRejected);
            }
            socks5::write_method_selection(&mut s, method::NOAUTH).await?;
            s
        }
        Some(code) => {
            socks5::write_method_selection(&mut stream, code).await?;
            run_subnegotiation(&config.s5_auth, code, stream).await?
        }
    };

    let mut authenticated = authenticated;
    let mut head = [0u8; 2];
    authenticated.read_exact(&mut head).await?;
    let cmd = head[0];
    if head[1] != 0x00 {
        socks5::write_reply(&mut authenticated, socks5::rep::CONN_NOT_ALLOWED, &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0))
            .await?;
        return Err(Error::ProtocolParseError("reserved byte must be 0x00".into()));
    }
    let addr = crate::codec::read_socks5_address(&mut authenticated).await?;
    trace!("socks5 request from {peer}: cmd={cmd:#x} addr={addr}");

    let enabled = match cmd {
        socks5::cmd::CONNECT => config.cmd_switch.connect,
        socks5::cmd::BIND => config.cmd_switch.bind,
        socks5::cmd::UDP_ASSOCIATE => config.cmd_switch.udp_associate,
        _ => false,
    };
    if !enabled {
        socks5::write_reply(&mut authenticated, socks5::rep::COMMAND_NOT_SUPPORTED, &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0))
            .await?;
        return Err(Error::CommandNotSupported(cmd));
    }

    match cmd {
        socks5::cmd::CONNECT => connect::run_socks5(authenticated, addr, config).await,
        socks5::cmd::BIND => bind::run_socks5(authenticated, addr, config).await,
        socks5::cmd::UDP_ASSOCIATE => associate::run(authenticated, addr, config, cancel.child_token()).await,
        other => {
            socks5::write_reply(&mut authenticated, socks5::rep::COMMAND_NOT_SUPPORTED, &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0))
                .await
                .ok();
            Err(Error::CommandNotSupported(other))
        }
    }
}

/// Bidirectionally splices `a` and `b` until either side closes or
/// errors; used by CONNECT and BIND after their success reply.
pub(crate) async fn relay<A>(mut a: A, mut b: DynStream)
where
    A: Stream + 'static,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((to_b, to_a)) => trace!("relay finished: {to_b} bytes out, {to_a} bytes back"),
        Err(e) => warn!("relay ended with error: {e}"),
    }
}
