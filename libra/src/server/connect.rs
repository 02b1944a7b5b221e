//! The CONNECT handler: dial the target, reply, then relay.

use std::net::Ipv4Addr;

use log::debug;
use tokio::net::TcpStream;

use super::{session::relay, ServerConfig};
use crate::addr::Address;
use crate::codec::{socks4, socks5};
use crate::error::Error;
use crate::stream::Stream;
use crate::Peer;

pub(crate) async fn run_socks4(mut stream: TcpStream, target: Address, config: &ServerConfig) -> Result<(), Error> {
    match dial(target, config).await {
        Ok((outbound, local)) => {
            socks4::write_reply(&mut stream, socks4::rep::GRANTED, &local).await?;
            relay(stream, outbound).await;
            Ok(())
        }
        Err(e) => {
            socks4::write_reply(&mut stream, e.to_socks4_reply(), &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0)).await?;
            Err(e)
        }
    }
}

pub(crate) async fn run_socks5<S>(mut stream: S, target: Address, config: &ServerConfig) -> Result<(), Error>
where
    S: Stream + 'static,
{
    match dial(target, config).await {
        Ok((outbound, local)) => {
            socks5::write_reply(&mut stream, socks5::rep::SUCCEEDED, &local).await?;
            relay(stream, outbound).await;
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

async fn dial(target: Address, config: &ServerConfig) -> Result<(crate::DynStream, Address), Error> {
    debug!("dialing connect target {target}");
    let outbound = if config.dial_timeout.is_zero() {
        config.dial(target).await?
    } else {
        tokio::time::timeout(config.dial_timeout, config.dial(target)).await??
    };
    let local = Address::from(outbound.local_addr()?);
    Ok((outbound, local))
}
