//! Wire framing for SOCKS4, SOCKS4a and SOCKS5, plus the SOCKS5 UDP
//! datagram header. Each sub-module owns exact-length reads and writes
//! directly against an `AsyncRead + AsyncWrite` stream: the handshake is a
//! small number of distinct multi-stage exchanges, not a uniform stream of
//! frames, so a direct imperative codec reads more plainly here than a
//! `tokio_util::codec::{Decoder, Encoder}` state machine would.

pub mod socks4;
pub mod socks5;
pub mod udp;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

/// Address type octets shared between the SOCKS5 request/reply and the
/// UDP datagram header.
pub mod atyp {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::Address;
use crate::error::Error;

/// Reads a SOCKS5-style address (`ATYP` + address bytes + port) used by
/// both the request/reply codec and the UDP datagram header.
pub(crate) async fn read_socks5_address<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Address, Error> {
    let aty = r.read_u8().await?;
    match aty {
        atyp::IPV4 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).await?;
            let port = r.read_u16().await?;
            Ok(Address::IPv4(buf.into(), port))
        }
        atyp::IPV6 => {
            let mut buf = [0u8; 16];
            r.read_exact(&mut buf).await?;
            let port = r.read_u16().await?;
            Ok(Address::IPv6(buf.into(), port))
        }
        atyp::DOMAIN => {
            let len = r.read_u8().await? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).await?;
            let host = String::from_utf8(buf)
                .map_err(|_| Error::AddressInvalid("domain is not valid utf-8".into()))?;
            let port = r.read_u16().await?;
            Ok(Address::Domain(host, port))
        }
        other => Err(Error::AddressInvalid(format!("unknown atyp {other:#x}"))),
    }
}

/// Writes a SOCKS5-style address. Invariant I4: the address-type byte
/// always matches the byte length of the address that follows. An
/// IPv4-mapped IPv6 address is normalized to plain IPv4 first, per
/// spec.md §4.2.
pub(crate) async fn write_socks5_address<W: AsyncWrite + Unpin>(
    w: &mut W,
    addr: &Address,
) -> Result<(), Error> {
    let addr = &addr.clone().normalize();
    match addr {
        Address::IPv4(ip, port) => {
            w.write_u8(atyp::IPV4).await?;
            w.write_all(&ip.octets()).await?;
            w.write_u16(*port).await?;
        }
        Address::IPv6(ip, port) => {
            w.write_u8(atyp::IPV6).await?;
            w.write_all(&ip.octets()).await?;
            w.write_u16(*port).await?;
        }
        Address::Domain(host, port) => {
            if host.len() > 255 {
                return Err(Error::AddressInvalid("domain name longer than 255 bytes".into()));
            }
            w.write_u8(atyp::DOMAIN).await?;
            w.write_u8(host.len() as u8).await?;
            w.write_all(host.as_bytes()).await?;
            w.write_u16(*port).await?;
        }
    }
    Ok(())
}

pub(crate) fn encoded_socks5_address_len(addr: &Address) -> usize {
    match addr {
        Address::IPv4(..) => 1 + 4 + 2,
        Address::IPv6(..) => 1 + 16 + 2,
        Address::Domain(host, _) => 1 + 1 + host.len() + 2,
    }
}
