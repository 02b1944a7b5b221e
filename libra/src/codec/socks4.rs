//! SOCKS4 / SOCKS4a request and reply framing.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SOCKS4_VERSION;
use crate::addr::Address;
use crate::error::Error;

pub mod cmd {
    pub const CONNECT: u8 = 0x01;
    pub const BIND: u8 = 0x02;
}

pub mod rep {
    pub const GRANTED: u8 = 0x5A;
    pub const REJECTED_FAILED: u8 = 0x5B;
    pub const REJECTED_IDENTD_UNREACHABLE: u8 = 0x5C;
    pub const REJECTED_DIFFERENT_USER_ID: u8 = 0x5D;
}

/// The result of validating a SOCKS4 `user_id`, mirroring the four-way
/// outcome `go-socks` calls `S4IdAuthCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIdAuthCode {
    Granted,
    RejectedFailed,
    RejectedIdentdUnreachable,
    RejectedDifferentUserId,
}

impl UserIdAuthCode {
    pub fn to_reply_code(self) -> u8 {
        match self {
            UserIdAuthCode::Granted => rep::GRANTED,
            UserIdAuthCode::RejectedFailed => rep::REJECTED_FAILED,
            UserIdAuthCode::RejectedIdentdUnreachable => rep::REJECTED_IDENTD_UNREACHABLE,
            UserIdAuthCode::RejectedDifferentUserId => rep::REJECTED_DIFFERENT_USER_ID,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: u8,
    pub addr: Address,
    pub user_id: Vec<u8>,
}

/// Reads a SOCKS4/SOCKS4a request. The caller has already consumed the
/// leading version byte (used to pick the v4 vs v5 path).
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request, Error> {
    let mut head = [0u8; 7];
    r.read_exact(&mut head).await?;
    let cmd = head[0];
    let port = u16::from_be_bytes([head[1], head[2]]);
    let ip = Ipv4Addr::new(head[3], head[4], head[5], head[6]);

    let user_id = read_null_terminated(r).await?;

    // SOCKS4a sentinel: first three octets zero, fourth nonzero.
    let addr = if head[3] == 0 && head[4] == 0 && head[5] == 0 && head[6] != 0 {
        let host_bytes = read_null_terminated(r).await?;
        let host = String::from_utf8(host_bytes)
            .map_err(|_| Error::ProtocolParseError("socks4a host is not valid utf-8".into()))?;
        Address::Domain(host, port)
    } else {
        Address::IPv4(ip, port)
    };

    Ok(Request { cmd, addr, user_id })
}

async fn read_null_terminated<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    loop {
        let b = r.read_u8().await?;
        if b == 0x00 {
            return Ok(out);
        }
        out.push(b);
        if out.len() > 4096 {
            return Err(Error::ProtocolParseError(
                "null-terminated field exceeded 4096 bytes".into(),
            ));
        }
    }
}

/// Writes a SOCKS4 reply. SOCKS4 has no representation for IPv6 or domain
/// bound addresses; per spec.md §4.1 they are substituted with
/// `0.0.0.0`.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: u8,
    addr: &Address,
) -> Result<(), Error> {
    let ip = match addr {
        Address::IPv4(ip, _) if !ip.is_unspecified() => *ip,
        _ => Ipv4Addr::UNSPECIFIED,
    };
    let mut buf = [0u8; 8];
    buf[0] = 0x00;
    buf[1] = code;
    buf[2..4].copy_from_slice(&addr.port().to_be_bytes());
    buf[4..8].copy_from_slice(&ip.octets());
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u8, Address), Error> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    if buf[0] != 0x00 {
        return Err(Error::ProtocolParseError("socks4 reply byte 0 must be 0x00".into()));
    }
    let code = buf[1];
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Ok((code, Address::IPv4(ip, port)))
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    cmd: u8,
    addr: &Address,
    user_id: &[u8],
) -> Result<(), Error> {
    w.write_u8(SOCKS4_VERSION).await?;
    w.write_u8(cmd).await?;
    w.write_u16(addr.port()).await?;
    match addr {
        Address::IPv4(ip, _) => {
            w.write_all(&ip.octets()).await?;
            w.write_all(user_id).await?;
            w.write_u8(0x00).await?;
        }
        Address::IPv6(..) => return Err(Error::Ipv6NotSupportedBySocks4),
        Address::Domain(host, _) => {
            // SOCKS4a sentinel: 0.0.0.X, X != 0.
            w.write_all(&[0, 0, 0, 1]).await?;
            w.write_all(user_id).await?;
            w.write_u8(0x00).await?;
            w.write_all(host.as_bytes()).await?;
            w.write_u8(0x00).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_plain_ipv4_request() {
        let mut buf = Vec::new();
        write_request(&mut buf, cmd::CONNECT, &Address::IPv4(Ipv4Addr::new(1, 2, 3, 4), 80), b"abc")
            .await
            .unwrap();
        // Skip version byte, which read_request expects the caller to have consumed.
        let mut cur = Cursor::new(&buf[1..]);
        let req = read_request(&mut cur).await.unwrap();
        assert_eq!(req.cmd, cmd::CONNECT);
        assert_eq!(req.addr, Address::IPv4(Ipv4Addr::new(1, 2, 3, 4), 80));
        assert_eq!(req.user_id, b"abc");
    }

    #[tokio::test]
    async fn round_trips_socks4a_domain_request() {
        let mut buf = Vec::new();
        write_request(&mut buf, cmd::CONNECT, &Address::Domain("example.com".into(), 443), b"")
            .await
            .unwrap();
        let mut cur = Cursor::new(&buf[1..]);
        let req = read_request(&mut cur).await.unwrap();
        assert_eq!(req.addr, Address::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn reply_substitutes_zero_for_non_ipv4() {
        let mut buf = Vec::new();
        write_reply(&mut buf, rep::GRANTED, &Address::Domain("x".into(), 1)).await.unwrap();
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
    }
}
