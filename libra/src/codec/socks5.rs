//! SOCKS5 greeting/method-selection, RFC 1929 PASSWORD sub-negotiation,
//! and request/reply framing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{encoded_socks5_address_len, read_socks5_address, write_socks5_address, SOCKS5_VERSION};
use crate::addr::Address;
use crate::error::Error;

pub mod method {
    pub const NOAUTH: u8 = 0x00;
    pub const GSSAPI: u8 = 0x01;
    pub const PASSWORD: u8 = 0x02;
    pub const IANA_MIN: u8 = 0x03;
    pub const IANA_MAX: u8 = 0x7f;
    pub const PRIVATE_MIN: u8 = 0x80;
    pub const PRIVATE_MAX: u8 = 0xfe;
    pub const REJECTED: u8 = 0xff;
}

pub mod cmd {
    pub const CONNECT: u8 = 0x01;
    pub const BIND: u8 = 0x02;
    pub const UDP_ASSOCIATE: u8 = 0x03;
}

pub mod rep {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONN_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

pub const AUTH_VERSION: u8 = 0x01;
pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;

/// Reads the client's greeting: `{VER, NMETHODS, METHODS[0..NMETHODS)}`.
/// The caller has already consumed the leading version byte.
pub async fn read_greeting<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, Error> {
    let n = r.read_u8().await? as usize;
    let mut methods = vec![0u8; n];
    r.read_exact(&mut methods).await?;
    Ok(methods)
}

pub async fn write_greeting<W: AsyncWrite + Unpin>(w: &mut W, methods: &[u8]) -> Result<(), Error> {
    if methods.len() > 255 {
        return Err(Error::ProtocolParseError("more than 255 auth methods offered".into()));
    }
    w.write_u8(SOCKS5_VERSION).await?;
    w.write_u8(methods.len() as u8).await?;
    w.write_all(methods).await?;
    Ok(())
}

pub async fn write_method_selection<W: AsyncWrite + Unpin>(
    w: &mut W,
    chosen: u8,
) -> Result<(), Error> {
    w.write_all(&[SOCKS5_VERSION, chosen]).await?;
    Ok(())
}

/// Reads the method-selection reply. The caller has already consumed the
/// leading version byte.
pub async fn read_method_selection<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8, Error> {
    Ok(r.read_u8().await?)
}

/// Reads an RFC 1929 PASSWORD sub-negotiation request:
/// `{VER, ULEN, UNAME, PLEN, PASSWD}`.
pub async fn read_password<R: AsyncRead + Unpin>(r: &mut R) -> Result<(String, String), Error> {
    let ver = r.read_u8().await?;
    if ver != AUTH_VERSION {
        return Err(Error::AuthRejected);
    }
    let ulen = r.read_u8().await? as usize;
    let mut user = vec![0u8; ulen];
    r.read_exact(&mut user).await?;
    let plen = r.read_u8().await? as usize;
    let mut pass = vec![0u8; plen];
    r.read_exact(&mut pass).await?;
    let user = String::from_utf8(user)
        .map_err(|_| Error::ProtocolParseError("username is not valid utf-8".into()))?;
    let pass = String::from_utf8(pass)
        .map_err(|_| Error::ProtocolParseError("password is not valid utf-8".into()))?;
    Ok((user, pass))
}

pub async fn write_password<W: AsyncWrite + Unpin>(
    w: &mut W,
    user: &str,
    pass: &str,
) -> Result<(), Error> {
    if user.len() > 255 || pass.len() > 255 {
        return Err(Error::ProtocolParseError("username/password longer than 255 bytes".into()));
    }
    w.write_u8(AUTH_VERSION).await?;
    w.write_u8(user.len() as u8).await?;
    w.write_all(user.as_bytes()).await?;
    w.write_u8(pass.len() as u8).await?;
    w.write_all(pass.as_bytes()).await?;
    Ok(())
}

pub async fn write_password_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    success: bool,
) -> Result<(), Error> {
    let code = if success { AUTH_SUCCESS } else { AUTH_FAILURE };
    w.write_all(&[AUTH_VERSION, code]).await?;
    Ok(())
}

pub async fn read_password_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<bool, Error> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    if buf[0] != AUTH_VERSION {
        return Err(Error::ProtocolParseError("auth reply has wrong version byte".into()));
    }
    Ok(buf[1] == AUTH_SUCCESS)
}

#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: u8,
    pub addr: Address,
}

/// Reads `{VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT}`. The caller has
/// already consumed the leading version byte.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request, Error> {
    let mut head = [0u8; 2];
    r.read_exact(&mut head).await?;
    let cmd = head[0];
    let rsv = head[1];
    if rsv != 0x00 {
        return Err(Error::ProtocolParseError("reserved byte must be 0x00".into()));
    }
    let addr = read_socks5_address(r).await?;
    Ok(Request { cmd, addr })
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    cmd: u8,
    addr: &Address,
) -> Result<(), Error> {
    w.write_all(&[SOCKS5_VERSION, cmd, 0x00]).await?;
    write_socks5_address(w, addr).await
}

/// Writes `{VER, REP, RSV, ATYP, BND.ADDR, BND.PORT}`.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    rep: u8,
    addr: &Address,
) -> Result<(), Error> {
    w.write_all(&[SOCKS5_VERSION, rep, 0x00]).await?;
    write_socks5_address(w, addr).await
}

/// Reads a reply. The caller has already consumed the leading version
/// byte.
pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u8, Address), Error> {
    let mut head = [0u8; 2];
    r.read_exact(&mut head).await?;
    let rep = head[0];
    let rsv = head[1];
    if rsv != 0x00 {
        return Err(Error::ProtocolParseError("reserved byte must be 0x00".into()));
    }
    let addr = read_socks5_address(r).await?;
    Ok((rep, addr))
}

pub fn reply_len(addr: &Address) -> usize {
    3 + encoded_socks5_address_len(addr)
}

pub fn reply_message(rep: u8) -> &'static str {
    match rep {
        rep::SUCCEEDED => "succeeded",
        rep::GENERAL_FAILURE => "general SOCKS server failure",
        rep::CONN_NOT_ALLOWED => "connection not allowed by ruleset",
        rep::NETWORK_UNREACHABLE => "network unreachable",
        rep::HOST_UNREACHABLE => "host unreachable",
        rep::CONNECTION_REFUSED => "connection refused",
        rep::TTL_EXPIRED => "TTL expired",
        rep::COMMAND_NOT_SUPPORTED => "command not supported",
        rep::ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unassigned reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn round_trips_request() {
        let mut buf = Vec::new();
        write_request(&mut buf, cmd::CONNECT, &Address::IPv4(Ipv4Addr::new(8, 8, 8, 8), 53))
            .await
            .unwrap();
        let mut cur = Cursor::new(&buf[1..]);
        let req = read_request(&mut cur).await.unwrap();
        assert_eq!(req.cmd, cmd::CONNECT);
        assert_eq!(req.addr, Address::IPv4(Ipv4Addr::new(8, 8, 8, 8), 53));
    }

    #[tokio::test]
    async fn rejects_nonzero_reserved_byte() {
        let buf = [cmd::CONNECT, 0x01, super::super::atyp::IPV4, 0, 0, 0, 0, 0, 0];
        let mut cur = Cursor::new(&buf[..]);
        assert!(read_request(&mut cur).await.is_err());
    }

    #[tokio::test]
    async fn password_subnegotiation_rejects_wrong_version_byte() {
        let buf = [0x05u8, 3, b'a', b'b', b'c', 1, b'x'];
        let mut cur = Cursor::new(&buf[..]);
        assert!(matches!(read_password(&mut cur).await, Err(Error::AuthRejected)));
    }

    #[tokio::test]
    async fn round_trips_domain_request() {
        let mut buf = Vec::new();
        write_request(&mut buf, cmd::BIND, &Address::Domain("example.com".into(), 8080))
            .await
            .unwrap();
        let mut cur = Cursor::new(&buf[1..]);
        let req = read_request(&mut cur).await.unwrap();
        assert_eq!(req.addr, Address::Domain("example.com".into(), 8080));
    }
}
