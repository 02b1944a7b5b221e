//! SOCKS5 UDP datagram header (RFC 1928 §7): `{RSV, FRAG, ATYP, DST.ADDR,
//! DST.PORT, DATA}`. The system never fragments: any datagram with a
//! nonzero `FRAG` is rejected so the caller can drop it silently.

use bytes::{BufMut, Bytes, BytesMut};

use super::atyp;
use crate::addr::Address;
use crate::error::Error;

/// A parsed view over a received datagram: the header fields plus the
/// payload, the latter borrowed (as a `Bytes` slice) rather than copied.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub addr: Address,
    pub payload: Bytes,
}

/// Builds `{0x0000, 0x00, ATYP, DST.ADDR, DST.PORT, payload}` ready to
/// send to the SOCKS5 relay address.
pub fn build_header(payload: &[u8], addr: &Address) -> BytesMut {
    let mut buf = BytesMut::with_capacity(super::encoded_socks5_address_len(addr) + 3 + payload.len());
    buf.put_u16(0x0000);
    buf.put_u8(0x00);
    match addr {
        Address::IPv4(ip, port) => {
            buf.put_u8(atyp::IPV4);
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        Address::IPv6(ip, port) => {
            buf.put_u8(atyp::IPV6);
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        Address::Domain(host, port) => {
            buf.put_u8(atyp::DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
            buf.put_u16(*port);
        }
    }
    buf.put_slice(payload);
    buf
}

/// Parses a received datagram. Returns `Error::UdpDataUnmarshalFailure`
/// for a malformed header, nonzero `RSV`, or nonzero `FRAG` — all of
/// which the caller is expected to treat as "drop this datagram".
pub fn parse_header(raw: &[u8]) -> Result<Datagram, Error> {
    if raw.len() < 4 {
        return Err(Error::UdpDataUnmarshalFailure);
    }
    let rsv = u16::from_be_bytes([raw[0], raw[1]]);
    let frag = raw[2];
    if rsv != 0 || frag != 0 {
        return Err(Error::UdpDataUnmarshalFailure);
    }
    let aty = raw[3];
    let mut pos = 4usize;
    let addr = match aty {
        atyp::IPV4 => {
            if raw.len() < pos + 4 + 2 {
                return Err(Error::UdpDataUnmarshalFailure);
            }
            let ip = std::net::Ipv4Addr::new(raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]);
            pos += 4;
            let port = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
            pos += 2;
            Address::IPv4(ip, port)
        }
        atyp::IPV6 => {
            if raw.len() < pos + 16 + 2 {
                return Err(Error::UdpDataUnmarshalFailure);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[pos..pos + 16]);
            pos += 16;
            let port = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
            pos += 2;
            Address::IPv6(octets.into(), port)
        }
        atyp::DOMAIN => {
            if raw.len() < pos + 1 {
                return Err(Error::UdpDataUnmarshalFailure);
            }
            let len = raw[pos] as usize;
            pos += 1;
            if raw.len() < pos + len + 2 {
                return Err(Error::UdpDataUnmarshalFailure);
            }
            let host = std::str::from_utf8(&raw[pos..pos + len])
                .map_err(|_| Error::UdpDataUnmarshalFailure)?
                .to_owned();
            pos += len;
            let port = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
            pos += 2;
            Address::Domain(host, port)
        }
        _ => return Err(Error::UdpDataUnmarshalFailure),
    };
    Ok(Datagram {
        addr,
        payload: Bytes::copy_from_slice(&raw[pos..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn round_trips_payload_and_address() {
        let addr = Address::IPv4(Ipv4Addr::new(10, 0, 0, 1), 5353);
        let payload = b"hello";
        let framed = build_header(payload, &addr);
        let parsed = parse_header(&framed).unwrap();
        assert_eq!(parsed.addr, addr);
        assert_eq!(&parsed.payload[..], payload);
    }

    #[test]
    fn rejects_nonzero_frag() {
        let mut framed = build_header(b"x", &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0)).to_vec();
        framed[2] = 1;
        assert!(parse_header(&framed).is_err());
    }

    #[test]
    fn rejects_nonzero_rsv() {
        let mut framed = build_header(b"x", &Address::IPv4(Ipv4Addr::UNSPECIFIED, 0)).to_vec();
        framed[0] = 1;
        assert!(parse_header(&framed).is_err());
    }

    #[test]
    fn round_trips_domain_address() {
        let addr = Address::Domain("example.com".into(), 443);
        let framed = build_header(b"payload", &addr);
        let parsed = parse_header(&framed).unwrap();
        assert_eq!(parsed.addr, addr);
        assert_eq!(&parsed.payload[..], b"payload");
    }
}
