//! SOCKS4 / SOCKS4a CONNECT and BIND dialers.

use log::debug;

use crate::addr::{substitute_unspecified, Address};
use crate::codec::socks4::{read_reply, rep, write_request};
use crate::error::Error;
use crate::stream::DynStream;
use crate::Peer;

use super::{dial_proxy, BindCallback, Dialer};

enum Op {
    Connect,
    Bind(BindCallback),
}

/// A `(SOCKS4, CONNECT|BIND)` dialer: dial the proxy, send the request,
/// read the reply (twice, for BIND), return the live stream.
pub struct Socks4Dialer {
    proxy: String,
    user_id: Vec<u8>,
    forward: Option<Dialer>,
    op: Op,
}

impl Socks4Dialer {
    /// `new_socks4_connect(proxy, user_id, optional_upstream_dialer)`.
    pub fn connect(proxy: impl Into<String>, user_id: impl Into<Vec<u8>>, forward: Option<Dialer>) -> Self {
        Self {
            proxy: proxy.into(),
            user_id: user_id.into(),
            forward,
            op: Op::Connect,
        }
    }

    /// `new_socks4_bind(proxy, user_id, bind_cb)`.
    pub fn bind(proxy: impl Into<String>, user_id: impl Into<Vec<u8>>, bind_cb: BindCallback) -> Self {
        Self {
            proxy: proxy.into(),
            user_id: user_id.into(),
            forward: None,
            op: Op::Bind(bind_cb),
        }
    }

    pub async fn dial(&self, target: &Address) -> Result<DynStream, Error> {
        debug!("socks4 dialing {target} via proxy {}", self.proxy);
        let mut stream = dial_proxy(&self.forward, &self.proxy).await?;
        let cmd = match self.op {
            Op::Connect => crate::codec::socks4::cmd::CONNECT,
            Op::Bind(_) => crate::codec::socks4::cmd::BIND,
        };
        write_request(&mut stream, cmd, target, &self.user_id).await?;
        let (code, raddr) = read_reply(&mut stream).await?;
        debug!("socks4 reply code {code:#x}");
        if let Err(e) = check_reply(code) {
            debug!("socks4 request rejected: {e}");
            return Err(e);
        }

        if let Op::Bind(cb) = &self.op {
            let remote_ip = stream.remote_addr()?.ip();
            let listen_addr = substitute_unspecified(raddr, remote_ip);
            cb(listen_addr).await?;

            let (code2, _) = read_reply(&mut stream).await?;
            debug!("socks4 bind second reply code {code2:#x}");
            check_reply(code2)?;
        }

        Ok(stream)
    }
}

fn check_reply(code: u8) -> Result<(), Error> {
    match code {
        rep::GRANTED => Ok(()),
        rep::REJECTED_DIFFERENT_USER_ID => Err(Error::UserIdInvalid),
        other => Err(Error::Reply(other, "socks4 request rejected or failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_succeeds_on_granted_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 9]; // VER CD PORT(2) IP(4) + null
            sock.read_exact(&mut head).await.unwrap();
            sock.write_all(&[0x00, rep::GRANTED, 0, 0, 127, 0, 0, 1]).await.unwrap();
        });

        let dialer = Socks4Dialer::connect(proxy_addr.to_string(), b"abc".to_vec(), None);
        let result = dialer
            .dial(&Address::IPv4(Ipv4Addr::new(93, 184, 216, 34), 80))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn connect_fails_on_user_id_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 9];
            sock.read_exact(&mut head).await.unwrap();
            sock.write_all(&[0x00, rep::REJECTED_DIFFERENT_USER_ID, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let dialer = Socks4Dialer::connect(proxy_addr.to_string(), b"wrong".to_vec(), None);
        let result = dialer
            .dial(&Address::IPv4(Ipv4Addr::new(1, 2, 3, 4), 80))
            .await;
        assert!(matches!(result, Err(Error::UserIdInvalid)));
    }
}
