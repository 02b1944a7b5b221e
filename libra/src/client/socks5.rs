//! SOCKS5 CONNECT, BIND and UDPASSOCIATE dialers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::debug;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::addr::{substitute_unspecified, Address};
use crate::codec::socks5::{
    method, read_method_selection, read_password_status, read_reply, rep, reply_message,
    write_greeting, write_password, write_request,
};
use crate::codec::udp;
use crate::error::Error;
use crate::stream::DynStream;
use crate::Peer;

use super::{dial_proxy, BindCallback, Dialer, PacketListener};

/// A handler for a client-side GSSAPI/IANA/PRIVATE sub-negotiation: takes
/// ownership of the stream, runs its own read/write exchange, and hands
/// the stream back with a success flag.
pub type ClientAuthHandler =
    Arc<dyn Fn(DynStream) -> BoxFuture<'static, (DynStream, bool)> + Send + Sync>;

/// The set of authentication methods this client is willing to offer,
/// mirroring `go-socks/client.Socks5Auth`.
#[derive(Clone, Default)]
pub struct Socks5Auth {
    pub no_auth: bool,
    pub gssapi: Option<ClientAuthHandler>,
    pub password: Option<(String, String)>,
    pub iana: HashMap<u8, ClientAuthHandler>,
    pub private: HashMap<u8, ClientAuthHandler>,
}

impl Socks5Auth {
    pub fn no_auth() -> Self {
        Self {
            no_auth: true,
            ..Default::default()
        }
    }

    pub fn password(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            password: Some((user.into(), pass.into())),
            ..Default::default()
        }
    }

    fn offered_methods(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.no_auth {
            out.push(method::NOAUTH);
        }
        if self.gssapi.is_some() {
            out.push(method::GSSAPI);
        }
        if self.password.is_some() {
            out.push(method::PASSWORD);
        }
        out.extend(self.iana.keys().copied());
        out.extend(self.private.keys().copied());
        out
    }

    fn handler_for(&self, code: u8) -> Option<&ClientAuthHandler> {
        match code {
            method::GSSAPI => self.gssapi.as_ref(),
            c if (method::IANA_MIN..=method::IANA_MAX).contains(&c) => self.iana.get(&c),
            c if (method::PRIVATE_MIN..=method::PRIVATE_MAX).contains(&c) => self.private.get(&c),
            _ => None,
        }
    }
}

/// Runs the full client-side method negotiation: greeting, method
/// selection, and the chosen method's sub-protocol. Takes the stream by
/// value and hands it back so owning handlers (GSSAPI/IANA/PRIVATE) can
/// run their own exchange without needing a placeholder to swap out of
/// a `&mut DynStream`.
async fn negotiate(mut stream: DynStream, auth: &Socks5Auth) -> Result<DynStream, Error> {
    let offered = auth.offered_methods();
    if offered.is_empty() {
        return Err(Error::NeedsAuth);
    }
    write_greeting(&mut stream, &offered).await?;
    let ver = stream.read_u8().await?;
    if ver != crate::codec::SOCKS5_VERSION {
        return Err(Error::ProtocolParseError("server replied with wrong socks version".into()));
    }
    let chosen = read_method_selection(&mut stream).await?;
    debug!("socks5 server chose auth method {chosen:#x}");

    match chosen {
        method::NOAUTH if auth.no_auth => Ok(stream),
        method::PASSWORD if auth.password.is_some() => {
            let (user, pass) = auth.password.as_ref().unwrap();
            write_password(&mut stream, user, pass).await?;
            if read_password_status(&mut stream).await? {
                Ok(stream)
            } else {
                debug!("socks5 password authentication rejected");
                Err(Error::AuthRejected)
            }
        }
        method::REJECTED => {
            debug!("socks5 server accepted no offered auth method");
            Err(Error::NoAcceptableMethods)
        }
        code => {
            let handler = auth
                .handler_for(code)
                .cloned()
                .ok_or_else(|| Error::ProtocolParseError(format!("unexpected method chosen: {code:#x}")))?;
            let (stream, ok) = handler(stream).await;
            if ok {
                Ok(stream)
            } else {
                debug!("socks5 auth method {code:#x} rejected the connection");
                Err(Error::AuthRejected)
            }
        }
    }
}

fn check_reply(code: u8) -> Result<(), Error> {
    if code == rep::SUCCEEDED {
        Ok(())
    } else {
        Err(Error::Reply(code, reply_message(code)))
    }
}

enum Op {
    Connect,
    Bind(BindCallback),
}

/// A `(SOCKS5, CONNECT|BIND)` dialer.
pub struct Socks5Dialer {
    proxy: String,
    auth: Socks5Auth,
    forward: Option<Dialer>,
    op: Op,
}

impl Socks5Dialer {
    /// `new_socks5_connect(proxy, auth, optional_upstream)`.
    pub fn connect(proxy: impl Into<String>, auth: Socks5Auth, forward: Option<Dialer>) -> Self {
        Self {
            proxy: proxy.into(),
            auth,
            forward,
            op: Op::Connect,
        }
    }

    /// `new_socks5_bind(proxy, auth, bind_cb)`.
    pub fn bind(proxy: impl Into<String>, auth: Socks5Auth, bind_cb: BindCallback) -> Self {
        Self {
            proxy: proxy.into(),
            auth,
            forward: None,
            op: Op::Bind(bind_cb),
        }
    }

    pub async fn dial(&self, target: &Address) -> Result<DynStream, Error> {
        debug!("socks5 dialing {target} via proxy {}", self.proxy);
        let stream = dial_proxy(&self.forward, &self.proxy).await?;
        let mut stream = negotiate(stream, &self.auth).await?;

        let cmd = match self.op {
            Op::Connect => crate::codec::socks5::cmd::CONNECT,
            Op::Bind(_) => crate::codec::socks5::cmd::BIND,
        };
        write_request(&mut stream, cmd, target).await?;
        let (code, raddr) = read_reply(&mut stream).await?;
        debug!("socks5 reply code {code:#x}");
        if let Err(e) = check_reply(code) {
            debug!("socks5 request rejected: {e}");
            return Err(e);
        }

        if let Op::Bind(cb) = &self.op {
            let remote_ip = stream.remote_addr()?.ip();
            let listen_addr = substitute_unspecified(raddr, remote_ip);
            cb(listen_addr).await?;

            let (code2, _) = read_reply(&mut stream).await?;
            check_reply(code2)?;
        }

        Ok(stream)
    }
}

/// A `(SOCKS5, UDPASSOCIATE)` dialer, returning a [`PacketHandle`].
pub struct Socks5UdpDialer {
    proxy: String,
    auth: Socks5Auth,
    forward: Option<Dialer>,
    packet_listener: Option<PacketListener>,
}

impl Socks5UdpDialer {
    /// `new_socks5_udp_associate(proxy, auth, optional_upstream,
    /// optional_packet_listener)`.
    pub fn new(
        proxy: impl Into<String>,
        auth: Socks5Auth,
        forward: Option<Dialer>,
        packet_listener: Option<PacketListener>,
    ) -> Self {
        Self {
            proxy: proxy.into(),
            auth,
            forward,
            packet_listener,
        }
    }

    pub async fn dial(&self, local_bind: SocketAddr) -> Result<PacketHandle, Error> {
        debug!("socks5 udp associate via proxy {} (local bind {local_bind})", self.proxy);
        let control = dial_proxy(&self.forward, &self.proxy).await?;
        let mut control = negotiate(control, &self.auth).await?;

        // Bind the real UDP socket before sending the request: the
        // request must advertise the socket's actual bound address, not
        // the caller's pre-bind address (which may ask for an
        // OS-assigned ephemeral port via `:0`).
        let socket = match &self.packet_listener {
            Some(listener) => listener(local_bind).await?,
            None => UdpSocket::bind(local_bind).await?,
        };
        let bound_addr = socket.local_addr()?;

        write_request(&mut control, crate::codec::socks5::cmd::UDP_ASSOCIATE, &bound_addr.into())
            .await?;
        let (code, raddr) = read_reply(&mut control).await?;
        check_reply(code)?;

        let remote_ip = control.remote_addr()?.ip();
        let server_addr = substitute_unspecified(raddr, remote_ip)
            .to_socket_addr()
            .ok_or_else(|| Error::AddressInvalid("server relay address must be a socket address".into()))?;

        let cancel = CancellationToken::new();
        let watcher_cancel = cancel.clone();
        let control_task = tokio::spawn(watch_control(control, watcher_cancel));

        Ok(PacketHandle {
            socket: Arc::new(socket),
            server_addr,
            cancel,
            control_task: Some(control_task),
        })
    }
}

async fn watch_control(mut control: DynStream, cancel: CancellationToken) {
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = control.read(&mut buf) => {
                match res {
                    Ok(0) | Err(_) => {
                        cancel.cancel();
                        return;
                    }
                    Ok(_) => continue,
                }
            }
        }
    }
}

/// A live SOCKS5 UDP association: send/receive user datagrams without
/// dealing with the wire header, while the control TCP connection is
/// kept alive in the background. Dropping or [`close`](Self::close)ing
/// this tears down both the UDP socket and the control connection.
pub struct PacketHandle {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    cancel: CancellationToken,
    control_task: Option<tokio::task::JoinHandle<()>>,
}

impl PacketHandle {
    pub async fn send_to(&self, payload: &[u8], target: &Address) -> Result<usize, Error> {
        let framed = udp::build_header(payload, target);
        Ok(self.socket.send_to(&framed, self.server_addr).await?)
    }

    /// Receives one datagram, dropping anything not sourced from the
    /// server's relay address and discarding the socks5 header.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, Address), Error> {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let (n, src) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "control connection closed",
                    )));
                }
                res = self.socket.recv_from(&mut buf) => res?,
            };
            if src != self.server_addr {
                continue;
            }
            let dgram = udp::parse_header(&buf[..n])?;
            return Ok((dgram.payload.to_vec(), dgram.addr));
        }
    }

    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.control_task.take() {
            task.abort();
        }
    }
}

impl Drop for PacketHandle {
    fn drop(&mut self) {
        self.close();
    }
}
