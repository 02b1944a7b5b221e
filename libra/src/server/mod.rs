//! The SOCKS server: accepts TCP connections, negotiates version and
//! authentication, and dispatches CONNECT, BIND and (SOCKS5-only)
//! UDPASSOCIATE to the handlers in [`connect`], [`bind`] and
//! [`associate`].

mod associate;
mod bind;
mod connect;
mod session;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, warn};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::auth::{S5AuthTable, UserIdValidator};
use crate::stream::{box_stream, DynStream};

/// Which SOCKS protocol versions this server accepts. At least one must
/// be set.
#[derive(Debug, Clone, Copy)]
pub struct VersionSwitch {
    pub socks4: bool,
    pub socks5: bool,
}

impl Default for VersionSwitch {
    fn default() -> Self {
        Self {
            socks4: true,
            socks5: true,
        }
    }
}

/// Which commands this server dispatches. At least one must be set.
#[derive(Debug, Clone, Copy)]
pub struct CmdSwitch {
    pub connect: bool,
    pub bind: bool,
    pub udp_associate: bool,
}

impl Default for CmdSwitch {
    fn default() -> Self {
        Self {
            connect: true,
            bind: true,
            udp_associate: true,
        }
    }
}

/// Overrides the OS facility a command handler uses, e.g. to dial
/// through a relay upstream instead of a raw `TcpStream::connect`.
pub type DialHandler = Arc<dyn Fn(Address) -> BoxFuture<'static, io::Result<DynStream>> + Send + Sync>;
pub type ListenHandler = Arc<dyn Fn() -> BoxFuture<'static, io::Result<TcpListener>> + Send + Sync>;
pub type ListenPacketHandler = Arc<dyn Fn() -> BoxFuture<'static, io::Result<UdpSocket>> + Send + Sync>;

/// Server-wide configuration: which versions/commands are enabled, the
/// SOCKS5 auth table, the SOCKS4 user-id validator, command-handler
/// overrides, and the four timeouts from spec.md §4.5.
pub struct ServerConfig {
    pub version_switch: VersionSwitch,
    pub cmd_switch: CmdSwitch,
    pub s5_auth: S5AuthTable,
    pub s4_user_id_auth: Option<UserIdValidator>,
    pub connect_handler: Option<DialHandler>,
    pub bind_handler: Option<ListenHandler>,
    pub udp_associate_handler: Option<ListenPacketHandler>,
    /// Caps the entire handshake (greeting through final reply). Zero
    /// means no timeout.
    pub conn_timeout: Duration,
    /// Caps a CONNECT handler's outbound dial.
    pub dial_timeout: Duration,
    /// Caps the wait for the awaited peer in BIND. Default 5s.
    pub bind_timeout: Duration,
    /// Idle deadline on a per-destination UDPASSOCIATE sub-socket.
    /// Default 30s.
    pub udp_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version_switch: VersionSwitch::default(),
            cmd_switch: CmdSwitch::default(),
            s5_auth: S5AuthTable::default(),
            s4_user_id_auth: None,
            connect_handler: None,
            bind_handler: None,
            udp_associate_handler: None,
            conn_timeout: Duration::ZERO,
            dial_timeout: Duration::ZERO,
            bind_timeout: Duration::from_secs(5),
            udp_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub(crate) async fn dial(&self, target: Address) -> io::Result<DynStream> {
        match &self.connect_handler {
            Some(h) => h(target).await,
            None => {
                let s = TcpStream::connect(target.to_connect_string()).await?;
                Ok(box_stream(s))
            }
        }
    }

    pub(crate) async fn listen_tcp(&self) -> io::Result<TcpListener> {
        match &self.bind_handler {
            Some(h) => h().await,
            None => TcpListener::bind("0.0.0.0:0").await,
        }
    }

    pub(crate) async fn listen_udp(&self) -> io::Result<UdpSocket> {
        match &self.udp_associate_handler {
            Some(h) => h().await,
            None => UdpSocket::bind("0.0.0.0:0").await,
        }
    }
}

/// A running (or not-yet-started) SOCKS server.
pub struct Server {
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
}

impl Server {
    /// Validates `config` (at least one version, one command, and — if
    /// SOCKS5 is enabled — at least one auth method) and constructs a
    /// server ready to serve.
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        if !config.version_switch.socks4 && !config.version_switch.socks5 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no socks version enabled"));
        }
        if !config.cmd_switch.connect && !config.cmd_switch.bind && !config.cmd_switch.udp_associate {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no command enabled"));
        }
        if config.version_switch.socks5 && config.s5_auth.is_empty() {
            return Err(crate::auth::empty_table_error());
        }
        Ok(Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        })
    }

    /// Binds `addr` and serves until [`close`](Self::close) is called.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop against an already-bound listener, spawning
    /// one session task per accepted connection, until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        debug!("socks server listening on {:?}", listener.local_addr());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("socks server accept loop cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let config = self.config.clone();
                    let session_cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = session::run(stream, peer, config, session_cancel).await {
                            error!("session with {peer} ended: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Cancels the accept loop and every in-flight session.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
