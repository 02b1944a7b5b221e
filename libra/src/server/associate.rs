//! The UDPASSOCIATE handler: a UDP relay endpoint coupled to the
//! control TCP stream's lifetime, with a per-destination NAT sub-socket
//! map (spec.md §4.6, `original_source/share/connMap.go`).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ServerConfig;
use crate::addr::{substitute_unspecified, Address};
use crate::codec::socks5;
use crate::codec::udp;
use crate::error::Error;
use crate::stream::Stream;
use crate::Peer;

const RECV_BUF_SIZE: usize = 32 * 1024;

/// Who the main relay socket accepts client datagrams from: either an
/// exact address, or any source sharing the control connection's peer
/// IP (when the client's request address was unspecified).
enum Permitted {
    Exact(SocketAddr),
    SameIp(IpAddr),
}

impl Permitted {
    fn matches(&self, src: SocketAddr) -> bool {
        match self {
            Permitted::Exact(want) => *want == src,
            Permitted::SameIp(ip) => src.ip() == *ip,
        }
    }
}

struct SubSocket {
    socket: Arc<UdpSocket>,
    expiry: Arc<Mutex<Instant>>,
}

pub(crate) async fn run<S>(
    mut control: S,
    req_addr: Address,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    S: Stream + 'static,
{
    let control_peer = control.remote_addr()?;
    let permitted = match req_addr.to_socket_addr() {
        Some(addr) if !addr.ip().is_unspecified() => Permitted::Exact(addr),
        _ => Permitted::SameIp(control_peer.ip()),
    };
    let client_reply_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(match &permitted {
        Permitted::Exact(addr) => Some(*addr),
        Permitted::SameIp(_) => None,
    }));

    let socket = config.listen_udp().await.map_err(Error::Io)?;
    let local = socket.local_addr()?;
    let control_local = control.local_addr()?;
    let bnd = substitute_unspecified(Address::from(local), control_local.ip());
    socks5::write_reply(&mut control, socks5::rep::SUCCEEDED, &bnd).await?;

    let socket = Arc::new(socket);
    let subsockets: Arc<Mutex<HashMap<SocketAddr, SubSocket>>> = Arc::new(Mutex::new(HashMap::new()));

    let relay_task = tokio::spawn(client_to_target(
        socket.clone(),
        subsockets,
        permitted,
        client_reply_addr,
        config.udp_timeout,
        cancel.clone(),
    ));

    // Control stream is a liveness channel only: bytes are discarded,
    // EOF or error tears the whole association down (invariant I2).
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = control.read(&mut buf) => {
                match res {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }
    cancel.cancel();
    relay_task.abort();
    Ok(())
}

async fn client_to_target(
    socket: Arc<UdpSocket>,
    subsockets: Arc<Mutex<HashMap<SocketAddr, SubSocket>>>,
    permitted: Permitted,
    client_reply_addr: Arc<Mutex<Option<SocketAddr>>>,
    udp_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (n, src) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!("udp associate recv failed: {e}");
                    continue;
                }
            },
        };
        if !permitted.matches(src) {
            trace!("dropping udp datagram from unpermitted source {src}");
            continue;
        }
        *client_reply_addr.lock().await = Some(src);

        let dgram = match udp::parse_header(&buf[..n]) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let Some(dest) = dgram.addr.to_socket_addr() else {
            trace!("dropping udp datagram to unresolved domain {}", dgram.addr);
            continue;
        };

        let sub = get_or_open_subsocket(
            dest,
            &subsockets,
            &socket,
            &client_reply_addr,
            udp_timeout,
            cancel.clone(),
        )
        .await;
        let sub = match sub {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to open udp sub-socket to {dest}: {e}");
                continue;
            }
        };
        if let Err(e) = sub.socket.send_to(&dgram.payload, dest).await {
            warn!("udp associate forward to {dest} failed: {e}");
            continue;
        }
        *sub.expiry.lock().await = Instant::now() + udp_timeout;
    }
}

async fn get_or_open_subsocket(
    dest: SocketAddr,
    subsockets: &Arc<Mutex<HashMap<SocketAddr, SubSocket>>>,
    main_socket: &Arc<UdpSocket>,
    client_reply_addr: &Arc<Mutex<Option<SocketAddr>>>,
    udp_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<Arc<UdpSocket>> {
    let mut map = subsockets.lock().await;
    if let Some(sub) = map.get(&dest) {
        return Ok(sub.socket.clone());
    }

    let bind_addr: SocketAddr = match dest {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    let expiry = Arc::new(Mutex::new(Instant::now() + udp_timeout));

    tokio::spawn(target_to_client(
        socket.clone(),
        dest,
        main_socket.clone(),
        client_reply_addr.clone(),
        expiry.clone(),
        subsockets.clone(),
        udp_timeout,
        cancel,
    ));

    map.insert(dest, SubSocket { socket: socket.clone(), expiry });
    Ok(socket)
}

/// Reads from one destination's sub-socket and relays back to the
/// client (wrapped with a SOCKS5 UDP header), until its idle deadline
/// expires or the association is cancelled.
#[allow(clippy::too_many_arguments)]
async fn target_to_client(
    sub_socket: Arc<UdpSocket>,
    dest: SocketAddr,
    main_socket: Arc<UdpSocket>,
    client_reply_addr: Arc<Mutex<Option<SocketAddr>>>,
    expiry: Arc<Mutex<Instant>>,
    subsockets: Arc<Mutex<HashMap<SocketAddr, SubSocket>>>,
    udp_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let deadline = *expiry.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            res = sub_socket.recv_from(&mut buf) => {
                let (n, _from) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("udp sub-socket for {dest} read failed: {e}");
                        break;
                    }
                };
                *expiry.lock().await = Instant::now() + udp_timeout;
                let Some(client) = *client_reply_addr.lock().await else { continue };
                let framed = udp::build_header(&buf[..n], &Address::from(dest));
                if let Err(e) = main_socket.send_to(&framed, client).await {
                    warn!("udp associate reply to {client} failed: {e}");
                }
            }
        }
    }
    subsockets.lock().await.remove(&dest);
}
