//! End-to-end tests: a real `Server` listening on a loopback port,
//! driven by the client dialers over an actual TCP connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use libra::auth::S5AuthTable;
use libra::client::socks4::Socks4Dialer;
use libra::client::socks5::{Socks5Auth, Socks5Dialer, Socks5UdpDialer};
use libra::server::{Server, ServerConfig};
use libra::Address;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                tokio::io::copy(&mut reader, &mut writer).await.ok();
            });
        }
    });
    addr
}

async fn spawn_proxy(config: ServerConfig) -> SocketAddr {
    let server = Arc::new(Server::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let s = server.clone();
    tokio::spawn(async move {
        s.serve(listener).await.ok();
    });
    addr
}

#[tokio::test]
async fn socks5_connect_echoes_through_the_proxy() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::no_auth(),
        ..Default::default()
    })
    .await;

    let dialer = Socks5Dialer::connect(proxy_addr.to_string(), Socks5Auth::no_auth(), None);
    let mut stream = dialer.dial(&Address::from(echo_addr)).await.unwrap();

    stream.write_all(b"hello world\r\n").await.unwrap();
    let mut buf = [0u8; 13];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello world\r\n");
}

#[tokio::test]
async fn socks4_connect_validates_user_id() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::no_auth(),
        s4_user_id_auth: Some(Arc::new(|user_id| {
            Box::pin(async move {
                if user_id == b"alice" {
                    libra::codec::socks4::UserIdAuthCode::Granted
                } else {
                    libra::codec::socks4::UserIdAuthCode::RejectedDifferentUserId
                }
            })
        })),
        ..Default::default()
    })
    .await;

    let ok_dialer = Socks4Dialer::connect(proxy_addr.to_string(), b"alice".to_vec(), None);
    let target = Address::IPv4(Ipv4Addr::LOCALHOST, echo_addr.port());
    let mut stream = ok_dialer.dial(&target).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let bad_dialer = Socks4Dialer::connect(proxy_addr.to_string(), b"mallory".to_vec(), None);
    let result = bad_dialer.dial(&target).await;
    assert!(matches!(result, Err(libra::Error::UserIdInvalid)));
}

#[tokio::test]
async fn socks5_password_auth_accepts_and_rejects() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::password("user", "secret"),
        ..Default::default()
    })
    .await;
    let target = Address::IPv4(Ipv4Addr::LOCALHOST, echo_addr.port());

    let good = Socks5Dialer::connect(
        proxy_addr.to_string(),
        Socks5Auth::password("user", "secret"),
        None,
    );
    let mut stream = good.dial(&target).await.unwrap();
    stream.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    let bad = Socks5Dialer::connect(
        proxy_addr.to_string(),
        Socks5Auth::password("user", "wrong"),
        None,
    );
    let result = bad.dial(&target).await;
    assert!(matches!(result, Err(libra::Error::AuthRejected)));
}

#[tokio::test]
async fn socks5_bind_accepts_a_loopback_connection() {
    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::no_auth(),
        ..Default::default()
    })
    .await;

    let bind_cb = Arc::new(move |listen_addr: Address| {
        Box::pin(async move {
            let conn_str = listen_addr.to_connect_string();
            tokio::spawn(async move {
                let mut sock = TcpStream::connect(conn_str).await.unwrap();
                sock.write_all(b"third party").await.unwrap();
            });
            Ok(())
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send>>
    });

    // The BIND request address carries the expected peer's known IP (as a
    // real client would, e.g. an FTP control connection advertising the
    // host it will connect back from); port 0 accepts any port from it.
    let dialer = Socks5Dialer::bind(proxy_addr.to_string(), Socks5Auth::no_auth(), bind_cb);
    let mut stream = dialer
        .dial(&Address::IPv4(Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();

    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"third party");
}

#[tokio::test]
async fn socks5_bind_times_out_with_a_single_reply() {
    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::no_auth(),
        bind_timeout: Duration::from_millis(100),
        ..Default::default()
    })
    .await;

    // Nobody ever connects to the bound listener: the dialer should see
    // exactly one reply sequence (the failure reply substituting for the
    // second reply), not a hang or a protocol desync.
    let noop_cb = Arc::new(|_addr: Address| {
        Box::pin(async { Ok(()) }) as std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send>>
    });
    let dialer = Socks5Dialer::bind(proxy_addr.to_string(), Socks5Auth::no_auth(), noop_cb);
    let result = dialer
        .dial(&Address::IPv4(Ipv4Addr::UNSPECIFIED, 0))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn socks5_udp_associate_relays_datagrams_and_closes_with_control() {
    let target_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target_sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let (n, src) = match target_sock.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            target_sock.send_to(&buf[..n], src).await.ok();
        }
    });

    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::no_auth(),
        ..Default::default()
    })
    .await;

    let udp_dialer = Socks5UdpDialer::new(proxy_addr.to_string(), Socks5Auth::no_auth(), None, None);
    let handle = udp_dialer
        .dial("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let target = Address::from(target_addr);
    handle.send_to(b"ping", &target).await.unwrap();
    let (payload, from) = tokio::time::timeout(Duration::from_secs(5), handle.recv_from())
        .await
        .expect("udp relay reply")
        .unwrap();
    assert_eq!(payload, b"ping".to_vec());
    assert_eq!(from, target);

    // Invariant I2: closing the control channel tears down the UDP side.
    let mut handle = handle;
    handle.close();
    let result = tokio::time::timeout(Duration::from_secs(1), handle.recv_from()).await;
    assert!(matches!(result, Ok(Err(libra::Error::Io(_)))));
}

#[tokio::test]
async fn socks5_no_auth_handler_reject_yields_rejected_method_reply() {
    use libra::auth::S5AuthTable;
    use tokio::io::AsyncReadExt;

    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::new().with_no_auth_handler(
            0,
            Arc::new(|s| Box::pin(async move { (s, false) })),
        ),
        ..Default::default()
    })
    .await;

    let mut sock = TcpStream::connect(proxy_addr).await.unwrap();
    sock.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    sock.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);
}

#[tokio::test]
async fn socks4_request_with_unknown_cd_is_rejected() {
    use tokio::io::AsyncReadExt;

    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::no_auth(),
        ..Default::default()
    })
    .await;

    let mut sock = TcpStream::connect(proxy_addr).await.unwrap();
    // VER=4, CD=0x07 (neither CONNECT nor BIND), PORT, IP, null-terminated user_id.
    sock.write_all(&[0x04, 0x07, 0, 80, 127, 0, 0, 1, 0]).await.unwrap();
    let mut reply = [0u8; 8];
    sock.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5B);
}

#[tokio::test]
async fn socks5_rejects_when_no_offered_method_is_acceptable() {
    let proxy_addr = spawn_proxy(ServerConfig {
        s5_auth: S5AuthTable::password("user", "secret"),
        ..Default::default()
    })
    .await;

    // The client only offers NOAUTH; the server only accepts PASSWORD.
    let dialer = Socks5Dialer::connect(proxy_addr.to_string(), Socks5Auth::no_auth(), None);
    let result = dialer.dial(&Address::IPv4(Ipv4Addr::LOCALHOST, 1)).await;
    assert!(matches!(result, Err(libra::Error::NoAcceptableMethods)));
}
