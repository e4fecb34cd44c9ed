use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use mixport::{Config, NullStatsObserver, Server, StatsObserver};

fn test_config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

async fn start_proxy(config: Config) -> SocketAddr {
    start_proxy_with(config, Box::new(NullStatsObserver)).await
}

async fn start_proxy_with(config: Config, observer: Box<dyn StatsObserver>) -> SocketAddr {
    let server = Server::bind(config, observer).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.run());
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Runs the no-auth greeting, expecting `05 00`
async fn greet(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x05, 0x00]);
}

fn connect_request(addr: SocketAddr) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    match addr {
        SocketAddr::V4(v4) => {
            req.extend_from_slice(&v4.ip().octets());
            req.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(..) => unreachable!("tests use IPv4 targets"),
    }
    req
}

#[tokio::test]
async fn socks5_connect_relays_bidirectionally() {
    let _ = env_logger::try_init();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
    });

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    greet(&mut c).await;

    c.write_all(&connect_request(upstream_addr)).await.unwrap();

    let mut reply = [0u8; 10];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    c.write_all(b"ping").await.unwrap();
    c.flush().await.unwrap();

    let mut buf = [0u8; 4];
    c.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    upstream_task.await.unwrap();
}

#[tokio::test]
async fn socks5_bind_is_rejected() {
    let _ = env_logger::try_init();

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    greet(&mut c).await;

    // BIND 127.0.0.1:80
    c.write_all(&[0x05, 0x02, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x07, "BIND must answer command-not-supported");
}

#[tokio::test]
async fn socks5_rejects_unknown_auth_methods() {
    let _ = env_logger::try_init();

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();

    // Offer only username/password
    c.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut buf = [0u8; 2];
    c.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x05, 0xff]);

    // Connection closes after the refusal
    let mut rest = Vec::new();
    c.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn socks5_connect_failure_reports_host_unreachable() {
    let _ = env_logger::try_init();

    // Bind then drop to find a port nothing listens on
    let closed_addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    greet(&mut c).await;

    c.write_all(&connect_request(closed_addr)).await.unwrap();

    let mut reply = [0u8; 10];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x04, "failed CONNECT must answer host-unreachable");
}

#[derive(Default)]
struct Counters {
    accepted: AtomicUsize,
    disconnected: AtomicUsize,
}

struct CountingObserver(Arc<Counters>);

impl StatsObserver for CountingObserver {
    fn accepted(&mut self) {
        self.0.accepted.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&mut self) {
        self.0.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn observer_sees_one_accept_and_one_disconnect() {
    let _ = env_logger::try_init();

    let counters = Arc::new(Counters::default());
    let proxy_addr = start_proxy_with(test_config(), Box::new(CountingObserver(counters.clone()))).await;

    {
        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        greet(&mut c).await;

        // BIND runs a complete, short connection lifecycle
        c.write_all(&[0x05, 0x02, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        c.read_exact(&mut reply).await.unwrap();
    }

    // Let the handler finish and the event queue drain
    time::sleep(Duration::from_millis(300)).await;

    assert_eq!(counters.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
}
