use std::net::SocketAddr;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use mixport::{Config, NullStatsObserver, Server};

fn test_config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

async fn start_proxy(config: Config) -> SocketAddr {
    let server = Server::bind(config, Box::new(NullStatsObserver)).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.run());
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn read_head<R>(stream: &mut R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn http_forward_proxy() {
    let _ = env_logger::try_init();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("GET /path HTTP/1.1\r\n"), "unexpected request head: {head}");

        let lower = head.to_lowercase();
        assert!(lower.contains("host: "), "missing Host header: {head}");
        assert!(!lower.contains("proxy-connection"), "hop-by-hop header leaked: {head}");

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();
        stream.flush().await.unwrap();
    });

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    let req = format!(
        "GET http://{addr}/path HTTP/1.1\r\nHost: {addr}\r\nProxy-Connection: Keep-Alive\r\nConnection: close\r\n\r\n",
        addr = upstream_addr
    );
    c.write_all(req.as_bytes()).await.unwrap();
    c.flush().await.unwrap();

    let mut response = Vec::new();
    c.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.ends_with("hi"), "unexpected response body: {response}");

    upstream_task.await.unwrap();
}

#[tokio::test]
async fn https_connect_tunnel() {
    let _ = env_logger::try_init();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();

        // Fake TLS client hello prefix must arrive byte-exact
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01");

        stream.write_all(b"\x17\x03\x03back").await.unwrap();
        stream.flush().await.unwrap();
    });

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    let req = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n", addr = upstream_addr);
    c.write_all(req.as_bytes()).await.unwrap();
    c.flush().await.unwrap();

    let head = read_head(&mut c).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT response: {head}");
    assert!(!head.to_lowercase().contains("chunked"), "CONNECT response must not be chunked: {head}");

    c.write_all(b"\x16\x03\x01").await.unwrap();
    c.flush().await.unwrap();

    let mut reply = [0u8; 7];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"\x17\x03\x03back");

    upstream_task.await.unwrap();
}

#[tokio::test]
async fn connect_failure_returns_bad_gateway() {
    let _ = env_logger::try_init();

    // Bind then drop to find a port nothing listens on
    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let proxy_addr = start_proxy(test_config()).await;

    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    let req = format!("CONNECT 127.0.0.1:{closed_port} HTTP/1.1\r\nHost: 127.0.0.1:{closed_port}\r\n\r\n");
    c.write_all(req.as_bytes()).await.unwrap();

    let head = read_head(&mut c).await;
    assert!(head.starts_with("HTTP/1.1 502"), "unexpected response: {head}");
}

#[tokio::test]
async fn concurrency_cap_returns_503() {
    let _ = env_logger::try_init();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    // Accepts tunnels and holds them open
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match upstream.accept().await {
                Ok(s) => s,
                Err(..) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(..) => break,
                        Ok(..) => {}
                    }
                }
            });
        }
    });

    let config = Config {
        port: 0,
        max_concurrent_connections: 2,
        ..Config::default()
    };
    let proxy_addr = start_proxy(config).await;

    // Two admitted tunnels occupy both slots
    let mut held = Vec::new();
    for _ in 0..2 {
        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        let req = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n", addr = upstream_addr);
        c.write_all(req.as_bytes()).await.unwrap();

        let head = read_head(&mut c).await;
        assert!(head.starts_with("HTTP/1.1 200"), "tunnel setup failed: {head}");
        held.push(c);
    }

    // The next connection must be turned away
    let mut c = TcpStream::connect(proxy_addr).await.unwrap();
    c.write_all(b"GET http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    c.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 503"), "unexpected response: {response}");
    assert!(response.contains("Connection: close"), "missing Connection: close: {response}");
    assert!(
        response.contains("Content-Type: text/plain; charset=utf-8"),
        "missing Content-Type: {response}"
    );

    drop(held);
}
