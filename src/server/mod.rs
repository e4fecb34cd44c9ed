//! Single-port dual-protocol server
//!
//! One TCP listener serves both protocols. The first byte of a fresh
//! connection picks the pipeline: `0x05` is the SOCKS5 version byte, anything
//! else is treated as HTTP. The byte is only peeked, so the installed
//! pipeline sees the complete original stream.

pub mod http;
pub mod socks;

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use hyper::body;
use log::{debug, error, info, trace, warn};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time,
};

use crate::{
    config::Config,
    context::ServiceContext,
    relay::socks5,
    stats::{StatsHandle, StatsObserver},
};

use self::{http::HttpClient, socks::Socks5TcpHandler};

/// Fixed response for HTTP-mode connections turned away by the gate
const REJECT_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 17\r\n\
Connection: close\r\n\
\r\n\
proxy overloaded\n";

/// Proxy server instance
pub struct Server {
    context: Arc<ServiceContext>,
    listener: TcpListener,
    http_client: HttpClient<body::Incoming>,
}

impl Server {
    /// Binds the listening socket and spawns the stats dispatch task
    pub async fn bind(config: Config, observer: Box<dyn StatsObserver>) -> io::Result<Server> {
        let stats = StatsHandle::new(observer, config.max_recent_errors);
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let listener = TcpListener::bind(bind_addr).await?;
        let context = Arc::new(ServiceContext::new(config, stats));

        Ok(Server {
            context,
            listener,
            http_client: HttpClient::new(),
        })
    }

    /// Get the server's bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stats handle of this instance, exposing the recent-error ring
    pub fn stats(&self) -> StatsHandle {
        self.context.stats().clone()
    }

    /// Start the TCP accept loop
    ///
    /// Runs until the returned future is dropped by the host.
    pub async fn run(self) -> io::Result<()> {
        info!("proxy listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let context = self.context.clone();
            let http_client = self.http_client.clone();

            tokio::spawn(async move {
                if let Err(err) = handle_connection(context, http_client, stream, peer_addr).await {
                    debug!("connection {} handler finished with error: {}", peer_addr, err);
                }
            });
        }
    }
}

/// Detects the protocol from the first byte and installs the matching pipeline
async fn handle_connection(
    context: Arc<ServiceContext>,
    http_client: HttpClient<body::Incoming>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> io::Result<()> {
    let mut version_buffer = [0u8; 1];
    let n = stream.peek(&mut version_buffer).await?;
    if n == 0 {
        trace!("connection {} closed before the first byte", peer_addr);
        return Ok(());
    }

    match version_buffer[0] {
        socks5::SOCKS5_VERSION => {
            trace!("detected socks5 client {}", peer_addr);

            let Some(guard) = context.try_acquire() else {
                warn!("connection limit reached, closing socks5 client {}", peer_addr);
                return Ok(());
            };

            let handler = Socks5TcpHandler::new(context);
            handler.handle_socks5_client(stream, peer_addr, guard).await
        }
        b => {
            trace!("detected http client {} (first byte {:#04x})", peer_addr, b);

            let Some(guard) = context.try_acquire() else {
                warn!("connection limit reached, rejecting http client {}", peer_addr);
                stream.write_all(REJECT_RESPONSE).await?;
                stream.shutdown().await?;
                return Ok(());
            };

            http::serve_connection(context, http_client, stream, peer_addr, guard).await
        }
    }
}
