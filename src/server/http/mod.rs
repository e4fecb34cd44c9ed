//! HTTP proxy pipeline
//!
//! An accepted connection detected as HTTP gets wrapped in an idle-deadline
//! stream and served by a hyper HTTP/1.1 connection with upgrade support.
//! CONNECT requests dismantle the codec through `hyper::upgrade` and hand the
//! raw stream to the TCP relay.

pub use self::client::{HttpClient, HttpClientError};

mod client;
mod service;
mod utils;

use std::{io, net::SocketAddr, sync::Arc};

use hyper::{body, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use log::{debug, error};
use tokio::net::TcpStream;

use crate::{
    context::{ConnectionGuard, ServiceContext},
    net::IdleStream,
    stats::FailureKind,
};

use self::service::HttpService;

/// Serves one detected HTTP client connection until it closes
pub async fn serve_connection(
    context: Arc<ServiceContext>,
    http_client: HttpClient<body::Incoming>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    guard: ConnectionGuard,
) -> io::Result<()> {
    let guard = Arc::new(guard);
    let (stream, idle) = IdleStream::new(stream, context.config().idle_timeout);
    let io = TokioIo::new(stream);

    let service = service_fn({
        let context = context.clone();
        let idle = idle.clone();
        let guard = guard.clone();
        move |req| {
            HttpService::new(
                context.clone(),
                peer_addr,
                http_client.clone(),
                guard.clone(),
                idle.clone(),
            )
            .serve_connection(req)
        }
    });

    if let Err(err) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        if is_idle_timeout(&err) {
            debug!("HTTP connection {} closed by idle deadline", peer_addr);
            context
                .stats()
                .failed(FailureKind::IdleTimeout, format!("client {peer_addr} idle"));
        } else {
            error!("HTTP connection {} exited with error: {}", peer_addr, err);
        }
    }

    Ok(())
}

fn is_idle_timeout(err: &hyper::Error) -> bool {
    use std::error::Error;

    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_err.kind() == io::ErrorKind::TimedOut;
        }
        source = e.source();
    }
    false
}
