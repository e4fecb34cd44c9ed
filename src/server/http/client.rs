//! HTTP/1.1 upstream client
//!
//! Forward-mode requests go out over plain HTTP/1.1 connections. Connections
//! whose response allows it are parked in a per-target pool and picked up by
//! the next request for the same target, so a browser hammering one site
//! rides a single upstream socket.

use std::{
    collections::VecDeque,
    fmt::Debug,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use http::{HeaderValue, Method, Version, header::InvalidHeaderValue};
use hyper::{
    Request, Response,
    body::{self, Body},
    client::conn::{TrySendError, http1},
};
use hyper_util::rt::TokioIo;
use log::{debug, trace};
use lru_time_cache::LruCache;
use tokio::sync::Mutex;

use crate::{
    context::ServiceContext,
    relay::{socks5::Address, tcp::connect_target},
};

use super::utils::{absolute_uri_target, origin_form, wants_keep_alive};

/// Parked connections older than this are discarded instead of reused
const POOL_IDLE_LIMIT: Duration = Duration::from_secs(20);

/// HTTP client request errors
#[derive(thiserror::Error, Debug)]
pub enum HttpClientError {
    /// Errors from hyper
    #[error("{0}")]
    Hyper(#[from] hyper::Error),
    /// std::io::Error
    #[error("{0}")]
    Io(#[from] io::Error),
    /// Errors from http
    #[error("{0}")]
    Http(#[from] http::Error),
    /// Errors from http header
    #[error("{0}")]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
}

#[allow(clippy::large_enum_variant)]
#[derive(thiserror::Error, Debug)]
enum DispatchError<B> {
    #[error("{0}")]
    Http(#[from] http::Error),

    #[error("{0}")]
    TrySend(#[from] TrySendError<Request<B>>),
}

type ConnectionPool<B> = LruCache<Address, VecDeque<(http1::SendRequest<B>, Instant)>>;

/// HTTP/1.1 client with a keep-alive connection pool
pub struct HttpClient<B> {
    pool: Arc<Mutex<ConnectionPool<B>>>,
}

impl<B> Clone for HttpClient<B> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone() }
    }
}

impl<B> Default for HttpClient<B>
where
    B: Body + Send + Unpin + Debug + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<B> HttpClient<B>
where
    B: Body + Send + Unpin + Debug + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Create a new `HttpClient`
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Mutex::new(LruCache::with_expiry_duration(POOL_IDLE_LIMIT))),
        }
    }

    /// Sends `req` to the host its URI points at
    pub async fn send_request(
        &self,
        context: Arc<ServiceContext>,
        req: Request<B>,
    ) -> Result<Response<body::Incoming>, HttpClientError> {
        let host = match absolute_uri_target(req.uri()) {
            Some(h) => h,
            None => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "request URI has no target host").into());
            }
        };

        let mut req = ensure_host_header(req)?;

        // A parked connection is tried first. hyper hands the request back
        // when the socket died while parked, so a stale hit falls through to
        // a fresh dial instead of failing the request.
        if let Some(conn) = self.take_pooled(&host).await {
            match self.dispatch(host.clone(), conn, req).await {
                Ok(response) => return Ok(response),
                Err(DispatchError::TrySend(mut stale)) => match stale.take_message() {
                    Some(recovered) => {
                        debug!(
                            "pooled upstream connection for {} went stale ({}), dialing a new one",
                            host,
                            stale.error()
                        );
                        req = recovered;
                    }
                    None => return Err(stale.into_error().into()),
                },
                Err(DispatchError::Http(err)) => return Err(err.into()),
            }
        }

        let conn = self.dial(&context, &host).await?;
        match self.dispatch(host, conn, req).await {
            Ok(response) => Ok(response),
            Err(DispatchError::TrySend(err)) => Err(err.into_error().into()),
            Err(DispatchError::Http(err)) => Err(err.into()),
        }
    }

    async fn dial(&self, context: &ServiceContext, host: &Address) -> io::Result<http1::SendRequest<B>> {
        trace!("dialing upstream {}", host);

        let stream = connect_target(host, context.config().connect_timeout).await?;

        let (conn, driver) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(io::Error::other)?;

        // hyper's connection future does the actual socket I/O
        let driver_host = host.clone();
        tokio::spawn(async move {
            if let Err(err) = driver.await {
                debug!("upstream connection to {} shut down with error: {}", driver_host, err);
            }
        });

        Ok(conn)
    }

    async fn take_pooled(&self, host: &Address) -> Option<http1::SendRequest<B>> {
        let mut pool = self.pool.lock().await;
        let queue = pool.get_mut(host)?;

        while let Some((conn, parked_at)) = queue.pop_front() {
            if parked_at.elapsed() < POOL_IDLE_LIMIT && !conn.is_closed() && conn.is_ready() {
                trace!("reusing pooled upstream connection for {}", host);
                return Some(conn);
            }
        }
        None
    }

    async fn dispatch(
        &self,
        host: Address,
        mut conn: http1::SendRequest<B>,
        mut req: Request<B>,
    ) -> Result<Response<body::Incoming>, DispatchError<B>> {
        // The upstream side only speaks HTTP/1.1
        if !matches!(req.version(), Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11) {
            *req.version_mut() = Version::HTTP_11;
        }

        // Upstream requests go out in origin form
        if req.method() != Method::CONNECT && (req.uri().scheme().is_some() || req.uri().authority().is_some()) {
            let origin = origin_form(req.uri());
            *req.uri_mut() = origin;
        }

        trace!("upstream request for {}: {:?}", host, req);
        let response = conn.try_send_request(req).await?;
        trace!("upstream response from {}: {:?}", host, response);

        if wants_keep_alive(response.version(), response.headers(), false) {
            self.park(host, conn);
        }

        Ok(response)
    }

    fn park(&self, host: Address, mut conn: http1::SendRequest<B>) {
        // A connection is only reusable once the response body has fully
        // drained, so readiness is awaited off to the side.
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if conn.ready().await.is_err() {
                return;
            }
            pool.lock()
                .await
                .entry(host)
                .or_insert_with(VecDeque::new)
                .push_back((conn, Instant::now()));
        });
    }
}

/// Fills in a `Host` header derived from the URI when the client sent none
fn ensure_host_header<B>(req: Request<B>) -> Result<Request<B>, InvalidHeaderValue> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key("Host") {
        if let Some(authority) = parts.uri.authority() {
            // Well-known ports stay implicit, mirroring what clients send
            let is_default_port = match parts.uri.scheme_str() {
                Some("http") => matches!(authority.port_u16(), None | Some(80)),
                Some("https") => matches!(authority.port_u16(), None | Some(443)),
                _ => false,
            };

            let value = if is_default_port {
                HeaderValue::from_str(authority.host())?
            } else {
                HeaderValue::from_str(authority.as_str())?
            };
            parts.headers.insert("Host", value);
        }
    }

    Ok(Request::from_parts(parts, body))
}
