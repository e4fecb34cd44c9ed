//! HTTP proxy request dispatcher

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use bytes::Bytes;
use http::{
    Method, StatusCode, Uri,
    header::{CONTENT_LENGTH, HeaderValue},
    uri::{Authority, Scheme},
};
use http_body_util::{BodyExt, Empty, combinators::BoxBody};
use hyper::{Request, Response, body, upgrade};
use hyper_util::rt::TokioIo;
use log::{debug, error, trace};

use crate::{
    context::{ConnectionGuard, ServiceContext},
    net::IdleToken,
    relay::{
        socks5::Address,
        tcp::{connect_target, establish_tcp_tunnel},
    },
    stats::FailureKind,
};

use super::{
    client::{HttpClient, HttpClientError},
    utils::{
        absolute_uri_target, addr_from_authority, parse_connect_target, set_keep_alive_header,
        strip_hop_by_hop_headers, wants_keep_alive,
    },
};

/// Per-request dispatcher for one HTTP client connection
pub struct HttpService {
    context: Arc<ServiceContext>,
    peer_addr: SocketAddr,
    http_client: HttpClient<body::Incoming>,
    guard: Arc<ConnectionGuard>,
    idle: IdleToken,
}

impl HttpService {
    pub fn new(
        context: Arc<ServiceContext>,
        peer_addr: SocketAddr,
        http_client: HttpClient<body::Incoming>,
        guard: Arc<ConnectionGuard>,
        idle: IdleToken,
    ) -> HttpService {
        HttpService {
            context,
            peer_addr,
            http_client,
            guard,
            idle,
        }
    }

    pub async fn serve_connection(
        self,
        req: Request<body::Incoming>,
    ) -> hyper::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        trace!("request {} {:?}", self.peer_addr, req);

        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_forward(req).await
        }
    }

    async fn handle_connect(
        self,
        req: Request<body::Incoming>,
    ) -> hyper::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        // Establish a TCP tunnel
        // https://tools.ietf.org/html/draft-luotonen-web-proxy-tunneling-01

        let host = match parse_connect_target(req.uri()) {
            Some(h) => h,
            None => {
                error!("HTTP CONNECT {} is not a valid host:port target", req.uri());
                self.context
                    .stats()
                    .failed(FailureKind::Malformed, format!("invalid CONNECT target {}", req.uri()));
                return make_bad_request();
            }
        };

        debug!("HTTP CONNECT {}", host);

        let mut remote = match connect_target(&host, self.context.config().connect_timeout).await {
            Ok(s) => s,
            Err(err) => {
                error!("failed to CONNECT host: {}, error: {}", host, err);
                self.context
                    .stats()
                    .failed(FailureKind::UpstreamConnect, format!("CONNECT {host}: {err}"));
                return make_bad_gateway();
            }
        };

        // Note: only after the client received the response head can the
        // connection be upgraded, so the tunnel runs in its own task.
        let peer_addr = self.peer_addr;
        let guard = self.guard.clone();
        let idle = self.idle.clone();
        let stats = self.context.stats().clone();
        tokio::spawn(async move {
            let _guard = guard;

            match upgrade::on(req).await {
                Ok(upgraded) => {
                    trace!("CONNECT tunnel upgrade success, {} <-> {}", peer_addr, host);

                    // The tunnel manages its own lifecycle from here on
                    idle.disarm();

                    let mut upgraded_io = TokioIo::new(upgraded);
                    if let Err(err) = establish_tcp_tunnel(&mut upgraded_io, &mut remote, peer_addr, &host).await {
                        stats.failed(FailureKind::Relay, format!("CONNECT tunnel {peer_addr} <-> {host}: {err}"));
                    }
                }
                Err(err) => {
                    error!("failed to upgrade CONNECT request, error: {}", err);
                }
            }
        });

        // The explicit zero length keeps chunked framing off the 200 head;
        // a chunked terminator would corrupt the tunneled stream.
        let mut resp = Response::new(empty_body());
        resp.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        Ok(resp)
    }

    async fn handle_forward(
        self,
        mut req: Request<body::Incoming>,
    ) -> hyper::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        // Proxy request URI must contain a host
        let host = match absolute_uri_target(req.uri()) {
            Some(h) => h,
            None => {
                if req.uri().authority().is_some() {
                    // URI has authority but invalid
                    error!("HTTP {} URI {} doesn't have a valid host", req.method(), req.uri());
                    self.context
                        .stats()
                        .failed(FailureKind::Malformed, format!("invalid target URI {}", req.uri()));
                    return make_bad_request();
                }

                match get_addr_from_header(&mut req) {
                    Ok(h) => h,
                    Err(()) => {
                        self.context
                            .stats()
                            .failed(FailureKind::Malformed, format!("no target host in {}", req.uri()));
                        return make_bad_request();
                    }
                }
            }
        };

        let method = req.method().clone();
        let version = req.version();
        debug!("HTTP {} {} {:?}", method, host, version);

        // Remember the client's keep-alive wish before the scrub eats the
        // Connection headers, then express it towards the upstream
        let conn_keep_alive = wants_keep_alive(version, req.headers(), true);
        strip_hop_by_hop_headers(req.headers_mut());
        set_keep_alive_header(version, req.headers_mut(), conn_keep_alive);

        let mut res = match self.http_client.send_request(self.context.clone(), req).await {
            Ok(res) => res,
            Err(HttpClientError::Hyper(e)) => return Err(e),
            Err(err) => {
                error!("failed to make request to host: {}, error: {}", host, err);
                self.context
                    .stats()
                    .failed(FailureKind::UpstreamConnect, format!("{method} {host}: {err}"));
                return make_bad_gateway();
            }
        };

        trace!("received {} <- {} {:?}", self.peer_addr, host, res);

        // The client connection stays open only if both sides agree
        let res_keep_alive = conn_keep_alive && wants_keep_alive(res.version(), res.headers(), false);

        strip_hop_by_hop_headers(res.headers_mut());

        // The response goes back in the version the client spoke
        if res.version() != version {
            trace!("response version {:?} => {:?}", res.version(), version);
            *res.version_mut() = version;
        }

        set_keep_alive_header(res.version(), res.headers_mut(), res_keep_alive);

        debug!("HTTP {} relay {} <-> {} finished", method, self.peer_addr, host);

        Ok(res.map(|b| b.boxed()))
    }
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn make_bad_request() -> hyper::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    Ok(resp)
}

fn make_bad_gateway() -> hyper::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    Ok(resp)
}

fn get_addr_from_header(req: &mut Request<body::Incoming>) -> Result<Address, ()> {
    // Requests with a relative URI still name their target in Host
    let Some(hhost) = req.headers().get("Host") else {
        error!(
            "HTTP {} URI doesn't have valid host and missing the \"Host\" header, URI: {}",
            req.method(),
            req.uri()
        );
        return Err(());
    };

    let Ok(shost) = hhost.to_str() else {
        error!(
            "HTTP {} URI {} \"Host\" header invalid encoding, value: {:?}",
            req.method(),
            req.uri(),
            hhost
        );
        return Err(());
    };

    let Ok(authority) = Authority::from_str(shost) else {
        error!(
            "HTTP {} URI {} \"Host\" header is not an Authority, value: {:?}",
            req.method(),
            req.uri(),
            hhost
        );
        return Err(());
    };

    match addr_from_authority(req.uri().scheme_str(), &authority) {
        Some(host) => {
            trace!("HTTP {} URI {} got host from header: {}", req.method(), req.uri(), host);

            // Rebuild the request URI around the recovered authority so the
            // rest of the pipeline sees an absolute form
            let mut parts = req.uri().clone().into_parts();
            if parts.scheme.is_none() {
                parts.scheme = Some(Scheme::HTTP);
            }
            parts.authority = Some(authority);

            match Uri::from_parts(parts) {
                Ok(uri) => {
                    *req.uri_mut() = uri;
                    debug!("reassembled URI from \"Host\", {}", req.uri());
                    Ok(host)
                }
                Err(err) => {
                    error!("failed to reassemble URI from \"Host\", error: {}", err);
                    Err(())
                }
            }
        }
        None => {
            error!(
                "HTTP {} URI {} \"Host\" header invalid, value: {}",
                req.method(),
                req.uri(),
                shost
            );
            Err(())
        }
    }
}
