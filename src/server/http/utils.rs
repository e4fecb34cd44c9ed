//! HTTP header and URI utilities

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use http::{
    HeaderMap, Uri, Version,
    header::HeaderValue,
    uri::Authority,
};

use crate::relay::socks5::Address;

/// Headers that only describe the client<->proxy hop and must never be
/// forwarded (RFC 7230 §6.1)
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "upgrade",
];

fn default_port(scheme: Option<&str>) -> Option<u16> {
    match scheme {
        // A bare authority, as in a Host header, is assumed to be http
        None | Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    }
}

/// Resolves an authority to a target address
///
/// A missing port falls back to the scheme's well-known one. Userinfo, if
/// present, plays no part in routing.
pub fn addr_from_authority(scheme: Option<&str>, authority: &Authority) -> Option<Address> {
    let port = match authority.port_u16() {
        Some(port) => port,
        None => default_port(scheme)?,
    };

    let host = authority.host();

    // A bracketed host can only be an IPv6 literal
    if let Some(v6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return match v6.parse::<Ipv6Addr>() {
            Ok(ip) => Some(Address::SocketAddress(SocketAddr::new(IpAddr::V6(ip), port))),
            Err(..) => None,
        };
    }

    match host.parse::<Ipv4Addr>() {
        Ok(ip) => Some(Address::SocketAddress(SocketAddr::new(IpAddr::V4(ip), port))),
        // Anything else is a name; the resolver gets to judge it
        Err(..) => Some(Address::DomainNameAddress(host.to_owned(), port)),
    }
}

/// Extracts the forwarding target from an absolute URI
pub fn absolute_uri_target(uri: &Uri) -> Option<Address> {
    addr_from_authority(uri.scheme_str(), uri.authority()?)
}

/// Parses a CONNECT target in authority form
///
/// Unlike forward requests, a CONNECT target carries no scheme to default
/// the port from, so an explicit non-zero port is required.
pub fn parse_connect_target(uri: &Uri) -> Option<Address> {
    let authority = uri.authority()?;
    match authority.port_u16() {
        Some(port) if port > 0 => {}
        _ => return None,
    }
    addr_from_authority(None, authority)
}

/// Reduces an absolute URI to its path-and-query form; relative URIs pass through
pub fn origin_form(uri: &Uri) -> Uri {
    if uri.scheme().is_none() && uri.authority().is_none() {
        return uri.clone();
    }

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

/// Decides whether the peer wants the connection kept open
///
/// `Proxy-Connection` is only meaningful on requests; responses carry plain
/// `Connection`. Later headers override earlier ones, so `Connection` has
/// the last word.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap<HeaderValue>, request: bool) -> bool {
    // HTTP/1.0 defaults to close, everything newer to keep-alive
    let mut keep_alive = !matches!(version, Version::HTTP_09 | Version::HTTP_10);

    let names: &[&str] = if request {
        &["proxy-connection", "connection"]
    } else {
        &["connection"]
    };

    for name in names {
        for value in headers.get_all(*name) {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }
    }

    keep_alive
}

/// Strips hop-by-hop headers before forwarding
///
/// Removes the fixed set plus every header named as a token in `Connection`
/// or `Proxy-Connection`.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap<HeaderValue>) {
    let mut listed = Vec::new();
    for name in ["connection", "proxy-connection"] {
        for value in headers.get_all(name) {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',') {
                let token = token.trim();
                // "close" and "keep-alive" are directives rather than header
                // names; removing headers so named is harmless either way
                if !token.is_empty() {
                    listed.push(token.to_owned());
                }
            }
        }
    }

    for name in HOP_BY_HOP_HEADERS {
        while headers.remove(name).is_some() {}
    }
    for name in &listed {
        while headers.remove(name).is_some() {}
    }
}

/// Rewrites the `Connection` header to match the wanted keep-alive behavior
///
/// Only written when it differs from the version's default.
pub fn set_keep_alive_header(version: Version, headers: &mut HeaderMap<HeaderValue>, keep_alive: bool) {
    let default_keep_alive = !matches!(version, Version::HTTP_09 | Version::HTTP_10);
    if keep_alive != default_keep_alive {
        let value = if keep_alive { "keep-alive" } else { "close" };
        headers.insert("Connection", HeaderValue::from_static(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_scrub_removes_fixed_set() {
        let mut headers = HeaderMap::new();
        headers.insert("Host", HeaderValue::from_static("example.com"));
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authenticate", HeaderValue::from_static("Basic"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9v"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailers", HeaderValue::from_static("Expires"));
        headers.insert("upgrade", HeaderValue::from_static("h2c"));

        strip_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("Host"));
        assert!(headers.contains_key("Accept"));
    }

    #[test]
    fn hop_by_hop_scrub_removes_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("X-Tracking-Id, X-Other"));
        headers.insert("X-Tracking-Id", HeaderValue::from_static("abc"));
        headers.insert("x-other", HeaderValue::from_static("1"));
        headers.insert("X-Kept", HeaderValue::from_static("yes"));

        strip_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("X-Kept"));
    }

    #[test]
    fn origin_form_strips_absolute_uri() {
        let uri: Uri = "http://h:8080/x?q=1".parse().unwrap();
        assert_eq!(origin_form(&uri), "/x?q=1");

        let relative: Uri = "/x?q=1".parse().unwrap();
        assert_eq!(origin_form(&relative), relative);

        let bare: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&bare), "/");
    }

    #[test]
    fn connect_target_requires_port() {
        let uri: Uri = "example.com:443".parse().unwrap();
        assert_eq!(
            parse_connect_target(&uri),
            Some(Address::DomainNameAddress("example.com".to_owned(), 443))
        );

        let uri: Uri = "[::1]:8443".parse().unwrap();
        assert_eq!(
            parse_connect_target(&uri),
            Some(Address::SocketAddress("[::1]:8443".parse().unwrap()))
        );

        let uri: Uri = "example.com".parse().unwrap();
        assert_eq!(parse_connect_target(&uri), None);
    }

    #[test]
    fn authority_ports_default_by_scheme() {
        let auth: Authority = "example.com".parse().unwrap();
        assert_eq!(
            addr_from_authority(Some("http"), &auth),
            Some(Address::DomainNameAddress("example.com".to_owned(), 80))
        );
        assert_eq!(
            addr_from_authority(Some("https"), &auth),
            Some(Address::DomainNameAddress("example.com".to_owned(), 443))
        );
        assert_eq!(addr_from_authority(Some("ftp"), &auth), None);

        let auth: Authority = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(
            addr_from_authority(None, &auth),
            Some(Address::SocketAddress("127.0.0.1:9000".parse().unwrap()))
        );
    }

    #[test]
    fn keep_alive_follows_connection_headers() {
        let headers = HeaderMap::new();
        assert!(wants_keep_alive(Version::HTTP_11, &headers, true));
        assert!(!wants_keep_alive(Version::HTTP_10, &headers, true));

        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("close"));
        assert!(!wants_keep_alive(Version::HTTP_11, &headers, true));

        let mut headers = HeaderMap::new();
        headers.insert("Proxy-Connection", HeaderValue::from_static("keep-alive"));
        assert!(wants_keep_alive(Version::HTTP_10, &headers, true));
        // Proxy-Connection is ignored on responses
        assert!(!wants_keep_alive(Version::HTTP_10, &headers, false));
    }
}
