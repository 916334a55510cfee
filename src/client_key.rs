//! Client identity resolution for rate limit keys.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Identity shared by every client whose address cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Proxy and CDN headers consulted in priority order.
pub const DEFAULT_CLIENT_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "cf-connecting-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// Derives a stable identity string for a request.
///
/// Resolution never fails: an unresolvable client falls into the shared
/// [`UNKNOWN_CLIENT`] bucket.
#[derive(Debug, Clone)]
pub struct ClientKeyResolver {
    headers: Vec<String>,
}

impl ClientKeyResolver {
    pub fn new() -> Self {
        Self::with_headers(DEFAULT_CLIENT_HEADERS.iter().copied())
    }

    pub fn with_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|name| name.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn resolve(&self, headers: &HeaderMap, remote_addr: Option<IpAddr>) -> String {
        self.headers
            .iter()
            .find_map(|name| {
                let value = headers.get(name.as_str())?.to_str().ok()?;
                let first = value.split(',').next()?.trim();
                (!first.is_empty()).then(|| first.to_string())
            })
            .or_else(|| remote_addr.map(|ip| ip.to_string()))
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    pub fn resolve_request(&self, request: &Request) -> String {
        self.resolve(request.headers(), remote_addr(request))
    }
}

impl Default for ClientKeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer address recorded by the server, if any.
pub fn remote_addr(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| request.extensions().get::<SocketAddr>().map(SocketAddr::ip))
}
