pub mod config;
pub mod error;
pub mod models;
pub mod util;

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, request::Parts},
};

/// Extractor for the address of the caller.
/// Prefers `CF-Connecting-IP`, then the first `X-Forwarded-For` hop, then the
/// socket peer address.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClientAddr(pub Option<IpAddr>);

impl ClientAddr {
    pub fn from_headers(headers: &HeaderMap) -> Option<IpAddr> {
        if let Some(ip) = headers
            .get("CF-Connecting-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| IpAddr::from_str(s.trim()).ok())
        {
            return Some(ip);
        }
        headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| IpAddr::from_str(s.trim()).ok())
    }
}

impl<S> FromRequestParts<S> for ClientAddr
where S: Send + Sync
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = Self::from_headers(&parts.headers).or_else(|| {
            parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip())
        });
        Ok(ClientAddr(ip))
    }
}

impl std::fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("[unknown]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_client_addr_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(ClientAddr::from_headers(&headers), None);
        headers.insert("X-Forwarded-For", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(ClientAddr::from_headers(&headers), Some(IpAddr::from([203, 0, 113, 9])));
        headers.insert("CF-Connecting-IP", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(ClientAddr::from_headers(&headers), Some(IpAddr::from([198, 51, 100, 7])));
    }
}
