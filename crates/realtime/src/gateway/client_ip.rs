use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;

const UNKNOWN_CLIENT_IP: &str = "unknown";

/// Best-effort caller address used as the rate-limit key.
///
/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer,
/// then `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
        Ok(Self(resolve_client_ip(&parts.headers, peer)))
    }
}

pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_else(|| UNKNOWN_CLIENT_IP.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().expect("valid header value"));
        }
        headers
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let headers = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.2"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(resolve_client_ip(&headers, None), "203.0.113.7");
    }

    #[test]
    fn falls_back_through_real_ip_peer_and_unknown() {
        let peer: SocketAddr = "192.0.2.9:5555".parse().unwrap();
        assert_eq!(
            resolve_client_ip(&headers(&[("x-real-ip", "198.51.100.1")]), Some(peer)),
            "198.51.100.1"
        );
        assert_eq!(resolve_client_ip(&headers(&[("x-forwarded-for", "")]), Some(peer)), "192.0.2.9");
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None), "unknown");
    }
}
