//! Client identity used as the quota key

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::AppState;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Network identity of the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// First X-Forwarded-For hop when trusted, otherwise the peer address
pub fn resolve_identity(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(ClientIdentity(resolve_identity(
            &parts.headers,
            peer,
            state.config.server.trust_forwarded_for,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::from(([10, 0, 0, 7], 52100)))
    }

    #[test]
    fn test_first_forwarded_hop_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("203.0.113.9, 10.0.0.1"));

        assert_eq!(resolve_identity(&headers, peer(), true), "203.0.113.9");
    }

    #[test]
    fn test_untrusted_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));

        assert_eq!(resolve_identity(&headers, peer(), false), "10.0.0.7");
    }

    #[test]
    fn test_falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_identity(&headers, peer(), true), "10.0.0.7");
        assert_eq!(resolve_identity(&headers, None, true), "unknown");
    }
}
