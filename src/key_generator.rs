//! Key generation utilities for rate limiting.

use axum::http::HeaderMap;
use std::net::SocketAddr;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where a client's identity came from, in priority order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    ApiKey(String),
    ForwardedAddress(String),
    PeerAddress(String),
    Unknown,
}

impl ClientIdentity {
    /// The quota key for this client.
    ///
    /// Addresses share the `ip:` namespace whether they came from a proxy
    /// header or the socket, so the same address maps to one quota.
    pub fn key(&self) -> String {
        match self {
            ClientIdentity::ApiKey(key) => format!("key:{}", key),
            ClientIdentity::ForwardedAddress(addr) | ClientIdentity::PeerAddress(addr) => {
                format!("ip:{}", addr)
            }
            ClientIdentity::Unknown => format!("ip:{}", UNKNOWN_CLIENT),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientIdentity::ApiKey(_) => "api_key",
            ClientIdentity::ForwardedAddress(_) => "forwarded_for",
            ClientIdentity::PeerAddress(_) => "peer_address",
            ClientIdentity::Unknown => "unknown",
        }
    }
}

/// Resolves client identities from request headers
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    peer_address_fallback: bool,
}

impl KeyGenerator {
    pub fn new(peer_address_fallback: bool) -> Self {
        Self {
            peer_address_fallback,
        }
    }

    /// Identify the client behind a request.
    ///
    /// An API key wins over the first `x-forwarded-for` entry. Without
    /// either, the peer address is used when enabled, else every such
    /// client shares the unknown bucket.
    pub fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientIdentity {
        if let Some(api_key) = header_str(headers, API_KEY_HEADER) {
            if !api_key.is_empty() {
                return ClientIdentity::ApiKey(api_key.to_string());
            }
        }

        if let Some(addr) = Self::extract_forwarded_address(headers) {
            return ClientIdentity::ForwardedAddress(addr);
        }

        match peer {
            Some(peer) if self.peer_address_fallback => {
                ClientIdentity::PeerAddress(peer.ip().to_string())
            }
            _ => ClientIdentity::Unknown,
        }
    }

    /// First address of the `x-forwarded-for` chain
    pub fn extract_forwarded_address(headers: &HeaderMap) -> Option<String> {
        header_str(headers, FORWARDED_FOR_HEADER)
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_api_key_takes_priority() {
        let generator = KeyGenerator::default();
        let headers = headers(&[("x-api-key", "ABC"), ("x-forwarded-for", "9.9.9.9")]);
        let identity = generator.identify(&headers, None);
        assert_eq!(identity, ClientIdentity::ApiKey("ABC".to_string()));
        assert_eq!(identity.key(), "key:ABC");
    }

    #[test]
    fn test_first_forwarded_address_is_used() {
        let generator = KeyGenerator::default();
        let headers = headers(&[("x-forwarded-for", "192.168.1.1, 10.0.0.1")]);
        assert_eq!(generator.identify(&headers, None).key(), "ip:192.168.1.1");
    }

    #[test]
    fn test_empty_api_key_falls_through() {
        let generator = KeyGenerator::default();
        let headers = headers(&[("x-api-key", ""), ("x-forwarded-for", "9.9.9.9")]);
        assert_eq!(generator.identify(&headers, None).key(), "ip:9.9.9.9");
    }

    #[test]
    fn test_missing_headers_share_unknown_bucket() {
        let generator = KeyGenerator::default();
        let peer: SocketAddr = "203.0.113.7:51000".parse().unwrap();
        let identity = generator.identify(&HeaderMap::new(), Some(peer));
        assert_eq!(identity, ClientIdentity::Unknown);
        assert_eq!(identity.key(), "ip:unknown");
    }

    #[test]
    fn test_peer_address_fallback() {
        let generator = KeyGenerator::new(true);
        let peer: SocketAddr = "203.0.113.7:51000".parse().unwrap();
        assert_eq!(generator.identify(&HeaderMap::new(), Some(peer)).key(), "ip:203.0.113.7");
        assert_eq!(generator.identify(&HeaderMap::new(), None), ClientIdentity::Unknown);
    }

    #[test]
    fn test_blank_forwarded_header_is_ignored() {
        let headers = headers(&[("x-forwarded-for", " , 10.0.0.1")]);
        assert_eq!(KeyGenerator::extract_forwarded_address(&headers), None);
    }
}
