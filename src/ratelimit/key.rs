//! Limiter key derivation.
//!
//! A key strategy maps what is known about an inbound request to the string that
//! identifies its bucket. Derivation is pure: the caller gathers the request facts into
//! a [`RequestDescriptor`] and the strategy only formats them.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Client address used when neither a forwarded address nor a peer address is known.
const UNKNOWN_CLIENT: &str = "unknown";

/// Default JSON field carrying the login identity.
pub const DEFAULT_IDENTITY_FIELD: &str = "email";

/// The request facts a key strategy may look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDescriptor<'a> {
    /// Raw `X-Forwarded-For` header value, if present
    pub forwarded_for: Option<&'a str>,
    /// Transport-level peer address
    pub peer: Option<SocketAddr>,
    /// Matched route template, or the raw path when no route matched
    pub route: &'a str,
    /// Buffered request body, for strategies that read it
    pub body: Option<&'a [u8]>,
}

impl<'a> RequestDescriptor<'a> {
    /// Resolve the client address: first `X-Forwarded-For` hop, then the peer address.
    pub fn client_address(&self) -> String {
        let forwarded = self
            .forwarded_for
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        match (forwarded, self.peer) {
            (Some(hop), _) => hop.to_string(),
            (None, Some(peer)) => peer.ip().to_string(),
            (None, None) => UNKNOWN_CLIENT.to_string(),
        }
    }
}

/// How a request is turned into a limiter key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One bucket per client address and route template.
    ClientRoute,
    /// One bucket per client address and normalized identity read from the JSON body.
    Login {
        /// Name of the JSON field holding the identity
        #[serde(default = "default_identity_field")]
        identity_field: String,
    },
}

fn default_identity_field() -> String {
    DEFAULT_IDENTITY_FIELD.to_string()
}

impl KeyStrategy {
    /// Login strategy reading the `email` field.
    pub fn login() -> Self {
        KeyStrategy::Login {
            identity_field: default_identity_field(),
        }
    }

    /// Whether this strategy needs the request body buffered before derivation.
    pub fn reads_body(&self) -> bool {
        matches!(self, KeyStrategy::Login { .. })
    }

    /// Derive the limiter key for a request.
    pub fn derive(&self, request: &RequestDescriptor<'_>) -> String {
        let client = request.client_address();
        match self {
            KeyStrategy::ClientRoute => format!("ip:{}:path:{}", client, request.route),
            KeyStrategy::Login { identity_field } => {
                let identity = request
                    .body
                    .map(|body| extract_identity(body, identity_field))
                    .unwrap_or_default();
                format!("login:{}:{}", client, identity)
            }
        }
    }
}

/// Read `field` from a JSON object body and normalize it (trimmed, lowercased).
///
/// Anything that is not a JSON object with a string at `field` yields an empty identity.
pub fn extract_identity(body: &[u8], field: &str) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .as_ref()
        .and_then(|value| value.get(field))
        .and_then(|value| value.as_str())
        .map(normalize_identity)
        .unwrap_or_default()
}

/// Trim and case-fold an identity string.
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("10.1.2.3:51234".parse().unwrap())
    }

    #[test]
    fn test_client_route_uses_peer_address() {
        let request = RequestDescriptor {
            peer: peer(),
            route: "/v1/users/{id}",
            ..Default::default()
        };
        assert_eq!(
            KeyStrategy::ClientRoute.derive(&request),
            "ip:10.1.2.3:path:/v1/users/{id}"
        );
    }

    #[test]
    fn test_forwarded_first_hop_wins() {
        let request = RequestDescriptor {
            forwarded_for: Some(" 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            peer: peer(),
            route: "/v1/users",
            ..Default::default()
        };
        assert_eq!(request.client_address(), "203.0.113.7");
    }

    #[test]
    fn test_empty_forwarded_header_falls_back() {
        let request = RequestDescriptor {
            forwarded_for: Some("  "),
            peer: peer(),
            route: "/",
            ..Default::default()
        };
        assert_eq!(request.client_address(), "10.1.2.3");

        let request = RequestDescriptor {
            route: "/",
            ..Default::default()
        };
        assert_eq!(request.client_address(), "unknown");
    }

    #[test]
    fn test_login_key_normalizes_identity() {
        let body = br#"{"email": "  Alice@Example.COM ", "password": "hunter2"}"#;
        let request = RequestDescriptor {
            peer: peer(),
            route: "/v1/auth/login",
            body: Some(body),
            ..Default::default()
        };
        assert_eq!(
            KeyStrategy::login().derive(&request),
            "login:10.1.2.3:alice@example.com"
        );
    }

    #[test]
    fn test_login_identities_are_distinct() {
        let alice = br#"{"email":"alice@example.com"}"#;
        let bob = br#"{"email":"bob@example.com"}"#;
        let strategy = KeyStrategy::login();

        let key_a = strategy.derive(&RequestDescriptor {
            peer: peer(),
            route: "/v1/auth/login",
            body: Some(alice),
            ..Default::default()
        });
        let key_b = strategy.derive(&RequestDescriptor {
            peer: peer(),
            route: "/v1/auth/login",
            body: Some(bob),
            ..Default::default()
        });
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_login_key_tolerates_bad_bodies() {
        let strategy = KeyStrategy::login();
        let bodies: [&[u8]; 4] = [b"not json", b"[1,2,3]", br#"{"email": 42}"#, b""];
        for body in bodies {
            let request = RequestDescriptor {
                peer: peer(),
                route: "/v1/auth/login",
                body: Some(body),
                ..Default::default()
            };
            assert_eq!(strategy.derive(&request), "login:10.1.2.3:");
        }
    }

    #[test]
    fn test_custom_identity_field() {
        let strategy = KeyStrategy::Login {
            identity_field: "username".to_string(),
        };
        let request = RequestDescriptor {
            forwarded_for: Some("198.51.100.4"),
            route: "/login",
            body: Some(br#"{"username":"Root"}"#),
            ..Default::default()
        };
        assert_eq!(strategy.derive(&request), "login:198.51.100.4:root");
        assert!(strategy.reads_body());
        assert!(!KeyStrategy::ClientRoute.reads_body());
    }
}
