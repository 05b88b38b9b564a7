//! Who is on the other end of an upgrade request.

use http::{HeaderMap, HeaderName};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

/// Decides who sent a WebSocket upgrade request. Runs inside the handshake
/// callback, so it must not block.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Trusts a header set by the reverse proxy in front of the tunnel
/// (for example IIS or nginx after Windows authentication).
#[derive(Debug, Clone)]
pub struct TrustedHeaderAuthenticator {
    header: HeaderName,
}

impl TrustedHeaderAuthenticator {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Authenticator for TrustedHeaderAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let value = headers.get(&self.header)?.to_str().ok()?.trim();
        if value.is_empty() {
            return None;
        }
        Some(Principal {
            name: value.to_string(),
        })
    }
}
