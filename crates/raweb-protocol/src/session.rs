//! Values negotiated with the browser before the daemon handshake.

use std::fmt;

/// Domain, user name and password for one hop (target or gateway).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub domain: String,
    pub username: String,
    pub password: String,
}

// Passwords stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Browser display geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

/// Everything the browser supplied during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub credentials: Credentials,
    pub gateway: Option<Credentials>,
    pub display: DisplayInfo,
    /// IANA timezone name, e.g. `Europe/Berlin`. May be empty.
    pub timezone: String,
}

impl NegotiatedSession {
    pub fn new(credentials: Credentials, display: DisplayInfo, timezone: impl Into<String>) -> Self {
        Self {
            credentials,
            gateway: None,
            display,
            timezone: timezone.into(),
        }
    }

    pub fn with_gateway(mut self, gateway: Credentials) -> Self {
        self.gateway = Some(gateway);
        self
    }
}
