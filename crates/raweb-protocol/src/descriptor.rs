//! Connection descriptor (`.rdp` style `key:type:value` text).
//!
//! One property per line. The key is matched case-insensitively; the value
//! is everything after the second colon, so values may contain colons
//! (`full address:s:host.example.com:3390`).

use std::collections::HashMap;

use crate::error::DescriptorError;

/// Default RDP port when neither the address nor `server port` names one.
pub const DEFAULT_RDP_PORT: u16 = 3389;

/// Default port of a Remote Desktop Gateway.
pub const DEFAULT_GATEWAY_PORT: u16 = 443;

// ---------------------------------------------------------------------------
// Property values
// ---------------------------------------------------------------------------

/// Declared type of a descriptor property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// `s`
    Str,
    /// `i`
    Int,
    /// `b` (hex-encoded binary)
    Binary,
    Other(char),
}

impl PropertyKind {
    fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "s" => Self::Str,
            "i" => Self::Int,
            "b" => Self::Binary,
            other => Self::Other(other.chars().next().unwrap_or('?')),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    pub kind: PropertyKind,
    pub raw: String,
}

/// Host and port of an RDP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// ConnectionDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ConnectionDescriptor {
    properties: HashMap<String, PropertyValue>,
}

impl ConnectionDescriptor {
    /// Parse descriptor text. Lines that are not `key:type:value` are skipped.
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut properties = HashMap::new();

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, ':');
            let (Some(key), Some(tag), Some(value)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            properties.insert(
                key,
                PropertyValue {
                    kind: PropertyKind::from_tag(tag),
                    raw: value.trim().to_string(),
                },
            );
        }

        Self { properties }
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(&key.to_lowercase())
    }

    /// String value, treating an empty value as absent.
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.get(key)
            .map(|v| v.raw.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn int_value(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.raw.parse().ok())
    }

    /// Integer property read as a switch: non-zero is on.
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.int_value(key).map(|v| v != 0)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    // -----------------------------------------------------------------
    // Well-known properties
    // -----------------------------------------------------------------

    /// Target host and port from `full address` (falling back to `server port`).
    pub fn address(&self) -> Result<TargetAddress, DescriptorError> {
        let raw = self
            .str_value("full address")
            .ok_or(DescriptorError::MissingAddress)?;
        let fallback = self
            .int_value("server port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_RDP_PORT);
        split_host_port(raw, fallback)
    }

    /// Gateway endpoint, if this connection is routed through one.
    ///
    /// `gatewayusagemethod` 0 ("do not use") and 4 ("default, not used")
    /// disable the gateway even when a hostname is present.
    pub fn gateway(&self) -> Result<Option<TargetAddress>, DescriptorError> {
        let Some(raw) = self.str_value("gatewayhostname") else {
            return Ok(None);
        };
        if matches!(self.int_value("gatewayusagemethod"), Some(0) | Some(4)) {
            return Ok(None);
        }
        split_host_port(raw, DEFAULT_GATEWAY_PORT).map(Some)
    }

    pub fn remote_app_mode(&self) -> bool {
        self.flag("remoteapplicationmode").unwrap_or(false)
    }

    pub fn remote_app_program(&self) -> Option<&str> {
        self.str_value("remoteapplicationprogram")
    }

    pub fn remote_app_cmdline(&self) -> Option<&str> {
        self.str_value("remoteapplicationcmdline")
    }

    pub fn remote_app_file(&self) -> Option<&str> {
        self.str_value("remoteapplicationfile")
    }

    /// Whether environment variables in the command line expand on the
    /// remote computer. Absent means yes, matching the RDP client default.
    pub fn remote_app_expands_remotely(&self) -> bool {
        self.flag("remoteapplicationexpandcmdline").unwrap_or(true)
    }
}

/// Split `host[:port]`, `[v6]:port` or a bare IPv6 literal.
fn split_host_port(raw: &str, default_port: u16) -> Result<TargetAddress, DescriptorError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DescriptorError::MissingAddress);
    }

    if let Some(rest) = raw.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(DescriptorError::InvalidPort(raw.to_string()));
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p, raw)?,
            None if tail.is_empty() => default_port,
            None => return Err(DescriptorError::InvalidPort(raw.to_string())),
        };
        return Ok(TargetAddress {
            host: host.to_string(),
            port,
        });
    }

    match raw.rsplit_once(':') {
        // More than one colon without brackets: bare IPv6, no port.
        Some((host, _)) if host.contains(':') => Ok(TargetAddress {
            host: raw.to_string(),
            port: default_port,
        }),
        Some((host, port)) => Ok(TargetAddress {
            host: host.to_string(),
            port: parse_port(port, raw)?,
        }),
        None => Ok(TargetAddress {
            host: raw.to_string(),
            port: default_port,
        }),
    }
}

fn parse_port(port: &str, raw: &str) -> Result<u16, DescriptorError> {
    port.trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| DescriptorError::InvalidPort(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}full address:s:host.example.com:3390\r\n\
        Username:s:CORP\\alice\r\n\
        audiomode:i:1\r\n\
        remoteapplicationmode:i:0\r\n\
        garbage line\r\n\
        \r\n";

    #[test]
    fn parse_lowercases_keys_and_keeps_colons_in_values() {
        let d = ConnectionDescriptor::parse(SAMPLE);
        assert_eq!(d.len(), 4);
        assert_eq!(d.str_value("full address"), Some("host.example.com:3390"));
        assert_eq!(d.str_value("username"), Some("CORP\\alice"));
        assert_eq!(d.get("AUDIOMODE").unwrap().kind, PropertyKind::Int);
    }

    #[test]
    fn address_with_port() {
        let d = ConnectionDescriptor::parse(SAMPLE);
        assert_eq!(
            d.address().unwrap(),
            TargetAddress {
                host: "host.example.com".into(),
                port: 3390
            }
        );
    }

    #[test]
    fn address_falls_back_to_server_port() {
        let d = ConnectionDescriptor::parse("full address:s:pc01\nserver port:i:4000\n");
        assert_eq!(d.address().unwrap().port, 4000);
        let d = ConnectionDescriptor::parse("full address:s:pc01\n");
        assert_eq!(d.address().unwrap().port, DEFAULT_RDP_PORT);
    }

    #[test]
    fn address_ipv6_forms() {
        let d = ConnectionDescriptor::parse("full address:s:[fe80::1]:3391\n");
        let a = d.address().unwrap();
        assert_eq!((a.host.as_str(), a.port), ("fe80::1", 3391));

        let d = ConnectionDescriptor::parse("full address:s:fe80::1\n");
        let a = d.address().unwrap();
        assert_eq!((a.host.as_str(), a.port), ("fe80::1", DEFAULT_RDP_PORT));
    }

    #[test]
    fn missing_or_empty_address() {
        let d = ConnectionDescriptor::parse("username:s:alice\n");
        assert_eq!(d.address(), Err(DescriptorError::MissingAddress));
        let d = ConnectionDescriptor::parse("full address:s:\n");
        assert_eq!(d.address(), Err(DescriptorError::MissingAddress));
    }

    #[test]
    fn bad_port_rejected() {
        let d = ConnectionDescriptor::parse("full address:s:pc01:notaport\n");
        assert!(matches!(d.address(), Err(DescriptorError::InvalidPort(_))));
    }

    #[test]
    fn gateway_usage_method() {
        let d = ConnectionDescriptor::parse("gatewayhostname:s:gw.example.com\n");
        assert_eq!(d.gateway().unwrap().unwrap().port, DEFAULT_GATEWAY_PORT);

        let d = ConnectionDescriptor::parse(
            "gatewayhostname:s:gw.example.com:8443\ngatewayusagemethod:i:1\n",
        );
        assert_eq!(d.gateway().unwrap().unwrap().port, 8443);

        let d = ConnectionDescriptor::parse(
            "gatewayhostname:s:gw.example.com\ngatewayusagemethod:i:0\n",
        );
        assert!(d.gateway().unwrap().is_none());
    }

    #[test]
    fn remote_app_defaults() {
        let d = ConnectionDescriptor::parse("remoteapplicationmode:i:1\n");
        assert!(d.remote_app_mode());
        assert!(d.remote_app_expands_remotely());
        assert!(d.remote_app_program().is_none());
    }
}
