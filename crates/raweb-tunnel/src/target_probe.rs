//! Pre-flight checks against the RDP host before guacd is involved.
//!
//! guacd is told to ignore certificate errors, so the tunnel validates the
//! server certificate itself: an X.224 connection request negotiating TLS,
//! then a rustls handshake against the platform trust store.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use raweb_protocol::TargetAddress;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// TPKT + X.224 Connection Request carrying an RDP Negotiation Request
/// for PROTOCOL_SSL | PROTOCOL_HYBRID.
const X224_CONNECTION_REQUEST: [u8; 19] = [
    0x03, 0x00, 0x00, 0x13, // TPKT, length 19
    0x0e, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, // X.224 CR
    0x01, 0x00, 0x08, 0x00, 0x03, 0x00, 0x00, 0x00, // RDP_NEG_REQ
];

const TYPE_RDP_NEG_RSP: u8 = 0x02;
const TYPE_RDP_NEG_FAILURE: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Unreachable(String),
    Refused,
    Timeout,
    UntrustedCertificate(String),
}

pub trait TargetProbe: Send + Sync + 'static {
    fn probe<'a>(&'a self, target: &'a TargetAddress) -> BoxFuture<'a, Result<(), ProbeFailure>>;
}

// ---------------------------------------------------------------------------
// RdpTlsProbe
// ---------------------------------------------------------------------------

pub struct RdpTlsProbe {
    connector: TlsConnector,
    timeout: Duration,
}

impl RdpTlsProbe {
    /// Probe trusting the platform's native roots.
    pub fn with_native_roots(timeout: Duration) -> Result<Self, rustls::Error> {
        let loaded = rustls_native_certs::load_native_certs();
        for e in &loaded.errors {
            tracing::warn!(error = %e, "failed to load a native root certificate");
        }
        let mut roots = rustls::RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        tracing::debug!(added, ignored, "native trust store loaded");
        Self::with_roots(roots, timeout)
    }

    pub fn with_roots(roots: rustls::RootCertStore, timeout: Duration) -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        })
    }

    async fn check(&self, target: &TargetAddress) -> Result<(), ProbeFailure> {
        let mut stream = connect(target, self.timeout).await?;

        stream
            .write_all(&X224_CONNECTION_REQUEST)
            .await
            .map_err(classify_io)?;
        let mut response = [0u8; 19];
        let n = tokio::time::timeout(self.timeout, read_tpkt(&mut stream, &mut response))
            .await
            .map_err(|_| ProbeFailure::Timeout)?
            .map_err(classify_io)?;

        match negotiation_type(&response[..n]) {
            Some(TYPE_RDP_NEG_RSP) => {}
            Some(TYPE_RDP_NEG_FAILURE) => {
                tracing::warn!(host = %target.host, "server refused TLS negotiation; certificate not checked");
                return Ok(());
            }
            _ => {
                tracing::warn!(host = %target.host, "server did not negotiate a security protocol; certificate not checked");
                return Ok(());
            }
        }

        let name = ServerName::try_from(target.host.clone())
            .map_err(|e| ProbeFailure::Unreachable(format!("invalid server name: {e}")))?;
        match tokio::time::timeout(self.timeout, self.connector.connect(name, stream)).await {
            Err(_) => Err(ProbeFailure::Timeout),
            Ok(Ok(_tls)) => Ok(()),
            Ok(Err(e)) => Err(classify_tls(e)),
        }
    }
}

impl TargetProbe for RdpTlsProbe {
    fn probe<'a>(&'a self, target: &'a TargetAddress) -> BoxFuture<'a, Result<(), ProbeFailure>> {
        Box::pin(self.check(target))
    }
}

async fn connect(target: &TargetAddress, timeout: Duration) -> Result<TcpStream, ProbeFailure> {
    let addr = (target.host.as_str(), target.port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(ProbeFailure::Timeout),
        Ok(Err(e)) => Err(classify_io(e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Read one TPKT packet (or as much of it as fits in `buf`).
async fn read_tpkt(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    stream.read_exact(&mut buf[..4]).await?;
    let declared = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let want = declared.clamp(4, buf.len());
    stream.read_exact(&mut buf[4..want]).await?;
    Ok(want)
}

/// Negotiation type byte of an X.224 Connection Confirm, if it carries one.
fn negotiation_type(packet: &[u8]) -> Option<u8> {
    // TPKT (4) + X.224 CC header (7) + RDP_NEG_* (8)
    if packet.len() < 19 || packet[0] != 0x03 || packet[5] & 0xf0 != 0xd0 {
        return None;
    }
    Some(packet[11])
}

fn classify_io(e: std::io::Error) -> ProbeFailure {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused => ProbeFailure::Refused,
        ErrorKind::TimedOut => ProbeFailure::Timeout,
        _ => ProbeFailure::Unreachable(e.to_string()),
    }
}

fn classify_tls(e: std::io::Error) -> ProbeFailure {
    let rustls_error = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match rustls_error {
        Some(rustls::Error::InvalidCertificate(reason)) => {
            ProbeFailure::UntrustedCertificate(format!("{reason:?}"))
        }
        Some(other) => ProbeFailure::Unreachable(format!("TLS handshake failed: {other}")),
        None => classify_io(e),
    }
}

// ---------------------------------------------------------------------------
// Name resolution
// ---------------------------------------------------------------------------

/// First IPv4 address for `host`. IP literals are returned unchanged.
pub async fn resolve_ipv4(host: &str, port: u16) -> std::io::Result<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    tokio::net::lookup_host((host, port))
        .await?
        .find(|a| a.is_ipv4())
        .map(|a| a.ip().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no IPv4 address for {host}"),
            )
        })
}
