use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

use crate::auth::Authenticator;
use crate::negotiator::{self, SessionRequest, TunnelContext};
use crate::resolver::ResourceOrigin;

/// The only WebSocket subprotocol the tunnel speaks.
pub const SUBPROTOCOL: &str = "guacamole";

/// Default maximum number of concurrent tunnels.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

// ---------------------------------------------------------------------------
// Upgrade validation
// ---------------------------------------------------------------------------

/// Checks applied to every upgrade request before it is accepted.
pub struct UpgradePolicy {
    pub ws_path: String,
    pub auth: Arc<dyn Authenticator>,
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(message.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Validate an upgrade request.
///
/// - wrong path → 404
/// - no `guacamole` subprotocol → 400
/// - no authenticated principal → 401
/// - missing `path` or unknown `origin` query parameter → 400
fn validate_upgrade(
    policy: &UpgradePolicy,
    req: &Request,
    mut resp: Response,
) -> Result<(Response, SessionRequest), ErrorResponse> {
    if req.uri().path() != policy.ws_path {
        tracing::debug!(path = %req.uri().path(), "ws: upgrade on unknown path");
        return Err(reject(StatusCode::NOT_FOUND, "Not found"));
    }

    let offers_guacamole = req
        .headers()
        .get_all(http::header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL);
    if !offers_guacamole {
        tracing::warn!("ws: upgrade without guacamole subprotocol");
        return Err(reject(StatusCode::BAD_REQUEST, "Subprotocol guacamole required"));
    }

    let Some(principal) = policy.auth.authenticate(req.headers()) else {
        tracing::warn!("ws: unauthenticated upgrade rejected");
        return Err(reject(StatusCode::UNAUTHORIZED, "Authentication required"));
    };

    let query: Vec<(String, String)> =
        form_urlencoded::parse(req.uri().query().unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
    let lookup = |key: &str| {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let path = match lookup("path") {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(reject(StatusCode::BAD_REQUEST, "Missing path parameter")),
    };
    let origin = match lookup("origin").unwrap_or("rdp").parse::<ResourceOrigin>() {
        Ok(o) => o,
        Err(e) => return Err(reject(StatusCode::BAD_REQUEST, &e)),
    };
    let skip_cert_check = matches!(
        lookup("skipCertCheck").map(str::to_ascii_lowercase).as_deref(),
        Some("true" | "1")
    );

    resp.headers_mut().insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        http::HeaderValue::from_static(SUBPROTOCOL),
    );
    Ok((
        resp,
        SessionRequest {
            principal,
            path,
            origin,
            skip_cert_check,
        },
    ))
}

// ---------------------------------------------------------------------------
// TunnelServer
// ---------------------------------------------------------------------------

/// Accepts WebSocket upgrades and runs one session task per tunnel.
pub struct TunnelServer {
    addr: SocketAddr,
    ctx: Arc<TunnelContext>,
    policy: Arc<UpgradePolicy>,
    cancel: CancellationToken,
    max_connections: usize,
    next_session: AtomicU64,
}

impl TunnelServer {
    pub fn new(
        addr: SocketAddr,
        ctx: Arc<TunnelContext>,
        policy: UpgradePolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            ctx,
            policy: Arc::new(policy),
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Bind to the configured address and return the actual local address.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            path = %self.policy.ws_path,
            max_connections = self.max_connections,
            "tunnel listening"
        );
        Ok((listener, local_addr))
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(error = %e, "ws: TCP accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        tracing::warn!(%peer, max = self.max_connections, "ws: connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    let ctx = Arc::clone(&self.ctx);
                    let policy = Arc::clone(&self.policy);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let mut accepted = None;
                        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            let (resp, request) = validate_upgrade(&policy, req, resp)?;
                            accepted = Some(request);
                            Ok(resp)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws) => match accepted {
                                Some(request) => negotiator::run_session(ctx, id, request, ws).await,
                                None => tracing::error!(session = id, "upgrade accepted without a session request"),
                            },
                            Err(e) => tracing::debug!(session = id, %peer, error = %e, "ws handshake failed"),
                        }
                    });
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("tunnel server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
