//! Per-session negotiation, from an accepted upgrade to a relaying tunnel.
//!
//! ```text
//! AwaitUpgrade → Authenticated → ResourceResolved → AddressValidated
//!   → CredentialsCollected → DisplayCollected → DaemonReady
//!   → Handshaking → Relaying → Closed
//! ```
//!
//! Any step may end in `Failed`, which reports one `error` instruction
//! followed by `disconnect` and closes the socket. The first two phases
//! happen in the upgrade callback (see `ws_server`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use raweb_guacd::{ActiveSessionRegistry, DaemonState, Supervisor};
use raweb_protocol::{
    ConnectionDescriptor, Credentials, DisplayInfo, Instruction, MappingContext, NegotiatedSession,
    TargetAddress, validate_descriptor,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::Principal;
use crate::channel::{ClientSink, ClientSource, WsStream};
use crate::error::{TunnelError, code};
use crate::handshake;
use crate::relay::{self, KeepAlive};
use crate::resolver::{ResourceOrigin, ResourceRequest, ResourceResolver};
use crate::target_probe::{self, ProbeFailure, TargetProbe};

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Where guacd comes from.
#[derive(Clone)]
pub enum DaemonEndpoint {
    /// Started on demand by the supervisor.
    Managed(Arc<Supervisor>),
    /// Already running at this `host:port`.
    External(String),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub daemon_connect_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            daemon_connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a session needs that outlives it.
pub struct TunnelContext {
    pub resolver: Arc<dyn ResourceResolver>,
    pub probe: Arc<dyn TargetProbe>,
    pub daemon: DaemonEndpoint,
    pub registry: Arc<ActiveSessionRegistry>,
    pub settings: SessionSettings,
}

/// What the upgrade callback learned about the request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub principal: Principal,
    pub path: String,
    pub origin: ResourceOrigin,
    pub skip_cert_check: bool,
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitUpgrade,
    Authenticated,
    ResourceResolved,
    AddressValidated,
    CredentialsCollected,
    DisplayCollected,
    DaemonReady,
    Handshaking,
    Relaying,
    Closed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    id: u64,
    ctx: Arc<TunnelContext>,
    request: SessionRequest,
    sink: ClientSink,
    phase: Phase,
}

/// Result of negotiation: a guacd connection ready to relay.
struct Negotiated {
    link: handshake::DaemonLink,
}

/// Drive one accepted WebSocket to completion. Never panics the server:
/// every failure is reported to the client and logged here.
pub async fn run_session(ctx: Arc<TunnelContext>, id: u64, request: SessionRequest, ws: WsStream) {
    let (sink, stream) = ws.split();
    let sink = ClientSink::new(sink);
    let mut source = ClientSource::new(stream);
    let mut session = Session {
        id,
        ctx,
        request,
        sink: sink.clone(),
        phase: Phase::Authenticated,
    };
    tracing::info!(
        session = id,
        user = %session.request.principal.name,
        resource = %session.request.path,
        origin = %session.request.origin,
        "session started"
    );

    let keepalive = KeepAlive::spawn(sink.clone(), session.ctx.settings.keepalive_interval);
    let negotiated = session.negotiate(&mut source, keepalive).await;

    let Negotiated { link } = match negotiated {
        Ok(n) => n,
        Err(e) => {
            let failed_in = session.phase;
            session.advance(Phase::Failed);
            if e.code() == code::GENERIC {
                tracing::error!(session = id, phase = %failed_in, error = %e, "session failed");
            } else {
                tracing::warn!(session = id, phase = %failed_in, code = e.code(), error = %e, "session rejected");
            }
            sink.fail(&e).await;
            return;
        }
    };

    session.advance(Phase::Relaying);
    let connection_id = link.connection_id.clone();
    let (ws_stream, client_leftover) = source.into_relay();
    let outcome = relay::run(
        id,
        ws_stream,
        client_leftover,
        sink.clone(),
        link.stream,
        link.leftover,
    )
    .await;
    tracing::info!(session = id, connection = %connection_id, ?outcome, "relay finished");

    session.advance(Phase::Closed);
    session.ctx.registry.remove(&connection_id).await;
    sink.close().await;
}

impl Session {
    fn advance(&mut self, next: Phase) {
        tracing::debug!(session = self.id, from = %self.phase, to = %next, "session phase");
        self.phase = next;
    }

    async fn send(&self, instruction: Instruction) -> Result<(), TunnelError> {
        self.sink.send(&instruction).await
    }

    async fn negotiate(
        &mut self,
        source: &mut ClientSource,
        keepalive: KeepAlive,
    ) -> Result<Negotiated, TunnelError> {
        // ResourceResolved
        let resource = ResourceRequest {
            path: self.request.path.clone(),
            origin: self.request.origin,
            principal: self.request.principal.clone(),
        };
        let text = self
            .ctx
            .resolver
            .resolve(&resource)
            .await
            .map_err(|f| TunnelError::Resolver {
                status: f.status,
                message: f.message,
            })?;
        let descriptor = ConnectionDescriptor::parse(&text);
        self.advance(Phase::ResourceResolved);

        // AddressValidated
        let target = descriptor.address()?;
        let gateway = descriptor.gateway()?;
        validate_descriptor(&descriptor)?;
        if self.request.skip_cert_check {
            tracing::info!(session = self.id, host = %target.host, "certificate check skipped by request");
        } else {
            self.probe_target(&target).await?;
        }
        let dial = self.resolve_target(&target).await?;
        self.advance(Phase::AddressValidated);

        // CredentialsCollected
        let credentials = self
            .collect_credentials(source, CredentialKind::Target)
            .await?;
        let gateway_credentials = match gateway {
            Some(gw) => {
                tracing::debug!(session = self.id, gateway = %gw.host, "gateway in use");
                Some(
                    self.collect_credentials(source, CredentialKind::Gateway)
                        .await?,
                )
            }
            None => None,
        };
        self.advance(Phase::CredentialsCollected);

        // DisplayCollected
        let display = self.collect_display(source).await?;
        let timezone = self.collect_timezone(source).await?;
        let mut negotiated = NegotiatedSession::new(credentials, display, timezone);
        if let Some(gw) = gateway_credentials {
            negotiated = negotiated.with_gateway(gw);
        }
        self.advance(Phase::DisplayCollected);

        // DaemonReady
        let daemon_addr = self.await_daemon().await?;
        self.advance(Phase::DaemonReady);

        // Handshaking
        let stream = handshake::connect(&daemon_addr, self.ctx.settings.daemon_connect_timeout).await?;
        keepalive.stop().await;
        self.advance(Phase::Handshaking);

        let mapping = MappingContext::new(&descriptor, &negotiated, &dial)?;
        let link = handshake::perform(stream, &mapping).await?;
        tracing::info!(session = self.id, connection = %link.connection_id, "guacd connection ready");

        // The browser learns the connection id through the internal
        // (empty-opcode) instruction, as with any Guacamole tunnel. Only a
        // delivered id is registered.
        self.send(Instruction::new("", [link.connection_id.as_str()]))
            .await?;
        self.ctx
            .registry
            .add(link.connection_id.clone(), self.request.path.clone())
            .await;
        Ok(Negotiated { link })
    }

    async fn probe_target(&self, target: &TargetAddress) -> Result<(), TunnelError> {
        let addr = format!("{}:{}", target.host, target.port);
        match self.ctx.probe.probe(target).await {
            Ok(()) => Ok(()),
            Err(ProbeFailure::Refused) => Err(TunnelError::TargetRefused { addr }),
            Err(ProbeFailure::Timeout) => Err(TunnelError::TargetTimeout { addr }),
            Err(ProbeFailure::Unreachable(detail)) => {
                Err(TunnelError::TargetUnreachable { addr, detail })
            }
            Err(ProbeFailure::UntrustedCertificate(detail)) => {
                Err(TunnelError::UntrustedCertificate { addr, detail })
            }
        }
    }

    /// guacd may not share our resolver, so hand it an IPv4 address when we
    /// can. Failure is reported to the browser console but is not fatal.
    async fn resolve_target(&self, target: &TargetAddress) -> Result<TargetAddress, TunnelError> {
        match target_probe::resolve_ipv4(&target.host, target.port).await {
            Ok(ip) => Ok(TargetAddress {
                host: ip,
                port: target.port,
            }),
            Err(e) => {
                tracing::warn!(session = self.id, host = %target.host, error = %e, "hostname resolution failed; continuing with hostname");
                self.send(Instruction::new(
                    "raweb-console-error",
                    [
                        format!("Could not resolve {}", target.host),
                        e.to_string(),
                        code::HOSTNAME_RESOLUTION.to_string(),
                    ],
                ))
                .await?;
                Ok(target.clone())
            }
        }
    }

    async fn collect_credentials(
        &self,
        source: &mut ClientSource,
        kind: CredentialKind,
    ) -> Result<Credentials, TunnelError> {
        let [domain_op, user_op, pass_op] = kind.opcodes();
        self.send(Instruction::bare(kind.demand())).await?;

        let mut domain = None;
        let mut username = None;
        let mut password = None;
        for _ in 0..3 {
            let instruction = source
                .next_instruction()
                .await?
                .ok_or_else(|| kind.missing())?;
            let value = instruction.arg(0).unwrap_or_default().to_string();
            match instruction.opcode() {
                op if op == domain_op => domain = Some(value),
                op if op == user_op => username = Some(value),
                op if op == pass_op => password = Some(value),
                other => return Err(TunnelError::UnexpectedMessage(other.to_string())),
            }
        }

        match (username.filter(|u| !u.is_empty()), password) {
            (Some(username), Some(password)) => Ok(Credentials {
                domain: domain.unwrap_or_default(),
                username,
                password,
            }),
            _ => Err(kind.missing()),
        }
    }

    async fn collect_display(&self, source: &mut ClientSource) -> Result<DisplayInfo, TunnelError> {
        self.send(Instruction::bare("raweb-demand-display-info"))
            .await?;

        let mut width = None;
        let mut height = None;
        let mut dpi = None;
        for _ in 0..3 {
            let instruction = source
                .next_instruction()
                .await?
                .ok_or_else(|| TunnelError::MissingDisplayInfo("client closed".into()))?;
            let slot = match instruction.opcode() {
                "displayWidth" => &mut width,
                "displayHeight" => &mut height,
                "displayDPI" => &mut dpi,
                other => return Err(TunnelError::UnexpectedMessage(other.to_string())),
            };
            let raw = instruction.arg(0).unwrap_or_default();
            let value = raw.trim().parse::<u32>().map_err(|_| {
                TunnelError::MissingDisplayInfo(format!("{} is not a number: {raw:?}", instruction.opcode()))
            })?;
            *slot = Some(value);
        }

        match (width, height, dpi) {
            (Some(width), Some(height), Some(dpi)) => Ok(DisplayInfo { width, height, dpi }),
            _ => Err(TunnelError::MissingDisplayInfo(
                "width, height and DPI are required".into(),
            )),
        }
    }

    async fn collect_timezone(&self, source: &mut ClientSource) -> Result<String, TunnelError> {
        self.send(Instruction::bare("raweb-demand-timezone")).await?;
        let instruction = source
            .next_instruction()
            .await?
            .ok_or(TunnelError::MissingTimezone)?;
        if instruction.opcode() != "timezone" {
            return Err(TunnelError::UnexpectedMessage(instruction.opcode().to_string()));
        }
        Ok(instruction.arg(0).unwrap_or_default().to_string())
    }

    /// Make sure guacd is up and return its address.
    async fn await_daemon(&self) -> Result<String, TunnelError> {
        let supervisor = match &self.ctx.daemon {
            DaemonEndpoint::External(addr) => return Ok(addr.clone()),
            DaemonEndpoint::Managed(supervisor) => supervisor,
        };

        if supervisor.state().await == DaemonState::Running && supervisor.is_running().await {
            return Ok(supervisor.daemon_addr().to_string());
        }

        let progress = ProgressReporter::spawn(self.sink.clone(), supervisor.subscribe());
        let started = async {
            supervisor.request_start().await?;
            supervisor
                .wait_until_running(self.ctx.settings.ready_timeout)
                .await
        }
        .await;
        progress.stop();
        started?;

        self.send(Instruction::bare("raweb-msg-service-started"))
            .await?;
        Ok(supervisor.daemon_addr().to_string())
    }
}

#[derive(Debug, Clone, Copy)]
enum CredentialKind {
    Target,
    Gateway,
}

impl CredentialKind {
    fn demand(self) -> &'static str {
        match self {
            Self::Target => "raweb-demand-credentials",
            Self::Gateway => "raweb-demand-gateway-credentials",
        }
    }

    fn opcodes(self) -> [&'static str; 3] {
        match self {
            Self::Target => ["domain", "username", "password"],
            Self::Gateway => ["gateway-domain", "gateway-username", "gateway-password"],
        }
    }

    fn missing(self) -> TunnelError {
        match self {
            Self::Target => TunnelError::MissingCredentials,
            Self::Gateway => TunnelError::MissingGatewayCredentials,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress messages
// ---------------------------------------------------------------------------

/// Tells the browser when guacd is being installed or started.
struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    fn spawn(sink: ClientSink, mut states: watch::Receiver<DaemonState>) -> Self {
        let handle = tokio::spawn(async move {
            let mut last = None;
            loop {
                let state = *states.borrow_and_update();
                let message = match state {
                    DaemonState::Installing => Some("raweb-msg-installing-service"),
                    DaemonState::Starting => Some("raweb-msg-starting-service"),
                    _ => None,
                };
                if let Some(message) = message.filter(|m| last != Some(*m)) {
                    if sink.send(&Instruction::bare(message)).await.is_err() {
                        break;
                    }
                    last = Some(message);
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }

    fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_opcodes() {
        assert_eq!(CredentialKind::Target.demand(), "raweb-demand-credentials");
        assert_eq!(
            CredentialKind::Gateway.opcodes(),
            ["gateway-domain", "gateway-username", "gateway-password"]
        );
        assert_eq!(
            CredentialKind::Gateway.missing().code(),
            code::MISSING_GATEWAY_CREDENTIALS
        );
    }

    #[test]
    fn session_settings_defaults() {
        let s = SessionSettings::default();
        assert_eq!(s.ready_timeout, Duration::from_secs(30));
        assert_eq!(s.keepalive_interval, Duration::from_secs(5));
    }
}
