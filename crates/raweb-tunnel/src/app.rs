//! Wiring from [`Config`] to a running tunnel.

use std::sync::Arc;

use anyhow::Context;
use http::HeaderName;
use raweb_guacd::{ActiveSessionRegistry, HealthProbe, Supervisor, SupervisorConfig, WslRuntime};
use tokio_util::sync::CancellationToken;

use crate::auth::TrustedHeaderAuthenticator;
use crate::config::{Config, DaemonMethod};
use crate::negotiator::{DaemonEndpoint, SessionSettings, TunnelContext};
use crate::resolver::DirectoryResolver;
use crate::target_probe::RdpTlsProbe;
use crate::ws_server::{TunnelServer, UpgradePolicy};

/// Long-lived components built once per process.
pub struct App {
    pub config: Config,
    /// Present in managed mode only.
    pub supervisor: Option<Arc<Supervisor>>,
    pub registry: Arc<ActiveSessionRegistry>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let supervisor = match config.daemon.method {
            DaemonMethod::Managed => Some(Arc::new(build_supervisor(&config))),
            DaemonMethod::External => None,
        };
        let registry = match &supervisor {
            Some(supervisor) => ActiveSessionRegistry::with_windows(
                supervisor.clone(),
                config.daemon.idle_stop(),
                config.daemon.idle_uninstall(),
            ),
            None => ActiveSessionRegistry::without_shutdown(),
        };
        Self {
            config,
            supervisor,
            registry: Arc::new(registry),
        }
    }

    /// The supervisor, or an error naming the configured method.
    pub fn managed(&self) -> anyhow::Result<&Arc<Supervisor>> {
        self.supervisor
            .as_ref()
            .context("daemon.method is \"external\"; nothing to manage")
    }

    fn endpoint(&self) -> anyhow::Result<DaemonEndpoint> {
        match &self.supervisor {
            Some(supervisor) => Ok(DaemonEndpoint::Managed(supervisor.clone())),
            None => {
                let addr = self
                    .config
                    .daemon
                    .external_addr
                    .clone()
                    .context("daemon.external_addr is required for the external method")?;
                Ok(DaemonEndpoint::External(addr))
            }
        }
    }

    /// Shared per-session context: resolver, probe, daemon and registry.
    pub fn tunnel_context(&self) -> anyhow::Result<TunnelContext> {
        let session = &self.config.session;
        let probe = RdpTlsProbe::with_native_roots(session.tls_probe_timeout())
            .context("building TLS client configuration")?;
        Ok(TunnelContext {
            resolver: Arc::new(DirectoryResolver::new(self.config.server.resource_root.clone())),
            probe: Arc::new(probe),
            daemon: self.endpoint()?,
            registry: self.registry.clone(),
            settings: SessionSettings {
                ready_timeout: self.config.daemon.ready_timeout(),
                keepalive_interval: session.keepalive_interval(),
                daemon_connect_timeout: session.daemon_connect_timeout(),
            },
        })
    }

    /// Build the WebSocket server for the configured listen address.
    pub fn server(&self, cancel: CancellationToken) -> anyhow::Result<TunnelServer> {
        let server = &self.config.server;
        let header = HeaderName::from_bytes(server.principal_header.as_bytes())
            .with_context(|| format!("invalid principal header {:?}", server.principal_header))?;
        let policy = UpgradePolicy {
            ws_path: server.ws_path.clone(),
            auth: Arc::new(TrustedHeaderAuthenticator::new(header)),
        };
        Ok(
            TunnelServer::new(server.listen, Arc::new(self.tunnel_context()?), policy, cancel)
                .with_max_connections(server.max_connections),
        )
    }

    /// Stop the managed daemon, if any. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop().await;
        }
    }
}

fn build_supervisor(config: &Config) -> Supervisor {
    let daemon = &config.daemon;
    let probe = HealthProbe::new(daemon.managed_addr.clone()).with_timeout(daemon.probe_timeout());
    Supervisor::new(
        Arc::new(WslRuntime::new(daemon.wsl_config())),
        probe,
        SupervisorConfig {
            probe_interval: daemon.probe_interval(),
        },
    )
}
