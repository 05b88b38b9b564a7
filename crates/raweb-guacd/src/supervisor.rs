//! guacd lifecycle supervisor.
//!
//! One [`Supervisor`] per process owns the runtime instance hosting guacd.
//! Every state change happens under a single mutex. Each start creates a
//! new *generation*: a numbered background task with its own cancellation
//! token and its own readiness channel. A background task only updates
//! shared state while its generation number is still current, so a task
//! superseded by `stop()` + `request_start()` cannot mark the newer attempt
//! ready or faulted.
//!
//! ```text
//! NotInstalled ──install──▶ Installing ──▶ Stopped
//! Stopped ──start──▶ Starting ──probe ok──▶ Running
//!                        └──────fault──────▶ Faulted
//! Running/Starting/Faulted ──stop──▶ Stopping ──▶ Stopped
//! Stopped ──uninstall──▶ NotInstalled
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;
use crate::health::HealthProbe;
use crate::runtime::{ImageIdentity, RuntimeHost};

/// Default interval between health probes while starting.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// How long `stop()` waits for a generation task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

// ─── State ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotInstalled,
    Installing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Faulted,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotInstalled => "not-installed",
            Self::Installing => "installing",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Value of a generation's readiness channel.
#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready,
    Failed(SupervisorError),
}

struct Generation {
    id: u64,
    instance: String,
    cancel: CancellationToken,
    ready: watch::Receiver<Readiness>,
    task: JoinHandle<()>,
}

struct Inner {
    state: DaemonState,
    /// Last generation number handed out.
    generation: u64,
    current: Option<Generation>,
}

/// State reachable from generation tasks.
struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<DaemonState>,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: DaemonState) {
        if inner.state != state {
            tracing::debug!(from = %inner.state, to = %state, "daemon state change");
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Apply `state` only if generation `id` is still current.
    async fn transition(&self, id: u64, state: DaemonState) -> bool {
        let mut inner = self.inner.lock().await;
        let current = inner.current.as_ref().map(|g| g.id) == Some(id);
        if current && inner.state != DaemonState::Stopping {
            self.set_state(&mut inner, state);
            true
        } else {
            tracing::debug!(generation = id, state = %state, "ignoring signal from superseded generation");
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────

pub struct Supervisor {
    runtime: Arc<dyn RuntimeHost>,
    probe: HealthProbe,
    config: SupervisorConfig,
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn RuntimeHost>, probe: HealthProbe, config: SupervisorConfig) -> Self {
        let (state_tx, _) = watch::channel(DaemonState::NotInstalled);
        Self {
            runtime,
            probe,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: DaemonState::NotInstalled,
                    generation: 0,
                    current: None,
                }),
                state_tx,
            }),
        }
    }

    pub async fn state(&self) -> DaemonState {
        self.shared.inner.lock().await.state
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.shared.state_tx.subscribe()
    }

    /// Address guacd listens on.
    pub fn daemon_addr(&self) -> &str {
        self.probe.addr()
    }

    /// Current generation task alive and guacd reachable.
    pub async fn is_running(&self) -> bool {
        let alive = {
            let inner = self.shared.inner.lock().await;
            inner.current.as_ref().is_some_and(|g| !g.task.is_finished())
        };
        alive && self.probe.check().await
    }

    /// Make sure a generation is starting or running. Installs the runtime
    /// image first if needed. Returns without waiting for readiness.
    pub async fn request_start(&self) -> Result<(), SupervisorError> {
        let mut inner = self.shared.inner.lock().await;

        match inner.state {
            DaemonState::Stopping => return Err(SupervisorError::StopInProgress),
            DaemonState::Starting | DaemonState::Running
                if inner.current.as_ref().is_some_and(|g| !g.task.is_finished()) =>
            {
                return Ok(());
            }
            _ => {}
        }

        self.check_prerequisites().await?;
        let identity = self.runtime.image_identity().await?;
        self.ensure_installed(&mut inner, &identity).await?;

        // A faulted generation may still be registered; retire it.
        if let Some(old) = inner.current.take() {
            old.cancel.cancel();
            old.task.abort();
        }

        inner.generation += 1;
        let id = inner.generation;
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        self.shared.set_state(&mut inner, DaemonState::Starting);

        let run = GenerationRun {
            id,
            instance: identity.instance.clone(),
            runtime: Arc::clone(&self.runtime),
            probe: self.probe.clone(),
            interval: self.config.probe_interval,
            shared: Arc::clone(&self.shared),
            cancel: cancel.clone(),
            ready_tx,
        };
        let task = tokio::spawn(run.run());

        tracing::info!(generation = id, instance = %identity.instance, "daemon start requested");
        inner.current = Some(Generation {
            id,
            instance: identity.instance,
            cancel,
            ready: ready_rx,
            task,
        });
        Ok(())
    }

    /// Wait for the current generation to become ready.
    ///
    /// On timeout the generation is stopped. A background failure is
    /// returned wrapped in [`SupervisorError::Faulted`].
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let (id, mut ready) = {
            let inner = self.shared.inner.lock().await;
            match &inner.current {
                Some(g) => (g.id, g.ready.clone()),
                None => return Err(SupervisorError::NotStarted),
            }
        };

        let outcome = tokio::time::timeout(timeout, async {
            ready
                .wait_for(|r| !matches!(r, Readiness::Pending))
                .await
                .map(|r| r.clone())
        })
        .await;

        match outcome {
            Err(_) => {
                tracing::warn!(generation = id, ?timeout, "daemon did not become ready in time");
                self.stop_generation(Some(id)).await;
                Err(SupervisorError::StartTimeout(timeout))
            }
            Ok(Err(_)) => Err(SupervisorError::Cancelled),
            Ok(Ok(r)) => match r {
                Readiness::Ready => Ok(()),
                Readiness::Failed(e) => Err(SupervisorError::Faulted(Arc::new(e))),
                Readiness::Pending => Err(SupervisorError::Cancelled),
            },
        }
    }

    /// Cancel the current generation and terminate the runtime instance.
    pub async fn stop(&self) {
        self.stop_generation(None).await;
    }

    /// Stop guacd even when this process did not start it: cancels any local
    /// generation, then terminates the instance for the current image.
    pub async fn terminate_instance(&self) -> Result<(), SupervisorError> {
        self.stop().await;
        let identity = self.runtime.image_identity().await?;
        self.runtime.terminate(&identity.instance).await?;
        Ok(())
    }

    /// Register the runtime image if it is not registered yet.
    pub async fn install_runtime(&self) -> Result<(), SupervisorError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == DaemonState::Stopping {
            return Err(SupervisorError::StopInProgress);
        }
        self.check_prerequisites().await?;
        let identity = self.runtime.image_identity().await?;
        self.ensure_installed(&mut inner, &identity).await
    }

    /// Stop guacd and deregister every instance carrying our prefix,
    /// current and stale versions alike.
    pub async fn uninstall_runtime(&self) -> Result<(), SupervisorError> {
        self.stop().await;

        let mut inner = self.shared.inner.lock().await;
        if inner.current.is_some() {
            tracing::info!("daemon restarted before uninstall; keeping runtime");
            return Ok(());
        }

        let prefix = self.runtime.instance_prefix().to_string();
        let installed = self.runtime.installed_instances().await?;
        for name in installed.iter().filter(|n| owned_by(n, &prefix)) {
            tracing::info!(instance = %name, "unregistering guacd runtime");
            self.runtime.uninstall(name).await?;
        }
        self.shared.set_state(&mut inner, DaemonState::NotInstalled);
        Ok(())
    }

    // ─── internals ───────────────────────────────────────────────

    async fn check_prerequisites(&self) -> Result<(), SupervisorError> {
        self.runtime.check_platform().await?;
        self.runtime.check_components().await?;
        Ok(())
    }

    async fn ensure_installed(
        &self,
        inner: &mut Inner,
        identity: &ImageIdentity,
    ) -> Result<(), SupervisorError> {
        let installed = self.runtime.installed_instances().await?;
        if installed.iter().any(|n| *n == identity.instance) {
            if inner.state == DaemonState::NotInstalled {
                self.shared.set_state(inner, DaemonState::Stopped);
            }
            return Ok(());
        }

        self.shared.set_state(inner, DaemonState::Installing);

        let prefix = self.runtime.instance_prefix();
        for stale in installed
            .iter()
            .filter(|n| owned_by(n, prefix) && **n != identity.instance)
        {
            tracing::info!(instance = %stale, "pruning stale guacd runtime");
            if let Err(e) = self.runtime.uninstall(stale).await {
                tracing::warn!(instance = %stale, error = %e, "failed to prune stale runtime");
            }
        }

        match self.runtime.install(identity).await {
            Ok(()) => {
                tracing::info!(instance = %identity.instance, "guacd runtime installed");
                self.shared.set_state(inner, DaemonState::Stopped);
                Ok(())
            }
            Err(e) => {
                tracing::error!(instance = %identity.instance, error = %e, "guacd runtime install failed");
                self.shared.set_state(inner, DaemonState::NotInstalled);
                Err(SupervisorError::install(e))
            }
        }
    }

    /// Stop the current generation, or only generation `only` if given.
    async fn stop_generation(&self, only: Option<u64>) {
        let generation = {
            let mut inner = self.shared.inner.lock().await;
            let matches = match (&inner.current, only) {
                (Some(g), Some(id)) => g.id == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return;
            }
            let Some(generation) = inner.current.take() else {
                return;
            };
            generation.cancel.cancel();
            self.shared.set_state(&mut inner, DaemonState::Stopping);
            generation
        };

        let Generation {
            id,
            instance,
            mut task,
            ..
        } = generation;
        tracing::info!(generation = id, "stopping daemon");

        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            tracing::warn!(generation = id, "generation task did not exit; aborting");
            task.abort();
        }
        if let Err(e) = self.runtime.terminate(&instance).await {
            tracing::warn!(instance = %instance, error = %e, "failed to terminate runtime instance");
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.state == DaemonState::Stopping && inner.current.is_none() {
            self.shared.set_state(&mut inner, DaemonState::Stopped);
        }
    }
}

fn owned_by(instance: &str, prefix: &str) -> bool {
    instance
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-'))
}

// ─── Generation task ─────────────────────────────────────────────

struct GenerationRun {
    id: u64,
    instance: String,
    runtime: Arc<dyn RuntimeHost>,
    probe: HealthProbe,
    interval: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    ready_tx: watch::Sender<Readiness>,
}

impl GenerationRun {
    async fn run(self) {
        if let Err(e) = self.drive().await {
            tracing::error!(generation = self.id, error = %e, "daemon generation failed");
            self.shared.transition(self.id, DaemonState::Faulted).await;
            self.ready_tx.send_replace(Readiness::Failed(e));
        }
    }

    async fn drive(&self) -> Result<(), SupervisorError> {
        // A previous process may have left the instance running.
        if let Err(e) = self.runtime.terminate(&self.instance).await {
            tracing::debug!(generation = self.id, error = %e, "no stale instance to terminate");
        }

        let mut child = self
            .runtime
            .launch_daemon(&self.instance)
            .await
            .map_err(|e| SupervisorError::LaunchFailed(e.to_string()))?;
        self.forward_output(&mut child);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    shutdown_child(&mut child, self.id).await;
                    return Ok(());
                }
                status = child.wait() => {
                    return Err(SupervisorError::DaemonExited(describe_exit(status)));
                }
                _ = ticker.tick() => {
                    if self.probe.check().await {
                        break;
                    }
                }
            }
        }

        if self.shared.transition(self.id, DaemonState::Running).await {
            tracing::info!(generation = self.id, addr = %self.probe.addr(), "guacd is ready");
            self.ready_tx.send_replace(Readiness::Ready);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                shutdown_child(&mut child, self.id).await;
                Ok(())
            }
            status = child.wait() => Err(SupervisorError::DaemonExited(describe_exit(status))),
        }
    }

    fn forward_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, self.id, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, self.id, true));
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, generation: u64, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => tracing::warn!(target: "guacd", generation, "{line}"),
            Ok(Some(line)) => tracing::info!(target: "guacd", generation, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(generation, error = %e, "daemon output stream closed");
                break;
            }
        }
    }
}

async fn shutdown_child(child: &mut Child, generation: u64) {
    if let Err(e) = child.kill().await {
        tracing::debug!(generation, error = %e, "daemon process already gone");
    }
}

fn describe_exit(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(s) => s.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

// ─── Idle shutdown hook ──────────────────────────────────────────

/// What the session registry calls once the last session has gone idle.
pub trait IdleShutdown: Send + Sync + 'static {
    fn stop_idle(&self) -> BoxFuture<'_, ()>;
    fn uninstall_idle(&self) -> BoxFuture<'_, ()>;
}

impl IdleShutdown for Supervisor {
    fn stop_idle(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!("no active sessions; stopping guacd");
            self.stop().await;
        })
    }

    fn uninstall_idle(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!("no active sessions; uninstalling guacd runtime");
            if let Err(e) = self.uninstall_runtime().await {
                tracing::warn!(error = %e, "idle uninstall failed");
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    /// Runtime that "launches" guacd as a sleeping shell process.
    #[derive(Default)]
    struct FakeRuntime {
        installed: StdMutex<Vec<String>>,
        launches: AtomicUsize,
        installs: AtomicUsize,
        platform_missing: AtomicBool,
        components_missing: AtomicBool,
        fail_launch: AtomicBool,
        fail_install: AtomicBool,
    }

    impl FakeRuntime {
        fn identity() -> ImageIdentity {
            ImageIdentity::new("guacd.tar".into(), "raweb-guacd", 10, 20)
        }
    }

    impl RuntimeHost for FakeRuntime {
        fn instance_prefix(&self) -> &str {
            "raweb-guacd"
        }

        fn check_platform(&self) -> BoxFuture<'_, Result<(), RuntimeError>> {
            Box::pin(async move {
                if self.platform_missing.load(Ordering::SeqCst) {
                    Err(RuntimeError::PlatformMissing("wsl.exe not found".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn check_components(&self) -> BoxFuture<'_, Result<(), RuntimeError>> {
            Box::pin(async move {
                if self.components_missing.load(Ordering::SeqCst) {
                    Err(RuntimeError::ComponentMissing("VirtualMachinePlatform".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn image_identity(&self) -> BoxFuture<'_, Result<ImageIdentity, RuntimeError>> {
            Box::pin(async { Ok(Self::identity()) })
        }

        fn installed_instances(&self) -> BoxFuture<'_, Result<Vec<String>, RuntimeError>> {
            Box::pin(async move { Ok(self.installed.lock().unwrap().clone()) })
        }

        fn install<'a>(&'a self, identity: &'a ImageIdentity) -> BoxFuture<'a, Result<(), RuntimeError>> {
            Box::pin(async move {
                self.installs.fetch_add(1, Ordering::SeqCst);
                if self.fail_install.load(Ordering::SeqCst) {
                    return Err(RuntimeError::Command {
                        code: 0x8000_4005,
                        detail: "import failed".into(),
                    });
                }
                self.installed.lock().unwrap().push(identity.instance.clone());
                Ok(())
            })
        }

        fn uninstall<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
            Box::pin(async move {
                self.installed.lock().unwrap().retain(|n| n != instance);
                Ok(())
            })
        }

        fn terminate<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
            Box::pin(async { Ok(()) })
        }

        fn launch_daemon<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, Result<Child, RuntimeError>> {
            Box::pin(async move {
                self.launches.fetch_add(1, Ordering::SeqCst);
                if self.fail_launch.load(Ordering::SeqCst) {
                    return Err(RuntimeError::Command {
                        code: 1,
                        detail: "no such distribution".into(),
                    });
                }
                let child = tokio::process::Command::new("sh")
                    .args(["-c", "echo guacd starting; sleep 60"])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                Ok(child)
            })
        }
    }

    fn supervisor(runtime: Arc<FakeRuntime>, addr: String) -> Supervisor {
        Supervisor::new(
            runtime,
            HealthProbe::new(addr).with_timeout(Duration::from_millis(100)),
            SupervisorConfig {
                probe_interval: Duration::from_millis(20),
            },
        )
    }

    async fn closed_addr() -> String {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap().to_string();
        drop(l);
        addr
    }

    #[tokio::test]
    async fn start_installs_then_becomes_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rt = Arc::new(FakeRuntime::default());
        let sup = supervisor(Arc::clone(&rt), listener.local_addr().unwrap().to_string());

        assert_eq!(sup.state().await, DaemonState::NotInstalled);
        sup.request_start().await.unwrap();
        sup.wait_until_running(Duration::from_secs(5)).await.unwrap();

        assert_eq!(sup.state().await, DaemonState::Running);
        assert!(sup.is_running().await);
        assert_eq!(rt.installs.load(Ordering::SeqCst), 1);

        sup.stop().await;
        assert_eq!(sup.state().await, DaemonState::Stopped);
        assert!(!sup.is_running().await);
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_generation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rt = Arc::new(FakeRuntime::default());
        let sup = Arc::new(supervisor(Arc::clone(&rt), listener.local_addr().unwrap().to_string()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sup = Arc::clone(&sup);
            handles.push(tokio::spawn(async move {
                sup.request_start().await?;
                sup.wait_until_running(Duration::from_secs(5)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        sup.request_start().await.unwrap();

        assert_eq!(rt.launches.load(Ordering::SeqCst), 1);
        assert_eq!(rt.installs.load(Ordering::SeqCst), 1);
        sup.stop().await;
    }

    #[tokio::test]
    async fn wait_times_out_when_probe_never_succeeds() {
        let rt = Arc::new(FakeRuntime::default());
        let sup = supervisor(Arc::clone(&rt), closed_addr().await);

        sup.request_start().await.unwrap();
        let err = sup
            .wait_until_running(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartTimeout(_)), "got {err:?}");
        // The timed-out generation was stopped.
        assert_eq!(sup.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn launch_failure_is_wrapped_fault() {
        let rt = Arc::new(FakeRuntime::default());
        rt.fail_launch.store(true, Ordering::SeqCst);
        let sup = supervisor(Arc::clone(&rt), closed_addr().await);

        sup.request_start().await.unwrap();
        let err = sup
            .wait_until_running(Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            SupervisorError::Faulted(inner) => {
                assert!(matches!(*inner, SupervisorError::LaunchFailed(_)), "got {inner:?}");
            }
            other => panic!("expected Faulted, got {other:?}"),
        }
        assert_eq!(sup.state().await, DaemonState::Faulted);

        // A faulted supervisor can be started again.
        rt.fail_launch.store(false, Ordering::SeqCst);
        let listener = TcpListener::bind(sup.daemon_addr()).await.unwrap();
        sup.request_start().await.unwrap();
        sup.wait_until_running(Duration::from_secs(5)).await.unwrap();
        drop(listener);
        sup.stop().await;
    }

    #[tokio::test]
    async fn missing_prerequisites_are_distinct() {
        let rt = Arc::new(FakeRuntime::default());
        rt.platform_missing.store(true, Ordering::SeqCst);
        let sup = supervisor(Arc::clone(&rt), closed_addr().await);
        assert!(matches!(
            sup.request_start().await,
            Err(SupervisorError::PlatformMissing(_))
        ));

        rt.platform_missing.store(false, Ordering::SeqCst);
        rt.components_missing.store(true, Ordering::SeqCst);
        assert!(matches!(
            sup.request_start().await,
            Err(SupervisorError::ComponentMissing(_))
        ));
        assert_eq!(rt.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn install_failure_leaves_not_installed() {
        let rt = Arc::new(FakeRuntime::default());
        rt.fail_install.store(true, Ordering::SeqCst);
        let sup = supervisor(Arc::clone(&rt), closed_addr().await);

        let err = sup.request_start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::InstallFailed(_)), "got {err:?}");
        assert_eq!(sup.state().await, DaemonState::NotInstalled);
    }

    #[tokio::test]
    async fn install_prunes_stale_versions_and_uninstall_removes_all() {
        let rt = Arc::new(FakeRuntime::default());
        rt.installed.lock().unwrap().extend([
            "Ubuntu".to_string(),
            "raweb-guacd-000000000000".to_string(),
        ]);
        let sup = supervisor(Arc::clone(&rt), closed_addr().await);

        sup.install_runtime().await.unwrap();
        let installed = rt.installed.lock().unwrap().clone();
        assert_eq!(
            installed,
            vec!["Ubuntu".to_string(), FakeRuntime::identity().instance]
        );
        assert_eq!(sup.state().await, DaemonState::Stopped);

        // Already installed: no second import.
        sup.install_runtime().await.unwrap();
        assert_eq!(rt.installs.load(Ordering::SeqCst), 1);

        sup.uninstall_runtime().await.unwrap();
        assert_eq!(*rt.installed.lock().unwrap(), vec!["Ubuntu".to_string()]);
        assert_eq!(sup.state().await, DaemonState::NotInstalled);
    }

    #[tokio::test]
    async fn stale_generation_cannot_mark_new_one_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rt = Arc::new(FakeRuntime::default());
        let sup = supervisor(Arc::clone(&rt), listener.local_addr().unwrap().to_string());

        sup.request_start().await.unwrap();
        sup.stop().await;
        // Generation 1 is gone; a transition tagged with it is ignored.
        assert!(!sup.shared.transition(1, DaemonState::Running).await);
        assert_eq!(sup.state().await, DaemonState::Stopped);

        sup.request_start().await.unwrap();
        assert!(!sup.shared.transition(1, DaemonState::Faulted).await);
        sup.wait_until_running(Duration::from_secs(5)).await.unwrap();
        assert_eq!(rt.launches.load(Ordering::SeqCst), 2);
        sup.stop().await;
    }

    #[tokio::test]
    async fn wait_without_start_is_not_started() {
        let rt = Arc::new(FakeRuntime::default());
        let sup = supervisor(rt, closed_addr().await);
        assert!(matches!(
            sup.wait_until_running(Duration::from_millis(10)).await,
            Err(SupervisorError::NotStarted)
        ));
    }

    #[test]
    fn ownership_requires_dash_after_prefix() {
        assert!(owned_by("raweb-guacd-abc", "raweb-guacd"));
        assert!(!owned_by("raweb-guacdx", "raweb-guacd"));
        assert!(!owned_by("Ubuntu", "raweb-guacd"));
    }
}
