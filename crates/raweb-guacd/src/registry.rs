//! Live guacd connections and idle-based daemon shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::debounce::Debouncer;
use crate::supervisor::IdleShutdown;

/// Default quiet period before guacd is stopped.
pub const DEFAULT_IDLE_STOP: Duration = Duration::from_secs(5 * 60);
/// Default quiet period before the runtime is unregistered.
pub const DEFAULT_IDLE_UNINSTALL: Duration = Duration::from_secs(60 * 60);

/// A connection guacd reported `ready` for.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub id: String,
    pub resource_path: String,
    pub since: Instant,
}

type Sessions = Arc<Mutex<HashMap<String, ActiveConnection>>>;

/// Set of live connections. Emptying it arms the idle stop/uninstall timers.
pub struct ActiveSessionRegistry {
    sessions: Sessions,
    /// `None` when guacd is not ours to stop (external daemon).
    target: Option<Arc<dyn IdleShutdown>>,
    stop_debouncer: Debouncer,
    uninstall_debouncer: Debouncer,
    stop_after: Duration,
    uninstall_after: Duration,
}

impl ActiveSessionRegistry {
    pub fn new(target: Arc<dyn IdleShutdown>) -> Self {
        Self::with_windows(target, DEFAULT_IDLE_STOP, DEFAULT_IDLE_UNINSTALL)
    }

    pub fn with_windows(
        target: Arc<dyn IdleShutdown>,
        stop_after: Duration,
        uninstall_after: Duration,
    ) -> Self {
        Self::build(Some(target), stop_after, uninstall_after)
    }

    /// Registry that only tracks connections and never shuts anything down.
    pub fn without_shutdown() -> Self {
        Self::build(None, DEFAULT_IDLE_STOP, DEFAULT_IDLE_UNINSTALL)
    }

    fn build(
        target: Option<Arc<dyn IdleShutdown>>,
        stop_after: Duration,
        uninstall_after: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            target,
            stop_debouncer: Debouncer::new(),
            uninstall_debouncer: Debouncer::new(),
            stop_after,
            uninstall_after,
        }
    }

    pub async fn add(&self, id: impl Into<String>, resource_path: impl Into<String>) {
        let id = id.into();
        let connection = ActiveConnection {
            id: id.clone(),
            resource_path: resource_path.into(),
            since: Instant::now(),
        };
        let count = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(id.clone(), connection);
            sessions.len()
        };
        self.stop_debouncer.cancel();
        self.uninstall_debouncer.cancel();
        tracing::debug!(connection = %id, active = count, "connection registered");
    }

    /// Remove `id`. Returns whether it was present.
    pub async fn remove(&self, id: &str) -> bool {
        let (removed, now_empty) = {
            let mut sessions = self.sessions.lock().await;
            let removed = sessions.remove(id);
            (removed, sessions.is_empty())
        };
        let Some(connection) = removed else {
            return false;
        };
        tracing::debug!(
            connection = %id,
            resource = %connection.resource_path,
            duration = ?connection.since.elapsed(),
            "connection removed"
        );
        if now_empty {
            self.arm_idle_timers();
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ActiveConnection> {
        self.sessions.lock().await.values().cloned().collect()
    }

    fn arm_idle_timers(&self) {
        let Some(target) = &self.target else {
            return;
        };
        tracing::info!(
            stop_after = ?self.stop_after,
            uninstall_after = ?self.uninstall_after,
            "no active connections; idle timers armed"
        );

        let sessions = Arc::clone(&self.sessions);
        let stop_target = Arc::clone(target);
        self.stop_debouncer.schedule(self.stop_after, move || async move {
            if sessions.lock().await.is_empty() {
                stop_target.stop_idle().await;
            }
        });

        let sessions = Arc::clone(&self.sessions);
        let target = Arc::clone(target);
        self.uninstall_debouncer
            .schedule(self.uninstall_after, move || async move {
                if sessions.lock().await.is_empty() {
                    target.uninstall_idle().await;
                }
            });
    }
}
