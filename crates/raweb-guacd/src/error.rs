//! Error types for the runtime host and the daemon supervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`RuntimeHost`](crate::runtime::RuntimeHost).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("virtualization platform not available: {0}")]
    PlatformMissing(String),

    #[error("optional component not enabled: {0}")]
    ComponentMissing(String),

    #[error("runtime image not found at {}", .0.display())]
    ImageMissing(PathBuf),

    #[error("runtime command failed (code {code:#x}): {detail}")]
    Command { code: i64, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Raw code for diagnostics: the platform error code, exit status or OS error.
    pub fn raw_code(&self) -> i64 {
        match self {
            Self::Command { code, .. } => *code,
            Self::Io(e) => e.raw_os_error().map(i64::from).unwrap_or(-1),
            _ => -1,
        }
    }
}

/// Failures surfaced by the [`Supervisor`](crate::supervisor::Supervisor).
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("virtualization platform not available: {0}")]
    PlatformMissing(String),

    #[error("optional component not enabled: {0}")]
    ComponentMissing(String),

    #[error("failed to install the daemon runtime: {0}")]
    InstallFailed(String),

    #[error("daemon did not become ready within {0:?}")]
    StartTimeout(Duration),

    #[error("daemon is stopping; try again shortly")]
    StopInProgress,

    #[error("runtime error (code {code:#x}): {detail}")]
    Runtime { code: i64, detail: String },

    #[error("failed to launch the daemon: {0}")]
    LaunchFailed(String),

    #[error("daemon exited: {0}")]
    DaemonExited(String),

    #[error("daemon start was cancelled")]
    Cancelled,

    #[error("daemon has not been started")]
    NotStarted,

    #[error("daemon failed: {0}")]
    Faulted(Arc<SupervisorError>),
}

impl From<RuntimeError> for SupervisorError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::PlatformMissing(s) => Self::PlatformMissing(s),
            RuntimeError::ComponentMissing(s) => Self::ComponentMissing(s),
            other => Self::Runtime {
                code: other.raw_code(),
                detail: other.to_string(),
            },
        }
    }
}

impl SupervisorError {
    /// Install-path conversion: prerequisite failures keep their identity,
    /// everything else is an install failure.
    pub(crate) fn install(e: RuntimeError) -> Self {
        match e {
            RuntimeError::PlatformMissing(_) | RuntimeError::ComponentMissing(_) => e.into(),
            other => Self::InstallFailed(other.to_string()),
        }
    }
}
