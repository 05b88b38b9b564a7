//! guacd lifecycle: the runtime hosting guacd, health probing, the
//! process-wide supervisor and idle-based shutdown.

pub mod debounce;
pub mod error;
pub mod health;
pub mod registry;
pub mod runtime;
pub mod supervisor;

pub use debounce::Debouncer;
pub use error::{RuntimeError, SupervisorError};
pub use health::HealthProbe;
pub use registry::{ActiveConnection, ActiveSessionRegistry};
pub use runtime::{ImageIdentity, RuntimeHost, WslConfig, WslRuntime};
pub use supervisor::{DaemonState, IdleShutdown, Supervisor, SupervisorConfig};
