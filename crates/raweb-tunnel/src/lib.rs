//! WebSocket tunnel between browsers and guacd for RAWeb resources.

pub mod app;
pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod negotiator;
pub mod relay;
pub mod resolver;
pub mod target_probe;
pub mod ws_server;

pub use app::App;
pub use config::Config;
pub use error::TunnelError;
pub use negotiator::{DaemonEndpoint, SessionRequest, SessionSettings, TunnelContext};
pub use ws_server::{TunnelServer, UpgradePolicy};
