//! Session failures and the numeric codes sent to the browser.

use raweb_guacd::SupervisorError;
use raweb_protocol::{CodecError, DescriptorError, MappingError};
use thiserror::Error;

/// Codes carried by `error` and `raweb-console-error` instructions.
pub mod code {
    pub const GENERIC: u32 = 1000;

    pub const MISSING_ADDRESS: u32 = 1100;
    pub const REMOTE_APP_PROGRAM_MISSING: u32 = 1101;
    pub const REMOTE_APP_FILE_FORBIDDEN: u32 = 1102;
    pub const REMOTE_APP_EXPANSION_NOT_REMOTE: u32 = 1103;
    pub const PACKAGED_APP_MISMATCH: u32 = 1104;
    pub const INVALID_DESCRIPTOR: u32 = 1105;

    pub const TARGET_UNREACHABLE: u32 = 1200;
    pub const TARGET_REFUSED: u32 = 1201;
    pub const TARGET_TIMEOUT: u32 = 1202;
    pub const UNTRUSTED_CERTIFICATE: u32 = 1203;
    pub const HOSTNAME_RESOLUTION: u32 = 1204;

    pub const MISSING_CREDENTIALS: u32 = 1300;
    pub const MISSING_DISPLAY_INFO: u32 = 1301;
    pub const MISSING_TIMEZONE: u32 = 1302;
    pub const MISSING_GATEWAY_CREDENTIALS: u32 = 1303;
    pub const UNEXPECTED_CLIENT_MESSAGE: u32 = 1304;

    pub const PLATFORM_MISSING: u32 = 1400;
    pub const COMPONENT_MISSING: u32 = 1401;
    pub const INSTALL_FAILED: u32 = 1402;
    pub const START_TIMEOUT: u32 = 1403;
    pub const STOP_IN_PROGRESS: u32 = 1404;
    pub const RUNTIME_ERROR: u32 = 1405;
    pub const DAEMON_FAULTED: u32 = 1406;
    pub const DAEMON_LAUNCH_FAILED: u32 = 1407;
    pub const DAEMON_START_CANCELLED: u32 = 1408;

    pub const PROTOCOL_MISMATCH: u32 = 1500;
    pub const DAEMON_HANDSHAKE: u32 = 1501;

    pub const DAEMON_UNREACHABLE: u32 = 1600;
    pub const DAEMON_REFUSED: u32 = 1601;
    pub const DAEMON_SOCKET: u32 = 1602;
}

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The resource resolver declined; `status` is forwarded as the code.
    #[error("{message}")]
    Resolver { status: u16, message: String },

    #[error("invalid connection descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("cannot reach {addr}: {detail}")]
    TargetUnreachable { addr: String, detail: String },

    #[error("{addr} refused the connection")]
    TargetRefused { addr: String },

    #[error("timed out connecting to {addr}")]
    TargetTimeout { addr: String },

    #[error("certificate of {addr} is not trusted: {detail}")]
    UntrustedCertificate { addr: String, detail: String },

    #[error("username and password are required")]
    MissingCredentials,

    #[error("gateway username and password are required")]
    MissingGatewayCredentials,

    #[error("display information missing or invalid: {0}")]
    MissingDisplayInfo(String),

    #[error("timezone was not provided")]
    MissingTimezone,

    #[error("unexpected client instruction: {0}")]
    UnexpectedMessage(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("guacd handshake failed: {0}")]
    DaemonHandshake(String),

    #[error("cannot reach guacd at {addr}: {detail}")]
    DaemonUnreachable { addr: String, detail: String },

    #[error("guacd at {addr} refused the connection")]
    DaemonRefused { addr: String },

    #[error("guacd connection failed: {0}")]
    DaemonSocket(std::io::Error),

    #[error("client closed the connection")]
    ClientClosed,

    #[error("malformed instruction: {0}")]
    Codec(#[from] CodecError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TunnelError {
    /// Stable code sent to the browser.
    pub fn code(&self) -> u32 {
        match self {
            Self::Resolver { status, .. } => u32::from(*status),
            Self::Descriptor(DescriptorError::MissingAddress) => code::MISSING_ADDRESS,
            Self::Descriptor(_) => code::INVALID_DESCRIPTOR,
            Self::Mapping(e) => match e {
                MappingError::RemoteAppProgramMissing => code::REMOTE_APP_PROGRAM_MISSING,
                MappingError::RemoteAppFileNotAllowed => code::REMOTE_APP_FILE_FORBIDDEN,
                MappingError::RemoteAppExpansionNotRemote => code::REMOTE_APP_EXPANSION_NOT_REMOTE,
                MappingError::PackagedAppMismatch { .. } => code::PACKAGED_APP_MISMATCH,
                MappingError::UnsupportedVersion(_) => code::PROTOCOL_MISMATCH,
                MappingError::NotArgs(_) => code::DAEMON_HANDSHAKE,
            },
            Self::TargetUnreachable { .. } => code::TARGET_UNREACHABLE,
            Self::TargetRefused { .. } => code::TARGET_REFUSED,
            Self::TargetTimeout { .. } => code::TARGET_TIMEOUT,
            Self::UntrustedCertificate { .. } => code::UNTRUSTED_CERTIFICATE,
            Self::MissingCredentials => code::MISSING_CREDENTIALS,
            Self::MissingGatewayCredentials => code::MISSING_GATEWAY_CREDENTIALS,
            Self::MissingDisplayInfo(_) => code::MISSING_DISPLAY_INFO,
            Self::MissingTimezone => code::MISSING_TIMEZONE,
            Self::UnexpectedMessage(_) => code::UNEXPECTED_CLIENT_MESSAGE,
            Self::Supervisor(e) => supervisor_code(e),
            Self::DaemonHandshake(_) => code::DAEMON_HANDSHAKE,
            Self::DaemonUnreachable { .. } => code::DAEMON_UNREACHABLE,
            Self::DaemonRefused { .. } => code::DAEMON_REFUSED,
            Self::DaemonSocket(_) => code::DAEMON_SOCKET,
            Self::ClientClosed | Self::Codec(_) | Self::WebSocket(_) => code::GENERIC,
        }
    }

    /// Message shown to the user. Internal failures stay generic.
    pub fn client_message(&self) -> String {
        match self.code() {
            code::GENERIC => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

fn supervisor_code(e: &SupervisorError) -> u32 {
    match e {
        SupervisorError::PlatformMissing(_) => code::PLATFORM_MISSING,
        SupervisorError::ComponentMissing(_) => code::COMPONENT_MISSING,
        SupervisorError::InstallFailed(_) => code::INSTALL_FAILED,
        SupervisorError::StartTimeout(_) => code::START_TIMEOUT,
        SupervisorError::StopInProgress => code::STOP_IN_PROGRESS,
        SupervisorError::Runtime { .. } => code::RUNTIME_ERROR,
        SupervisorError::LaunchFailed(_) => code::DAEMON_LAUNCH_FAILED,
        SupervisorError::Cancelled | SupervisorError::NotStarted => code::DAEMON_START_CANCELLED,
        SupervisorError::DaemonExited(_) | SupervisorError::Faulted(_) => code::DAEMON_FAULTED,
    }
}
