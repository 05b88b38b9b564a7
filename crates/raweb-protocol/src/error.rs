//! Error types for protocol framing, descriptors and parameter mapping.

use thiserror::Error;

/// Framing errors. Running out of input is not one of them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected ',' or ';' at byte {offset}, found {byte:#04x}")]
    UnexpectedTerminator { offset: usize, byte: u8 },

    #[error("invalid UTF-8 in instruction content at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("{pending} bytes buffered without a complete instruction (max {max})")]
    Overflow { pending: usize, max: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("connection descriptor has no address")]
    MissingAddress,

    #[error("invalid port in address '{0}'")]
    InvalidPort(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("RemoteApp mode requires a program")]
    RemoteAppProgramMissing,

    #[error("RemoteApp mode does not allow a file to open")]
    RemoteAppFileNotAllowed,

    #[error("RemoteApp command line must be expanded on the remote computer")]
    RemoteAppExpansionNotRemote,

    #[error("packaged app launcher and command line do not agree (program '{program}', command line '{cmdline}')")]
    PackagedAppMismatch { program: String, cmdline: String },

    #[error("expected 'args' instruction, got '{0}'")]
    NotArgs(String),

    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
}
