//! Error type shared by all the units of a flashing run.
//!
//! Every fatal condition carries enough context to tell which marker was
//! missing or which value did not match. [`Error::kind`] groups the variants
//! into the broad classes the [`Coordinator`](crate::Coordinator) reasons
//! about when it decides how a run ended.

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::boot_driver::BootState;

// =============================================================================
// Public Interface
// =============================================================================

/// Broad classes of failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// The device does not speak the dialogue we expect: wrong banner, wrong
    /// boot environment, rejected login or image. Never retried.
    ProtocolMismatch,
    /// The network boot kept failing after all the allowed retries.
    TransientBootFailure,
    /// The remote upgrade did not report that it started.
    RemoteUpgradeFailure,
    /// The operator interrupted the run.
    UserCancellation,
    /// A local resource (serial port, socket, file, SSH transport) could not
    /// be used.
    ResourceFailure,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("U-Boot login failed: expected prompt `{expected}` but read `{found}`")]
    LoginFailed { expected: String, found: String },

    #[error(
        "unexpected value for U-Boot variable `{key}`: found \"{found}\", expected \"{expected}\""
    )]
    UnexpectedBootConfig {
        key: String,
        found: String,
        expected: String,
    },

    #[error("saveenv did not confirm `{marker}`, console said: {output}")]
    PersistFailed { marker: String, output: String },

    #[error("U-Boot rejected the network boot image: `{marker}`")]
    ImageRejected { marker: String },

    #[error("TFTP boot failed after {retries} retries")]
    TftpRetriesExceeded { retries: u32 },

    #[error("serial session closed while in state {state:?}")]
    SessionClosed { state: BootState },

    #[error("invalid address `{input}`: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("invalid network plan: {0}")]
    InvalidNetworkPlan(String),

    #[error("could not bind the TFTP server to {addr}: {source}")]
    TftpBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("file `{}` cannot be served over TFTP: {reason}", path.display())]
    TftpFile { path: PathBuf, reason: String },

    #[error("password-less SSH login as `{user}` was refused by {host}")]
    SshAuthentication { user: String, host: String },

    #[error("remote upgrade did not start: {0}")]
    UpgradeFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("the {0} worker panicked")]
    WorkerPanicked(&'static str),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LoginFailed { .. }
            | Error::UnexpectedBootConfig { .. }
            | Error::PersistFailed { .. }
            | Error::ImageRejected { .. } => ErrorKind::ProtocolMismatch,
            Error::TftpRetriesExceeded { .. } => ErrorKind::TransientBootFailure,
            Error::UpgradeFailed(_) => ErrorKind::RemoteUpgradeFailure,
            Error::Cancelled => ErrorKind::UserCancellation,
            Error::Serial(_)
            | Error::Io(_)
            | Error::Ssh(_)
            | Error::SessionClosed { .. }
            | Error::InvalidAddress { .. }
            | Error::InvalidNetworkPlan(_)
            | Error::TftpBind { .. }
            | Error::TftpFile { .. }
            | Error::SshAuthentication { .. }
            | Error::WorkerPanicked(_) => ErrorKind::ResourceFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Unit Tests
// =============================================================================
