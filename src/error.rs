//! Error taxonomy shared by every layer of the bridge.
//!
//! Each [`BridgeError`] belongs to exactly one [`ErrorCategory`]; the binary maps
//! the category to a sysexits-style process status so a supervisor can tell
//! configuration mistakes, OS resource failures and protocol faults apart.
//! A peer closing the connection and an operator termination request are not
//! errors and never show up here.
use std::io;

use thiserror::Error;

/// Successful termination.
pub const EX_OK: i32 = 0;
/// Command line usage or configuration error.
pub const EX_USAGE: i32 = 64;
/// Internal software / protocol error.
pub const EX_SOFTWARE: i32 = 70;
/// Operating system resource error.
pub const EX_OSERR: i32 = 71;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid options, detected before any resource is touched.
    Config,
    /// Shared memory or semaphore could not be created / attached.
    Resource,
    /// The transport could not be opened or connected.
    Connection,
    /// Receive / reply failures other than a peer reset.
    Protocol,
    /// The access guard exhausted its failure budget.
    LockStarved,
}

impl ErrorCategory {
    pub fn exit_status(self) -> i32 {
        match self {
            ErrorCategory::Config => EX_USAGE,
            ErrorCategory::Resource => EX_OSERR,
            ErrorCategory::Connection | ErrorCategory::Protocol | ErrorCategory::LockStarved => {
                EX_SOFTWARE
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shared memory object '{name}' already exists (use --force to attach to it)")]
    RegionExists { name: String },

    #[error("semaphore '{name}' already exists (use --semaphore-force to reuse it)")]
    SemaphoreExists { name: String },

    #[error("{context}: {source}")]
    Resource { context: String, source: io::Error },

    #[error("{context}: {source}")]
    Connection { context: String, source: io::Error },

    #[error("{context}: {source}")]
    ProtocolIo { context: String, source: io::Error },

    #[error("{0}")]
    Protocol(String),

    #[error("repeatedly failed to acquire the semaphore '{name}'")]
    LockStarved { name: String },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config(message.into())
    }

    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        BridgeError::Resource {
            context: context.into(),
            source,
        }
    }

    pub fn connection(context: impl Into<String>, source: io::Error) -> Self {
        BridgeError::Connection {
            context: context.into(),
            source,
        }
    }

    pub fn protocol_io(context: impl Into<String>, source: io::Error) -> Self {
        BridgeError::ProtocolIo {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Config(_) => ErrorCategory::Config,
            BridgeError::RegionExists { .. }
            | BridgeError::SemaphoreExists { .. }
            | BridgeError::Resource { .. } => ErrorCategory::Resource,
            BridgeError::Connection { .. } => ErrorCategory::Connection,
            BridgeError::ProtocolIo { .. } | BridgeError::Protocol(_) => ErrorCategory::Protocol,
            BridgeError::LockStarved { .. } => ErrorCategory::LockStarved,
        }
    }

    pub fn exit_status(&self) -> i32 {
        self.category().exit_status()
    }
}
