//! Error types for sockpool

use crate::address::AddressKind;
use crate::config::ConfigError;
use crate::socket::Identity;
use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sockpool
#[derive(Error, Debug)]
pub enum Error {
    /// A syscall failed; `op` names it (`bind`, `accept`, `poll`, ...)
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The registry already holds as many connections as it reserved room for
    #[error("too many sockets in pool (capacity {capacity})")]
    Capacity { capacity: usize },

    /// A connection with this identity is already registered
    #[error("connection {0} is already registered")]
    Duplicate(Identity),

    /// No registered connection has this identity
    #[error("no such connection {0}")]
    UnknownIdentity(Identity),

    /// A tagged address was accessed as the wrong kind
    #[error("address is {actual}, not {expected}")]
    TypeMismatch {
        expected: AddressKind,
        actual: AddressKind,
    },

    /// Address text that does not parse or resolve
    #[error("invalid address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    /// Descriptor-level failures (pipe, poll, dup, close)
    #[error("descriptor error: {0}")]
    Descriptor(#[from] sockpool_fd::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn os(op: &'static str, source: std::io::Error) -> Self {
        Self::Os { op, source }
    }

    /// The OS error code behind this failure, when it came from a syscall.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            Self::Descriptor(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// True for failures the caller can recover from by dropping or
    /// re-queueing the connection instead of tearing down the loop.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. } | Self::Duplicate(_) | Self::UnknownIdentity(_)
        )
    }
}

/// Adapter for `map_err` at syscall sites: `.map_err(os_err("bind"))`.
pub(crate) fn os_err(op: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::os(op, source)
}
