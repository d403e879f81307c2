//! Error types for Quick Sync session operations.

use thiserror::Error;

/// Errno-style codes handed to callers of the decode/encode entry points.
pub mod errno {
    /// Out of memory.
    pub const ENOMEM: i32 = 12;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// I/O error.
    pub const EIO: i32 = 5;
    /// Resource temporarily unavailable.
    pub const EAGAIN: i32 = 11;
    /// Function not implemented.
    pub const ENOSYS: i32 = 38;
    /// Internal bug; chosen outside the errno range so it never aliases one.
    pub const BUG: i32 = 0x4255_4720;
    /// Unknown error.
    pub const UNKNOWN: i32 = 0x554e_4b4e;
}

/// Errors that can occur while driving a decode or encode session.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Out of memory (buffers, tables, staging memory).
    #[error("out of memory")]
    OutOfMemory,

    /// The device rejected a handle (session, surface or completion token).
    #[error("invalid handle")]
    InvalidHandle,

    /// Invalid parameter passed to the session or device.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The device or session does not support the request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Hardware failure or lost device. The session must be reopened.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// The device needs more input, surfaces or output space.
    #[error("resource temporarily unavailable")]
    Again,

    /// The device stayed busy past the configured timeout.
    #[error("device busy for more than {waited_ms} ms")]
    BusyTimeout { waited_ms: u64 },

    /// A completion token did not signal within the sync timeout.
    #[error("completion did not signal within {timeout_ms} ms")]
    SyncTimeout { timeout_ms: u64 },

    /// Internal consistency fault. Never expected in a correct pipeline.
    #[error("internal bug: {0}")]
    Bug(String),

    /// Generic/unknown error.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Coarse classification of a [`CodecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocation failure; the session stays usable.
    ResourceExhaustion,
    /// Programming or configuration error.
    InvalidArgument,
    /// I/O-class failure of the device.
    DeviceFault,
    /// Request not supported.
    Unsupported,
    /// Retry with more input or buffers.
    Transient,
    /// "Must not happen" condition.
    InternalBug,
    /// Anything else.
    Unknown,
}

impl CodecError {
    /// Create an InvalidParam error with a message.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create an Unsupported error with a message.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a DeviceFault error with a message.
    pub fn device_fault(msg: impl Into<String>) -> Self {
        Self::DeviceFault(msg.into())
    }

    /// Create a Bug error with a message.
    pub fn bug(msg: impl Into<String>) -> Self {
        Self::Bug(msg.into())
    }

    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory => ErrorKind::ResourceExhaustion,
            Self::InvalidHandle | Self::InvalidParam(_) => ErrorKind::InvalidArgument,
            Self::DeviceFault(_) | Self::BusyTimeout { .. } | Self::SyncTimeout { .. } => {
                ErrorKind::DeviceFault
            }
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Again => ErrorKind::Transient,
            Self::Bug(_) => ErrorKind::InternalBug,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Negative error code as reported by the caller-facing entry points.
    #[must_use]
    pub fn errno(&self) -> i32 {
        -match self.kind() {
            ErrorKind::ResourceExhaustion => errno::ENOMEM,
            ErrorKind::InvalidArgument => errno::EINVAL,
            ErrorKind::DeviceFault => errno::EIO,
            ErrorKind::Unsupported => errno::ENOSYS,
            ErrorKind::Transient => errno::EAGAIN,
            ErrorKind::InternalBug => errno::BUG,
            ErrorKind::Unknown => errno::UNKNOWN,
        }
    }

    /// True if this error signals a tracking desynchronization.
    #[must_use]
    pub fn is_bug(&self) -> bool {
        matches!(self, Self::Bug(_))
    }
}
