//! # CINDER Error Handling
//!
//! Error types shared by every layer of the command list engine.
//!
//! Every error belongs to one of four categories that callers act on:
//! - `InvalidArgument`: the append is rejected, nothing was written
//! - `OutOfMemory`: stream or allocation exhaustion, recoverable by `reset()`
//! - `DeviceLost`: the GPU hung, fatal for the list and its queue
//! - `NotReady`: transient, the caller may poll again

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CINDER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR CATEGORY
// =============================================================================

/// Coarse error classes exposed to API layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad event/kernel state or exceeded limits
    InvalidArgument,
    /// Stream or allocation exhaustion
    OutOfMemory,
    /// GPU hang detected
    DeviceLost,
    /// Expected transient state
    NotReady,
}

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CINDER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Argument Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidArgument,
    /// Event is not usable in the requested way
    InvalidEventState,
    /// Event references a counter allocation that no longer exists
    StaleEventBinding,
    /// Cooperative and regular kernels mixed without permission
    CooperativeMixing,
    /// Cooperative launch exceeds concurrently schedulable work-groups
    GroupCountExceeded {
        /// Requested x*y*z
        requested: u64,
        /// Maximum the device can keep resident
        max: u32,
    },
    /// Operation not supported on this engine or list type
    NotSupported,
    /// Command stream content could not be decoded
    MalformedStream {
        /// Byte offset of the offending header
        offset: usize,
    },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Out of memory
    OutOfMemory,
    /// Counter allocation has no room for another overflow slot
    CounterSpaceExhausted,
    /// List was closed and accepts no more commands
    ListClosed,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// GPU hang detected
    DeviceLost,

    // =========================================================================
    // Transient States
    // =========================================================================
    /// Awaited value not reached yet
    NotReady,
}

impl Error {
    /// Map to the category API layers report
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument
            | Self::InvalidEventState
            | Self::StaleEventBinding
            | Self::CooperativeMixing
            | Self::GroupCountExceeded { .. }
            | Self::NotSupported
            | Self::MalformedStream { .. }
            | Self::ListClosed => ErrorCategory::InvalidArgument,
            Self::OutOfMemory | Self::CounterSpaceExhausted => ErrorCategory::OutOfMemory,
            Self::DeviceLost => ErrorCategory::DeviceLost,
            Self::NotReady => ErrorCategory::NotReady,
        }
    }

    /// Whether polling again may succeed
    pub const fn is_transient(&self) -> bool {
        matches!(self.category(), ErrorCategory::NotReady)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Argument
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidEventState => write!(f, "invalid event state"),
            Self::StaleEventBinding => write!(f, "event bound to a destroyed counter allocation"),
            Self::CooperativeMixing => {
                write!(f, "cooperative and regular kernels cannot share a command list")
            }
            Self::GroupCountExceeded { requested, max } => write!(
                f,
                "cooperative group count {} exceeds device limit {}",
                requested, max
            ),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::MalformedStream { offset } => {
                write!(f, "malformed command stream at byte {}", offset)
            }

            // Resource
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::CounterSpaceExhausted => write!(f, "dependency counter allocation exhausted"),
            Self::ListClosed => write!(f, "command list is closed"),

            // Device
            Self::DeviceLost => write!(f, "device lost"),

            // Transient
            Self::NotReady => write!(f, "not ready"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
