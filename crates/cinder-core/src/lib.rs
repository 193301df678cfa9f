//! # CINDER Core
//!
//! Foundational types shared by the CINDER command list engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cinder-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │     ListConfig      │  │
//! │  │ (4 classes) │  │ (GpuAddr,   │  │ (cooperative, BTP,  │  │
//! │  │             │  │  handles)   │  │  interrupts, ...)   │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(test)]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::{BtpPrefetchMode, ListConfig, Tristate, UserInterruptMask};
pub use error::{Error, ErrorCategory, Result};
pub use types::*;

static_assertions::assert_eq_size!(GpuAddr, u64);
static_assertions::assert_eq_size!(AllocationHandle, u64);
static_assertions::assert_impl_all!(Error: Send, Sync, Copy);
static_assertions::const_assert!(COUNTER_SLOT_SIZE == 8);
