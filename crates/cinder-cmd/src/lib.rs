//! # CINDER Command
//!
//! Instruction model, binary command stream and per-generation encoders.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       cinder-cmd                            │
//! │                                                             │
//! │   append_* ──► HwEncoder ──► CommandBatch ──► CommandStream │
//! │               (gen12lp,      (validated,      (chained      │
//! │                xe-hp,         all or          64K buffers)  │
//! │                xe-hpc)        nothing)                      │
//! │                                                             │
//! │   CommandStream ──► decode ──► Vec<Instruction>             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod batch;
pub mod encoder;
pub mod instruction;
pub mod stream;

// Re-exports
pub use batch::CommandBatch;
pub use encoder::{
    select_encoder, Gen12LpEncoder, HwEncoder, XeHpEncoder, XeHpcEncoder, MAX_BTP_PREFETCH,
};
pub use instruction::{
    decode_all, CompareOp, Instruction, InstructionKind, PostSync, WalkerCmd,
    BATCH_BUFFER_START_SIZE,
};
pub use stream::{CommandStream, StreamMark, StreamStats};

static_assertions::assert_impl_all!(Instruction: Send, Sync, Copy);
static_assertions::assert_impl_all!(CommandStream: Send);
static_assertions::assert_obj_safe!(HwEncoder);
