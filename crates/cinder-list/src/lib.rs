//! # CINDER List
//!
//! In-order command lists for compute GPUs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           cinder-list                            │
//! │                                                                  │
//! │  ┌────────────────────┐   append_*   ┌────────────────────────┐  │
//! │  │    CommandList     ├─────────────►│  InOrderState/Emitter  │  │
//! │  │ (regular/immediate)│              │ counter plan, waits,   │  │
//! │  └─────────┬──────────┘              │ overflow tail          │  │
//! │            │                         └───────────┬────────────┘  │
//! │            │ flush                               │ binds         │
//! │            ▼                                     ▼               │
//! │  ┌────────────────────┐              ┌────────────────────────┐  │
//! │  │  ExecutionContext  │◄─ download ──┤   Event / EventPool    │  │
//! │  │ (SoftwareContext)  │              │ packets or counter     │  │
//! │  └─────────▲──────────┘              └────────────────────────┘  │
//! │            │ execute                                             │
//! │  ┌─────────┴──────────┐                                          │
//! │  │    CommandQueue    │                                          │
//! │  └────────────────────┘                                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every append on an in-order list advances a dependency counter that
//! lives in device memory. Events signaled by an append are bound to the
//! counter value it writes, so later waits on the device and on the host
//! compare against that value instead of the event's own packets.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod context;
pub mod device;
pub mod event;
pub mod kernel;
pub mod list;
pub mod queue;
pub mod sync;

mod inorder;

// Re-exports
#[cfg(feature = "std")]
pub use context::StdClock;
pub use context::{
    Clock, ContextStats, DownloadHook, ExecutionContext, SoftwareContext, SteppingClock,
    Submission,
};
pub use device::{Device, DeviceInfo};
pub use event::{
    Event, EventDesc, EventKind, EventPool, EventScope, InOrderBinding, MAX_EVENT_PACKETS,
    PACKET_SIZE, STATE_CLEARED, STATE_SIGNALED,
};
pub use kernel::{GroupCount, Kernel, KernelDescriptor, PRINTF_BUFFER_SIZE};
pub use list::{BufferRef, CommandList, CopyRegion, ListDesc, ListType, MemoryRange};
pub use queue::CommandQueue;
pub use sync::{wait_for_counter, SyncState};

static_assertions::assert_impl_all!(Event: Send, Sync);
static_assertions::assert_impl_all!(EventPool: Send, Sync);
static_assertions::assert_impl_all!(Device: Send, Sync);
static_assertions::assert_impl_all!(CommandList: Send);
static_assertions::assert_obj_safe!(ExecutionContext);
static_assertions::assert_obj_safe!(Clock);
