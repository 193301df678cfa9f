//! # CINDER Memory
//!
//! Host-visible GPU allocations, residency bookkeeping and the per-list
//! dependency counter page.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CINDER Memory System                       │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  MemoryAllocator (trait)                  │  │
//! │  │        HostAllocator: linear VA range + byte budget       │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌──────┴──────┐  ┌────────────────────┐   │
//! │  │  GpuAllocation  │  │  Residency  │  │ DependencyCounter  │   │
//! │  │ (atomic words)  │  │   Tracker   │  │    Allocation      │   │
//! │  └─────────────────┘  └─────────────┘  └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backing storage is a slice of atomic dwords so the device side (or a
//! simulator) and polling host threads can share it without locks.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod allocation;
pub mod allocator;
pub mod counter;
pub mod residency;

// Re-exports
pub use allocation::{AllocationKind, GpuAllocation, Placement};
pub use allocator::{AllocDesc, AllocatorStats, HostAllocator, MemoryAllocator};
pub use counter::{DependencyCounterAllocation, SlotAddresses};
pub use residency::{ResidencyStats, ResidencyTracker};

static_assertions::assert_impl_all!(GpuAllocation: Send, Sync);
static_assertions::assert_impl_all!(DependencyCounterAllocation: Send, Sync);
static_assertions::assert_impl_all!(ResidencyTracker: Send, Sync);
static_assertions::assert_obj_safe!(MemoryAllocator);
