//! # Dependency Counter Allocation
//!
//! One 64 KiB page holding the completion value of an in-order command list.
//! At every byte offset the page holds `partition_count` consecutive 8-byte
//! slots, one per tile; the counter value lives in the low dword of a slot.
//! A target is reached only when every slot has reached it.
//!
//! ```text
//!   offset ─┐
//!           ▼
//!   ┌──────────┬──────────┬──────────┬─────
//!   │ tile 0   │ tile 1   │ (next    │ ...
//!   │ lo | hi  │ lo | hi  │  offset) │
//!   └──────────┴──────────┴──────────┴─────
//! ```
//!
//! `reset()` zeroes the page and bumps the generation so that references
//! taken before the reset can be recognized as stale.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;

use cinder_core::{
    AllocationHandle, Error, GpuAddr, Result, COUNTER_SLOT_SIZE, MAX_PARTITIONS, PAGE_SIZE_64K,
};

use crate::allocation::{AllocationKind, GpuAllocation};
use crate::allocator::{AllocDesc, MemoryAllocator};

/// Slot addresses for one counter offset
pub type SlotAddresses = ArrayVec<GpuAddr, MAX_PARTITIONS>;

/// GPU-visible, host-readable in-order counter page
#[derive(Debug)]
pub struct DependencyCounterAllocation {
    allocation: Arc<GpuAllocation>,
    partition_count: u32,
    generation: AtomicU32,
}

impl DependencyCounterAllocation {
    /// Allocate a zeroed counter page for `partition_count` tiles
    pub fn new(allocator: &dyn MemoryAllocator, partition_count: u32) -> Result<Arc<Self>> {
        if partition_count == 0 || partition_count as usize > MAX_PARTITIONS {
            return Err(Error::InvalidArgument);
        }
        let desc = AllocDesc::new(AllocationKind::CounterBuffer, PAGE_SIZE_64K);
        let allocation = allocator.allocate(&desc)?;
        Ok(Arc::new(Self {
            allocation,
            partition_count,
            generation: AtomicU32::new(0),
        }))
    }

    /// Backing allocation
    pub fn allocation(&self) -> &Arc<GpuAllocation> {
        &self.allocation
    }

    /// Allocation identity
    pub fn handle(&self) -> AllocationHandle {
        self.allocation.handle()
    }

    /// Base GPU address
    pub fn gpu_address(&self) -> GpuAddr {
        self.allocation.gpu_address()
    }

    /// Tiles writing to this page
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Current generation; bumped by every reset
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bytes consumed per counter offset
    pub fn offset_stride(&self) -> u64 {
        COUNTER_SLOT_SIZE * self.partition_count as u64
    }

    /// Whether all slots for `offset` fit in the page
    pub fn fits(&self, offset: u64) -> bool {
        self.allocation.contains(offset, self.offset_stride())
    }

    /// GPU address of one partition's slot
    pub fn slot_address(&self, offset: u64, partition: u32) -> GpuAddr {
        self.allocation
            .gpu_address_at(offset + partition as u64 * COUNTER_SLOT_SIZE)
    }

    /// GPU addresses of every partition slot at `offset`
    pub fn slot_addresses(&self, offset: u64) -> SlotAddresses {
        (0..self.partition_count)
            .map(|p| self.slot_address(offset, p))
            .collect()
    }

    /// Host view of one partition's counter value
    pub fn host_value(&self, offset: u64, partition: u32) -> u32 {
        self.allocation
            .load_u32(offset + partition as u64 * COUNTER_SLOT_SIZE)
    }

    /// Write a counter value into one slot (device writes, simulation)
    pub fn write_value(&self, offset: u64, partition: u32, value: u32) {
        self.allocation
            .store_u64(offset + partition as u64 * COUNTER_SLOT_SIZE, value as u64);
    }

    /// Write the same value into every slot at `offset`
    pub fn signal_all(&self, offset: u64, value: u32) {
        for p in 0..self.partition_count {
            self.write_value(offset, p, value);
        }
    }

    /// True when every partition slot at `offset` is >= `target`
    pub fn is_reached(&self, offset: u64, target: u32) -> bool {
        (0..self.partition_count).all(|p| self.host_value(offset, p) >= target)
    }

    /// Zero the page and start a new generation
    pub fn reset(&self) -> u32 {
        self.allocation.zero();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        log::debug!(
            "cinder-mem: counter {:?} reset, generation {}",
            self.handle(),
            generation
        );
        generation
    }
}
