//! # Allocator
//!
//! The engine asks a [`MemoryAllocator`] for counter pages, event pools and
//! command buffers. [`HostAllocator`] hands out host-backed allocations from a
//! linear GPU VA range with a byte budget.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use cinder_core::{AllocationHandle, Error, GpuAddr, Result, PAGE_SIZE_64K};

use crate::allocation::{AllocationKind, GpuAllocation, Placement};

// =============================================================================
// ALLOCATION REQUEST
// =============================================================================

/// Allocation request
#[derive(Debug, Clone, Copy)]
pub struct AllocDesc {
    /// Size in bytes
    pub size: u64,
    /// Required GPU VA alignment (power of two)
    pub alignment: u64,
    /// Usage
    pub kind: AllocationKind,
    /// Placement
    pub placement: Placement,
}

impl AllocDesc {
    /// Request for `size` bytes of `kind`, host placed, page aligned
    pub const fn new(kind: AllocationKind, size: u64) -> Self {
        Self {
            size,
            alignment: PAGE_SIZE_64K,
            kind,
            placement: Placement::Host,
        }
    }

    /// Change placement
    pub const fn placed(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

// =============================================================================
// ALLOCATOR TRAIT
// =============================================================================

/// Source of GPU allocations
pub trait MemoryAllocator: Send + Sync {
    /// Allocate; the allocation is released when the last `Arc` drops
    fn allocate(&self, desc: &AllocDesc) -> Result<Arc<GpuAllocation>>;

    /// Bytes held by live allocations
    fn bytes_in_use(&self) -> u64;
}

// =============================================================================
// HOST ALLOCATOR
// =============================================================================

/// Allocator statistics
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Successful allocations
    pub total_allocations: u64,
    /// Allocations refused for lack of budget
    pub failed_allocations: u64,
}

/// Host-backed allocator over a linear VA range
#[derive(Debug)]
pub struct HostAllocator {
    next_va: AtomicU64,
    next_handle: AtomicU64,
    budget: u64,
    live: Mutex<Vec<Weak<GpuAllocation>>>,
    stats: Mutex<AllocatorStats>,
}

/// First VA handed out
pub const HOST_ALLOCATOR_VA_BASE: u64 = 0x0000_0001_0000_0000;

impl HostAllocator {
    /// Create an allocator that refuses to exceed `budget` live bytes
    pub fn new(budget: u64) -> Self {
        Self {
            next_va: AtomicU64::new(HOST_ALLOCATOR_VA_BASE),
            next_handle: AtomicU64::new(1),
            budget,
            live: Mutex::new(Vec::new()),
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    /// Allocator with an effectively unlimited budget
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> AllocatorStats {
        self.stats.lock().clone()
    }

    fn reserve_va(&self, size: u64, alignment: u64) -> GpuAddr {
        let alignment = alignment.max(1).next_power_of_two();
        let span = size.max(1).div_ceil(alignment) * alignment;
        let mut current = self.next_va.load(Ordering::Relaxed);
        loop {
            let start = GpuAddr::new(current).align_up(alignment);
            let next = start.raw() + span;
            match self.next_va.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return start,
                Err(seen) => current = seen,
            }
        }
    }
}

impl MemoryAllocator for HostAllocator {
    fn allocate(&self, desc: &AllocDesc) -> Result<Arc<GpuAllocation>> {
        if desc.size == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut live = self.live.lock();
        live.retain(|w| w.strong_count() > 0);
        let in_use: u64 = live.iter().filter_map(|w| w.upgrade()).map(|a| a.size()).sum();

        if in_use.saturating_add(desc.size) > self.budget {
            self.stats.lock().failed_allocations += 1;
            log::warn!(
                "cinder-mem: allocation of {} bytes refused ({} of {} in use)",
                desc.size,
                in_use,
                self.budget
            );
            return Err(Error::OutOfMemory);
        }

        let handle = AllocationHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let gpu_va = self.reserve_va(desc.size, desc.alignment);
        let allocation = Arc::new(GpuAllocation::new(
            handle,
            desc.kind,
            desc.placement,
            gpu_va,
            desc.size,
        ));
        live.push(Arc::downgrade(&allocation));
        self.stats.lock().total_allocations += 1;

        log::trace!(
            "cinder-mem: {:?} {:?} {} bytes at {}",
            handle,
            desc.kind,
            desc.size,
            gpu_va
        );
        Ok(allocation)
    }

    fn bytes_in_use(&self) -> u64 {
        self.live
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|a| a.size())
            .sum()
    }
}
