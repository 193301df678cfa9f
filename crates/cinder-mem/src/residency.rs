//! # Residency Tracking
//!
//! Allocations referenced by submitted commands must be resident on the
//! device. Every command list registers what it touches with its execution
//! context's tracker; lists on different threads share one tracker.

use hashbrown::HashMap;
use spin::Mutex;

use cinder_core::AllocationHandle;

use crate::allocation::GpuAllocation;

/// Tracker statistics
#[derive(Debug, Clone, Default)]
pub struct ResidencyStats {
    /// Registrations since creation
    pub registrations: u64,
}

#[derive(Debug, Default)]
struct Inner {
    counts: HashMap<AllocationHandle, u32>,
    stats: ResidencyStats,
}

/// Thread-safe residency registry
#[derive(Debug, Default)]
pub struct ResidencyTracker {
    inner: Mutex<Inner>,
}

impl ResidencyTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one use of `allocation`; returns its registration count
    ///
    /// The count saturates at `u32::MAX`.
    pub fn make_resident(&self, allocation: &GpuAllocation) -> u32 {
        let mut inner = self.inner.lock();
        inner.stats.registrations += 1;
        let count = inner.counts.entry(allocation.handle()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// How many times `handle` was registered
    pub fn residency_count(&self, handle: AllocationHandle) -> u32 {
        self.inner.lock().counts.get(&handle).copied().unwrap_or(0)
    }

    /// Whether `handle` is resident
    pub fn is_resident(&self, handle: AllocationHandle) -> bool {
        self.residency_count(handle) > 0
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ResidencyStats {
        self.inner.lock().stats.clone()
    }
}
