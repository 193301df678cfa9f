//! # GPU Allocations
//!
//! A GPU allocation pairs a GPU virtual address range with host-visible
//! backing words. The device (or a simulator standing in for it) writes the
//! words while host threads poll them, so storage is atomic.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use cinder_core::{AllocationHandle, Error, GpuAddr, Result};

// =============================================================================
// ALLOCATION METADATA
// =============================================================================

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// In-order dependency counter page
    CounterBuffer,
    /// Event packet storage
    EventPool,
    /// Command buffer memory
    CommandBuffer,
    /// Application buffer
    UserBuffer,
}

/// Where the backing memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Device local memory
    Device,
    /// System memory mapped to the device
    Host,
    /// Migratable shared memory
    Shared,
}

const WORD: u64 = core::mem::size_of::<u32>() as u64;

// =============================================================================
// GPU ALLOCATION
// =============================================================================

/// A GPU allocation with host-visible backing
pub struct GpuAllocation {
    handle: AllocationHandle,
    kind: AllocationKind,
    placement: Placement,
    gpu_va: GpuAddr,
    size: u64,
    words: Box<[AtomicU32]>,
}

impl GpuAllocation {
    /// Create a zero-filled allocation; `size` is rounded up to whole dwords
    pub fn new(
        handle: AllocationHandle,
        kind: AllocationKind,
        placement: Placement,
        gpu_va: GpuAddr,
        size: u64,
    ) -> Self {
        let word_count = size.div_ceil(WORD) as usize;
        let words: Vec<AtomicU32> = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        Self {
            handle,
            kind,
            placement,
            gpu_va,
            size: word_count as u64 * WORD,
            words: words.into_boxed_slice(),
        }
    }

    /// Allocation identity
    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    /// Usage kind
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Memory placement
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Base GPU address
    pub fn gpu_address(&self) -> GpuAddr {
        self.gpu_va
    }

    /// GPU address of a byte offset
    pub fn gpu_address_at(&self, offset: u64) -> GpuAddr {
        self.gpu_va.offset(offset)
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `[offset, offset + len)` lies inside the allocation
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.size)
    }

    fn word(&self, offset: u64) -> Option<&AtomicU32> {
        if offset % WORD != 0 {
            return None;
        }
        self.words.get((offset / WORD) as usize)
    }

    /// Load a dword; out-of-range or unaligned offsets read as zero
    pub fn load_u32(&self, offset: u64) -> u32 {
        debug_assert!(self.word(offset).is_some(), "bad dword offset {}", offset);
        self.word(offset).map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Store a dword; out-of-range or unaligned offsets are ignored
    pub fn store_u32(&self, offset: u64, value: u32) {
        debug_assert!(self.word(offset).is_some(), "bad dword offset {}", offset);
        if let Some(w) = self.word(offset) {
            w.store(value, Ordering::Release);
        }
    }

    /// Load a qword as two dwords, low first
    pub fn load_u64(&self, offset: u64) -> u64 {
        let low = self.load_u32(offset) as u64;
        let high = self.load_u32(offset + WORD) as u64;
        (high << 32) | low
    }

    /// Store a qword as two dwords, low first
    pub fn store_u64(&self, offset: u64, value: u64) {
        self.store_u32(offset, value as u32);
        self.store_u32(offset + WORD, (value >> 32) as u32);
    }

    /// Copy bytes out of the allocation
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        if !self.contains(offset, out.len() as u64) {
            return Err(Error::InvalidArgument);
        }
        for (i, byte) in out.iter_mut().enumerate() {
            let at = offset + i as u64;
            let shift = (at % WORD) * 8;
            let word = self.load_u32(at - at % WORD);
            *byte = (word >> shift) as u8;
        }
        Ok(())
    }

    /// Copy bytes into the allocation
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.contains(offset, data.len() as u64) {
            return Err(Error::InvalidArgument);
        }
        for (i, byte) in data.iter().enumerate() {
            let at = offset + i as u64;
            let shift = (at % WORD) * 8;
            if let Some(w) = self.word(at - at % WORD) {
                let mask = !(0xffu32 << shift);
                let bits = (*byte as u32) << shift;
                // Single writer per byte; the update only has to keep neighbours intact
                let _ = w.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                    Some((old & mask) | bits)
                });
            }
        }
        Ok(())
    }

    /// Zero the whole backing store
    pub fn zero(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Release);
        }
    }
}

impl fmt::Debug for GpuAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuAllocation")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("placement", &self.placement)
            .field("gpu_va", &self.gpu_va)
            .field("size", &self.size)
            .finish()
    }
}
