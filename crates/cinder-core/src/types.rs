//! # CINDER Core Types
//!
//! Strongly typed addresses, handles and hardware identifiers used across
//! the workspace.

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Size of one 64 KiB page
pub const PAGE_SIZE_64K: u64 = 64 * 1024;

/// Size of one counter slot (one per partition)
pub const COUNTER_SLOT_SIZE: u64 = core::mem::size_of::<u64>() as u64;

/// Highest partition count a list may use
pub const MAX_PARTITIONS: usize = 4;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the GPU's virtual address space. It is NOT a CPU pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Low 32 bits, as split into instruction dwords
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Rebuild from two dwords
    #[inline]
    pub const fn from_parts(low: u32, high: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Identity of a GPU allocation, stable for the allocation's lifetime
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AllocationHandle(u64);

impl AllocationHandle {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AllocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alloc#{}", self.0)
    }
}

/// Identity of an execution context (hardware queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(pub u32);

/// Monotonic submission counter of an execution context
pub type TaskCount = u32;

// =============================================================================
// HARDWARE IDENTIFIERS
// =============================================================================

/// GPU generation, selects the instruction encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GpuFamily {
    /// Gen12 low power: no dispatch post-sync, single tile
    Gen12Lp = 0x0c00,
    /// Xe-HP: dispatch post-sync, multi-tile
    XeHp = 0x0c05,
    /// Xe-HPC: adds the MEM_SET fill instruction
    XeHpc = 0x0c08,
}

impl GpuFamily {
    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gen12Lp => "gen12lp",
            Self::XeHp => "xe-hp",
            Self::XeHpc => "xe-hpc",
        }
    }
}

/// Engine a command list records for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    /// Render/compute command streamer
    Compute,
    /// Blitter (copy) engine
    Copy,
}

impl EngineType {
    /// Whether the engine can run compute dispatches
    pub const fn is_compute(self) -> bool {
        matches!(self, Self::Compute)
    }
}
