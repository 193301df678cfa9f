//! # Kernels
//!
//! Compiled-kernel metadata the command list needs to program a dispatch.
//! Module loading is someone else's job; a [`KernelDescriptor`] is all that
//! reaches this layer.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use cinder_core::{Error, Result};
use cinder_mem::{AllocDesc, AllocationKind, GpuAllocation};

use crate::device::Device;

/// Printf buffer size
pub const PRINTF_BUFFER_SIZE: u64 = 4096;

/// Printf header: dword count of payload bytes written by the device
const PRINTF_HEADER: u64 = 4;

/// Kernel properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDescriptor {
    /// Kernel name
    pub name: &'static str,
    /// Binding table entries
    pub binding_table_count: u32,
    /// Kernel writes to a printf buffer
    pub uses_printf: bool,
    /// Compiled for the large register file
    pub large_grf: bool,
    /// SIMD width (8, 16 or 32)
    pub simd_size: u32,
    /// Shared local memory per work-group, bytes
    pub slm_size: u32,
    /// Work-group dimensions
    pub group_size: [u32; 3],
}

impl KernelDescriptor {
    /// SIMD32 kernel with a 32x1x1 group and no resources
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            binding_table_count: 0,
            uses_printf: false,
            large_grf: false,
            simd_size: 32,
            slm_size: 0,
            group_size: [32, 1, 1],
        }
    }

    /// Change the binding table size
    pub const fn with_binding_table(mut self, count: u32) -> Self {
        self.binding_table_count = count;
        self
    }

    /// Enable printf
    pub const fn with_printf(mut self, uses_printf: bool) -> Self {
        self.uses_printf = uses_printf;
        self
    }

    /// Change GRF mode
    pub const fn with_large_grf(mut self, large_grf: bool) -> Self {
        self.large_grf = large_grf;
        self
    }

    /// Change SIMD width
    pub const fn with_simd(mut self, simd_size: u32) -> Self {
        self.simd_size = simd_size;
        self
    }

    /// Change SLM usage
    pub const fn with_slm(mut self, slm_size: u32) -> Self {
        self.slm_size = slm_size;
        self
    }

    /// Change the work-group size
    pub const fn with_group_size(mut self, group_size: [u32; 3]) -> Self {
        self.group_size = group_size;
        self
    }

    /// Work items per group
    pub const fn group_items(&self) -> u64 {
        self.group_size[0] as u64 * self.group_size[1] as u64 * self.group_size[2] as u64
    }
}

/// Dispatch dimensions in work-groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCount {
    /// X
    pub x: u32,
    /// Y
    pub y: u32,
    /// Z
    pub z: u32,
}

impl GroupCount {
    /// Group count
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total groups
    pub const fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Whether any dimension is zero
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// As walker dimensions
    pub const fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

/// A kernel ready to launch
#[derive(Debug)]
pub struct Kernel {
    desc: KernelDescriptor,
    printf_buffer: Option<Arc<GpuAllocation>>,
}

impl Kernel {
    /// Validate `desc` against `device` and allocate the printf buffer
    pub fn new(device: &Device, desc: KernelDescriptor) -> Result<Arc<Self>> {
        if !matches!(desc.simd_size, 8 | 16 | 32) {
            return Err(Error::InvalidArgument);
        }
        if desc.group_size.contains(&0)
            || desc.group_items() > device.info().max_work_group_size as u64
        {
            return Err(Error::InvalidArgument);
        }

        let printf_buffer = if desc.uses_printf {
            let buffer = device
                .allocator()
                .allocate(&AllocDesc::new(AllocationKind::UserBuffer, PRINTF_BUFFER_SIZE))?;
            Some(buffer)
        } else {
            None
        };

        Ok(Arc::new(Self {
            desc,
            printf_buffer,
        }))
    }

    /// Properties
    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.desc
    }

    /// Name
    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    /// Printf output buffer
    pub fn printf_buffer(&self) -> Option<&Arc<GpuAllocation>> {
        self.printf_buffer.as_ref()
    }

    /// Hardware threads one work-group occupies
    pub fn threads_per_group(&self) -> u32 {
        self.desc.group_items().div_ceil(self.desc.simd_size as u64) as u32
    }

    /// Log and clear whatever the device printed; returns the bytes consumed
    pub fn flush_printf(&self) -> usize {
        let Some(buffer) = &self.printf_buffer else {
            return 0;
        };
        let capacity = buffer.size() - PRINTF_HEADER;
        let len = (buffer.load_u32(0) as u64).min(capacity) as usize;
        if len == 0 {
            return 0;
        }

        let mut bytes = vec![0u8; len];
        if buffer.read_bytes(PRINTF_HEADER, &mut bytes).is_err() {
            return 0;
        }
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            log::info!("cinder-list: [{}] {}", self.desc.name, line);
        }
        buffer.store_u32(0, 0);
        len
    }
}
