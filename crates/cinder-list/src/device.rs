//! # Device
//!
//! Static device description plus the collaborators every list shares: the
//! generation's encoder, the allocator and the time source.

use alloc::sync::Arc;
use core::fmt;

use cinder_cmd::{select_encoder, HwEncoder};
use cinder_core::{Error, GpuFamily, Result};
use cinder_mem::MemoryAllocator;

use crate::context::Clock;
use crate::kernel::Kernel;

/// Device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Generation
    pub family: GpuFamily,
    /// Execution units across the device
    pub eu_count: u32,
    /// Hardware threads per EU
    pub threads_per_eu: u32,
    /// Shared local memory available to concurrently running groups, bytes
    pub slm_size: u32,
    /// Largest work-group
    pub max_work_group_size: u32,
    /// Tiles
    pub tile_count: u32,
}

impl DeviceInfo {
    /// Typical single-tile configuration of `family`
    pub const fn new(family: GpuFamily) -> Self {
        Self {
            family,
            eu_count: 512,
            threads_per_eu: 8,
            slm_size: 64 * 1024 * 32,
            max_work_group_size: 1024,
            tile_count: 1,
        }
    }

    /// Change the tile count
    pub const fn with_tiles(mut self, tile_count: u32) -> Self {
        self.tile_count = tile_count;
        self
    }

    /// Change EU occupancy limits
    pub const fn with_threads(mut self, eu_count: u32, threads_per_eu: u32) -> Self {
        self.eu_count = eu_count;
        self.threads_per_eu = threads_per_eu;
        self
    }

    /// Change the shared local memory pool
    pub const fn with_slm(mut self, slm_size: u32) -> Self {
        self.slm_size = slm_size;
        self
    }
}

/// A GPU device
pub struct Device {
    info: DeviceInfo,
    encoder: &'static dyn HwEncoder,
    allocator: Arc<dyn MemoryAllocator>,
    clock: Arc<dyn Clock>,
}

impl Device {
    /// Create a device
    pub fn new(
        info: DeviceInfo,
        allocator: Arc<dyn MemoryAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let encoder = select_encoder(info.family);
        if info.tile_count == 0 || info.tile_count > encoder.max_partitions() {
            return Err(Error::InvalidArgument);
        }
        if info.eu_count == 0 || info.threads_per_eu == 0 || info.max_work_group_size == 0 {
            return Err(Error::InvalidArgument);
        }
        log::debug!(
            "cinder-list: {} device, {} EUs x {} threads, {} tile(s), encoder {}",
            info.family.name(),
            info.eu_count,
            info.threads_per_eu,
            info.tile_count,
            encoder.name()
        );
        Ok(Arc::new(Self {
            info,
            encoder,
            allocator,
            clock,
        }))
    }

    /// Capabilities
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Generation encoder
    pub fn encoder(&self) -> &'static dyn HwEncoder {
        self.encoder
    }

    /// Allocator
    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Work-groups of `kernel` that can be resident at once
    ///
    /// Bounded by hardware threads (halved in large GRF mode) and by shared
    /// local memory.
    pub fn max_cooperative_group_count(&self, kernel: &Kernel) -> u32 {
        let desc = kernel.descriptor();
        let mut threads = self.info.eu_count.saturating_mul(self.info.threads_per_eu);
        if desc.large_grf {
            threads /= 2;
        }
        let mut max = threads / kernel.threads_per_group().max(1);
        if desc.slm_size > 0 {
            max = max.min(self.info.slm_size / desc.slm_size);
        }
        max
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("encoder", &self.encoder.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SteppingClock;
    use crate::kernel::KernelDescriptor;
    use cinder_mem::HostAllocator;

    fn device(info: DeviceInfo) -> Result<Arc<Device>> {
        Device::new(
            info,
            Arc::new(HostAllocator::unbounded()),
            Arc::new(SteppingClock::new(1)),
        )
    }

    #[test]
    fn test_tile_count_checked_against_generation() {
        assert!(device(DeviceInfo::new(GpuFamily::XeHp).with_tiles(2)).is_ok());
        assert_eq!(
            device(DeviceInfo::new(GpuFamily::Gen12Lp).with_tiles(2)).unwrap_err(),
            Error::InvalidArgument
        );
        assert!(device(DeviceInfo::new(GpuFamily::XeHpc).with_tiles(0)).is_err());
    }

    #[test]
    fn test_cooperative_limit_from_threads_grf_and_slm() {
        let dev = device(DeviceInfo::new(GpuFamily::XeHpc).with_threads(8, 8)).unwrap();

        // 64 threads, 64 work items at SIMD16 = 4 threads per group
        let desc = KernelDescriptor::new("coop")
            .with_group_size([64, 1, 1])
            .with_simd(16);
        let kernel = Kernel::new(&dev, desc).unwrap();
        assert_eq!(dev.max_cooperative_group_count(&kernel), 16);

        let kernel = Kernel::new(&dev, desc.with_large_grf(true)).unwrap();
        assert_eq!(dev.max_cooperative_group_count(&kernel), 8);

        let slm = dev.info().slm_size / 3;
        let kernel = Kernel::new(&dev, desc.with_slm(slm)).unwrap();
        assert_eq!(dev.max_cooperative_group_count(&kernel), 3);
    }
}
