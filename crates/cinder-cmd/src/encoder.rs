//! # Hardware Encoders
//!
//! One strategy object per GPU generation. The in-order protocol asks the
//! encoder how a dispatch reports completion and how a copy-engine fill is
//! expressed; everything generation-agnostic lives in default methods.

use core::fmt;

use cinder_core::{Error, GpuAddr, GpuFamily, Result, MAX_PARTITIONS};

use crate::batch::CommandBatch;
use crate::instruction::{CompareOp, Instruction, PostSync, WalkerCmd};

/// Largest prefetchable binding table
pub const MAX_BTP_PREFETCH: u32 = 31;

/// Largest byte count of one copy-engine blit row
pub const MAX_BLT_WIDTH: u64 = 1 << 30;

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Per-generation instruction selection
pub trait HwEncoder: Sync + fmt::Debug {
    /// Generation served
    fn family(&self) -> GpuFamily;

    /// Encoder name
    fn name(&self) -> &'static str;

    /// Whether walkers can write completion data themselves
    fn has_walker_post_sync(&self) -> bool {
        true
    }

    /// Largest supported tile count
    fn max_partitions(&self) -> u32 {
        MAX_PARTITIONS as u32
    }

    /// Binding table prefetch when the list leaves it to the generation
    fn default_btp_prefetch(&self, binding_table_count: u32) -> u32 {
        binding_table_count.min(MAX_BTP_PREFETCH)
    }

    /// Emit a dispatch whose completion performs `signal`
    fn emit_signaling_dispatch(&self, batch: &mut CommandBatch, walker: WalkerCmd, signal: PostSync) {
        if self.has_walker_post_sync() {
            batch.push(Instruction::Walker(WalkerCmd {
                post_sync: signal,
                ..walker
            }));
        } else {
            batch.push(Instruction::Walker(WalkerCmd {
                post_sync: PostSync::NoWrite,
                partitioned: false,
                ..walker
            }));
            self.emit_stall(batch, signal, walker.partitioned);
        }
    }

    /// Emit a stall barrier followed by a dword store of `value`
    fn emit_barrier_store(
        &self,
        batch: &mut CommandBatch,
        address: GpuAddr,
        value: u32,
        partitioned: bool,
    ) {
        self.emit_stall(batch, PostSync::NoWrite, partitioned);
        self.emit_store(batch, address, value, partitioned);
    }

    /// Emit a stall pipe control
    fn emit_stall(&self, batch: &mut CommandBatch, post_sync: PostSync, partitioned: bool) {
        batch.push(Instruction::PipeControl {
            post_sync,
            stall: true,
            dc_flush: post_sync.writes(),
            partitioned,
        });
    }

    /// Emit a dword store-immediate
    fn emit_store(&self, batch: &mut CommandBatch, address: GpuAddr, value: u32, partitioned: bool) {
        batch.push(Instruction::StoreDataImm {
            address,
            value: value as u64,
            qword: false,
            partition_offset: partitioned,
        });
    }

    /// Emit a semaphore wait
    fn emit_semaphore(&self, batch: &mut CommandBatch, address: GpuAddr, value: u64, compare: CompareOp) {
        batch.push(Instruction::SemaphoreWait {
            address,
            value,
            compare,
        });
    }

    /// Emit a linear copy on the copy engine
    fn emit_blit_copy(&self, batch: &mut CommandBatch, dst: GpuAddr, src: GpuAddr, size: u64) {
        let mut done = 0;
        while done < size {
            let width = (size - done).min(MAX_BLT_WIDTH);
            batch.push(Instruction::CopyBlt {
                dst: dst + done,
                src: src + done,
                width: width as u32,
                height: 1,
                dst_pitch: width as u32,
                src_pitch: width as u32,
            });
            done += width;
        }
    }

    /// Emit a pitched region copy on the copy engine
    fn emit_blit_region(
        &self,
        batch: &mut CommandBatch,
        dst: GpuAddr,
        dst_pitch: u32,
        src: GpuAddr,
        src_pitch: u32,
        width: u32,
        height: u32,
    ) {
        batch.push(Instruction::CopyBlt {
            dst,
            src,
            width,
            height,
            dst_pitch,
            src_pitch,
        });
    }

    /// Emit a fill on the copy engine
    fn emit_blit_fill(
        &self,
        batch: &mut CommandBatch,
        dst: GpuAddr,
        size: u64,
        pattern: &[u8],
    ) -> Result<()> {
        batch.push(Instruction::ColorBlt {
            dst,
            size,
            pattern: replicate_pattern(pattern)?,
        });
        Ok(())
    }

    /// Emit a copy-engine flush
    fn emit_flush(&self, batch: &mut CommandBatch, post_sync: PostSync) {
        batch.push(Instruction::FlushDw { post_sync });
    }
}

/// Expand a 1, 2 or 4 byte fill pattern to a dword
pub fn replicate_pattern(pattern: &[u8]) -> Result<u32> {
    match *pattern {
        [b] => Ok(u32::from_ne_bytes([b; 4])),
        [a, b] => Ok(u32::from_ne_bytes([a, b, a, b])),
        [a, b, c, d] => Ok(u32::from_ne_bytes([a, b, c, d])),
        _ => Err(Error::NotSupported),
    }
}

// =============================================================================
// GENERATIONS
// =============================================================================

/// Gen12 low power: single tile, no walker post-sync
#[derive(Debug, Default)]
pub struct Gen12LpEncoder;

impl HwEncoder for Gen12LpEncoder {
    fn family(&self) -> GpuFamily {
        GpuFamily::Gen12Lp
    }

    fn name(&self) -> &'static str {
        "gen12lp"
    }

    fn has_walker_post_sync(&self) -> bool {
        false
    }

    fn max_partitions(&self) -> u32 {
        1
    }

    fn emit_barrier_store(
        &self,
        batch: &mut CommandBatch,
        address: GpuAddr,
        value: u32,
        partitioned: bool,
    ) {
        // The pipe control post-sync carries the store
        self.emit_stall(
            batch,
            PostSync::WriteImmediate {
                address,
                value: value as u64,
            },
            partitioned,
        );
    }
}

/// Xe HP: multi-tile, walker post-sync
#[derive(Debug, Default)]
pub struct XeHpEncoder;

impl HwEncoder for XeHpEncoder {
    fn family(&self) -> GpuFamily {
        GpuFamily::XeHp
    }

    fn name(&self) -> &'static str {
        "xe-hp"
    }
}

/// Xe HPC: multi-tile, byte fills through MEM_SET, no prefetch by default
#[derive(Debug, Default)]
pub struct XeHpcEncoder;

impl HwEncoder for XeHpcEncoder {
    fn family(&self) -> GpuFamily {
        GpuFamily::XeHpc
    }

    fn name(&self) -> &'static str {
        "xe-hpc"
    }

    fn default_btp_prefetch(&self, _binding_table_count: u32) -> u32 {
        0
    }

    fn emit_blit_fill(
        &self,
        batch: &mut CommandBatch,
        dst: GpuAddr,
        size: u64,
        pattern: &[u8],
    ) -> Result<()> {
        match *pattern {
            [value] => {
                batch.push(Instruction::MemSet { dst, size, value });
                Ok(())
            }
            _ => {
                batch.push(Instruction::ColorBlt {
                    dst,
                    size,
                    pattern: replicate_pattern(pattern)?,
                });
                Ok(())
            }
        }
    }
}

static GEN12LP: Gen12LpEncoder = Gen12LpEncoder;
static XE_HP: XeHpEncoder = XeHpEncoder;
static XE_HPC: XeHpcEncoder = XeHpcEncoder;

/// Encoder for a detected generation
pub fn select_encoder(family: GpuFamily) -> &'static dyn HwEncoder {
    match family {
        GpuFamily::Gen12Lp => &GEN12LP,
        GpuFamily::XeHp => &XE_HP,
        GpuFamily::XeHpc => &XE_HPC,
    }
}
