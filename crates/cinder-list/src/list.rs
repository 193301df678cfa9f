//! # Command List
//!
//! Converts API appends into command stream instructions.
//!
//! Every append follows the same pipeline:
//!
//! ```text
//!   validate ──► plan counter ──► build CommandBatch ──► write stream
//!                                  │ leading stall           │
//!                                  │ dependency waits        ▼
//!                                  │ operation body      commit counter,
//!                                  │ signal              bind event,
//!                                  │ overflow tail       residency, flush
//! ```
//!
//! Nothing observable changes before the batch reached the stream, so a
//! failed append leaves the list exactly as it was.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use cinder_cmd::{
    CommandBatch, CommandStream, CompareOp, HwEncoder, Instruction, PostSync, StreamMark,
    WalkerCmd, MAX_BTP_PREFETCH,
};
use cinder_core::{
    BtpPrefetchMode, EngineType, Error, GpuAddr, ListConfig, Result, TaskCount,
};
use cinder_mem::{DependencyCounterAllocation, GpuAllocation, Placement};

use crate::context::{ExecutionContext, Submission};
use crate::device::Device;
use crate::event::{Event, EventKind, STATE_CLEARED, STATE_SIGNALED};
use crate::inorder::{Emitter, InOrderState, SignalPlan};
use crate::kernel::{GroupCount, Kernel};
use crate::sync::{self, SyncState};

/// Bytes one work-group of the builtin copy and fill kernels handles
pub const BUILTIN_BYTES_PER_GROUP: u64 = 64;

/// Bytes of one indirect dispatch argument record
pub const INDIRECT_ARGS_SIZE: u64 = 12;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Submission model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListType {
    /// Recorded, closed and executed through a queue
    Regular,
    /// Submitted on every append
    Immediate,
}

/// Command list creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListDesc {
    /// Submission model
    pub list_type: ListType,
    /// Target engine
    pub engine: EngineType,
    /// Request in-order execution
    pub in_order: bool,
    /// Tiles executing the list
    pub partition_count: u32,
}

impl ListDesc {
    /// In-order immediate list
    pub const fn immediate(engine: EngineType) -> Self {
        Self {
            list_type: ListType::Immediate,
            engine,
            in_order: true,
            partition_count: 1,
        }
    }

    /// In-order regular list
    pub const fn regular(engine: EngineType) -> Self {
        Self {
            list_type: ListType::Regular,
            engine,
            in_order: true,
            partition_count: 1,
        }
    }

    /// Change the in-order request
    pub const fn with_in_order(mut self, in_order: bool) -> Self {
        self.in_order = in_order;
        self
    }

    /// Change the tile count
    pub const fn with_partitions(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }
}

/// A position inside an allocation
#[derive(Debug, Clone)]
pub struct BufferRef {
    allocation: Arc<GpuAllocation>,
    offset: u64,
}

impl BufferRef {
    /// `offset` bytes into `allocation`
    pub fn new(allocation: Arc<GpuAllocation>, offset: u64) -> Self {
        Self { allocation, offset }
    }

    /// Start of `allocation`
    pub fn start(allocation: Arc<GpuAllocation>) -> Self {
        Self::new(allocation, 0)
    }

    /// Backing allocation
    pub fn allocation(&self) -> &Arc<GpuAllocation> {
        &self.allocation
    }

    /// Byte offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// GPU address
    pub fn address(&self) -> GpuAddr {
        self.allocation.gpu_address_at(self.offset)
    }

    /// Placement of the backing memory
    pub fn placement(&self) -> Placement {
        self.allocation.placement()
    }

    fn check(&self, len: u64) -> Result<()> {
        if self.allocation.contains(self.offset, len) {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

/// Pitched 2D copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Bytes per row
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Destination row pitch
    pub dst_pitch: u32,
    /// Source row pitch
    pub src_pitch: u32,
}

impl CopyRegion {
    fn extent(pitch: u32, width: u32, height: u32) -> u64 {
        (height as u64 - 1) * pitch as u64 + width as u64
    }
}

/// Range flushed by a memory ranges barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// Start
    pub address: GpuAddr,
    /// Bytes
    pub size: u64,
}

enum Body {
    Kernels { walkers: Vec<WalkerCmd>, split: bool },
    Commands(CommandBatch),
}

// =============================================================================
// COMMAND LIST
// =============================================================================

/// A command list
pub struct CommandList {
    device: Arc<Device>,
    ctx: Arc<dyn ExecutionContext>,
    desc: ListDesc,
    config: ListConfig,
    stream: CommandStream,
    in_order: Option<InOrderState>,
    contains_any_kernel: bool,
    contains_cooperative_kernels: bool,
    closed: bool,
    latest_flush_is_host_visible: bool,
    latest_task_count: Option<TaskCount>,
    appends: u64,
    submit_mark: StreamMark,
    submitted_bytes: u64,
    printf_kernels: Vec<Arc<Kernel>>,
}

impl CommandList {
    /// Create a list executing on `ctx`
    pub fn new(
        device: Arc<Device>,
        ctx: Arc<dyn ExecutionContext>,
        desc: ListDesc,
        config: ListConfig,
    ) -> Result<Self> {
        let encoder = device.encoder();
        if desc.partition_count == 0
            || desc.partition_count > encoder.max_partitions()
            || desc.partition_count > device.info().tile_count
        {
            return Err(Error::InvalidArgument);
        }
        if !desc.engine.is_compute() && desc.partition_count > 1 {
            return Err(Error::InvalidArgument);
        }
        if dispatch_limit(&config) == 0 {
            return Err(Error::InvalidArgument);
        }

        let stream = CommandStream::new(device.allocator().clone(), config.command_buffer_size)?;
        let in_order = if config.in_order_enabled(desc.in_order) {
            let counter =
                DependencyCounterAllocation::new(&**device.allocator(), desc.partition_count)?;
            Some(InOrderState::new(counter))
        } else {
            None
        };

        log::debug!(
            "cinder-list: new {:?} {:?} list on context {}, in-order {}, {} partition(s)",
            desc.list_type,
            desc.engine,
            ctx.id().0,
            in_order.is_some(),
            desc.partition_count
        );

        Ok(Self {
            device,
            ctx,
            desc,
            config,
            stream,
            in_order,
            contains_any_kernel: false,
            contains_cooperative_kernels: false,
            closed: false,
            latest_flush_is_host_visible: false,
            latest_task_count: None,
            appends: 0,
            submit_mark: StreamMark::default(),
            submitted_bytes: 0,
            printf_kernels: Vec::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Creation parameters
    pub fn desc(&self) -> &ListDesc {
        &self.desc
    }

    /// Configuration
    pub fn config(&self) -> &ListConfig {
        &self.config
    }

    /// Device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Execution context
    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.ctx
    }

    /// Recorded instructions
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }

    /// Whether appends are ordered through a dependency counter
    pub fn is_in_order(&self) -> bool {
        self.in_order.is_some()
    }

    /// Value signaled by the latest append; 0 before the first
    pub fn dependency_counter(&self) -> u32 {
        self.in_order.as_ref().map_or(0, |s| s.value)
    }

    /// Byte offset of the live counter slots
    pub fn allocation_offset(&self) -> u64 {
        self.in_order.as_ref().map_or(0, |s| s.offset)
    }

    /// Counter page of an in-order list
    pub fn counter_allocation(&self) -> Option<&Arc<DependencyCounterAllocation>> {
        self.in_order.as_ref().map(|s| &s.counter)
    }

    /// Tiles executing the list
    pub fn partition_count(&self) -> u32 {
        self.desc.partition_count
    }

    /// Whether any kernel was launched
    pub fn contains_any_kernel(&self) -> bool {
        self.contains_any_kernel
    }

    /// Whether a cooperative kernel was launched
    pub fn contains_cooperative_kernels(&self) -> bool {
        self.contains_cooperative_kernels
    }

    /// Whether the list was closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the latest append signaled a host-visible event
    pub fn latest_flush_is_host_visible(&self) -> bool {
        self.latest_flush_is_host_visible
    }

    /// Task count of the latest submission
    pub fn latest_task_count(&self) -> Option<TaskCount> {
        self.latest_task_count
    }

    // =========================================================================
    // Kernel launches
    // =========================================================================

    /// Launch `kernel` over `groups`
    pub fn append_launch_kernel(
        &mut self,
        kernel: &Arc<Kernel>,
        groups: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        self.require_compute()?;
        if groups.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.check_kernel_mix(false)?;

        let walker = self.kernel_walker(kernel, groups.as_array());
        let resources: Vec<_> = kernel.printf_buffer().into_iter().collect();
        self.record(
            signal,
            waits,
            Body::Kernels {
                walkers: vec![walker],
                split: false,
            },
            &resources,
        )?;
        self.note_kernel(kernel, false);
        Ok(())
    }

    /// Launch `kernel` with every group resident at once
    pub fn append_launch_cooperative_kernel(
        &mut self,
        kernel: &Arc<Kernel>,
        groups: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        self.require_compute()?;
        if groups.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let max = self.device.max_cooperative_group_count(kernel);
        if groups.total() > max as u64 {
            return Err(Error::GroupCountExceeded {
                requested: groups.total(),
                max,
            });
        }
        self.check_kernel_mix(true)?;

        let walker = WalkerCmd {
            cooperative: true,
            ..self.kernel_walker(kernel, groups.as_array())
        };
        let resources: Vec<_> = kernel.printf_buffer().into_iter().collect();
        self.record(
            signal,
            waits,
            Body::Kernels {
                walkers: vec![walker],
                split: false,
            },
            &resources,
        )?;
        self.note_kernel(kernel, true);
        Ok(())
    }

    /// Launch `kernel` with group counts read from `arguments`
    pub fn append_launch_kernel_indirect(
        &mut self,
        kernel: &Arc<Kernel>,
        arguments: GpuAddr,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        self.require_compute()?;
        if arguments.is_null() || !arguments.is_aligned(4) {
            return Err(Error::InvalidArgument);
        }
        self.check_kernel_mix(false)?;

        let walker = WalkerCmd {
            indirect: Some(arguments),
            ..self.kernel_walker(kernel, [0; 3])
        };
        let resources: Vec<_> = kernel.printf_buffer().into_iter().collect();
        self.record(
            signal,
            waits,
            Body::Kernels {
                walkers: vec![walker],
                split: false,
            },
            &resources,
        )?;
        self.note_kernel(kernel, false);
        Ok(())
    }

    /// Launch a run of kernels, each reading its group counts from consecutive
    /// records at `arguments`; `count_buffer` holds how many actually run
    pub fn append_launch_multiple_kernels_indirect(
        &mut self,
        kernels: &[Arc<Kernel>],
        count_buffer: GpuAddr,
        arguments: GpuAddr,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        self.require_compute()?;
        if kernels.is_empty()
            || count_buffer.is_null()
            || arguments.is_null()
            || !arguments.is_aligned(4)
        {
            return Err(Error::InvalidArgument);
        }
        self.check_kernel_mix(false)?;

        let walkers = kernels
            .iter()
            .enumerate()
            .map(|(i, kernel)| WalkerCmd {
                indirect: Some(arguments + i as u64 * INDIRECT_ARGS_SIZE),
                ..self.kernel_walker(kernel, [0; 3])
            })
            .collect();
        let resources: Vec<_> = kernels.iter().filter_map(|k| k.printf_buffer()).collect();
        self.record(
            signal,
            waits,
            Body::Kernels {
                walkers,
                split: true,
            },
            &resources,
        )?;
        for kernel in kernels {
            self.note_kernel(kernel, false);
        }
        Ok(())
    }

    // =========================================================================
    // Memory operations
    // =========================================================================

    /// Copy `size` bytes from `src` to `dst`
    pub fn append_memory_copy(
        &mut self,
        dst: &BufferRef,
        src: &BufferRef,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        dst.check(size)?;
        src.check(size)?;

        if self.copies_through_locked_ptr(dst, src, size) {
            return self.cpu_copy(dst, src, size, signal, waits);
        }

        let body = if self.desc.engine.is_compute() {
            self.builtin_body(dst.address(), Some(src.address()), size)
        } else {
            let mut batch = CommandBatch::new();
            self.encoder()
                .emit_blit_copy(&mut batch, dst.address(), src.address(), size);
            Body::Commands(batch)
        };
        self.record(signal, waits, body, &[dst.allocation(), src.allocation()])
    }

    /// Copy a pitched region
    pub fn append_memory_copy_region(
        &mut self,
        dst: &BufferRef,
        src: &BufferRef,
        region: CopyRegion,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        let CopyRegion {
            width,
            height,
            dst_pitch,
            src_pitch,
        } = region;
        if width == 0 || height == 0 || width > dst_pitch || width > src_pitch {
            return Err(Error::InvalidArgument);
        }
        dst.check(CopyRegion::extent(dst_pitch, width, height))?;
        src.check(CopyRegion::extent(src_pitch, width, height))?;

        let body = if self.desc.engine.is_compute() {
            let group_count = [
                (width as u64).div_ceil(BUILTIN_BYTES_PER_GROUP) as u32,
                height,
                1,
            ];
            Body::Kernels {
                walkers: vec![self.builtin_walker(group_count)],
                split: false,
            }
        } else {
            let mut batch = CommandBatch::new();
            self.encoder().emit_blit_region(
                &mut batch,
                dst.address(),
                dst_pitch,
                src.address(),
                src_pitch,
                width,
                height,
            );
            Body::Commands(batch)
        };
        self.record(signal, waits, body, &[dst.allocation(), src.allocation()])
    }

    /// Fill `size` bytes at `dst` with a repeating `pattern`
    pub fn append_memory_fill(
        &mut self,
        dst: &BufferRef,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        if pattern.is_empty() || size == 0 || size % pattern.len() as u64 != 0 {
            return Err(Error::InvalidArgument);
        }
        dst.check(size)?;

        let body = if self.desc.engine.is_compute() {
            self.builtin_body(dst.address(), None, size)
        } else {
            let mut batch = CommandBatch::new();
            self.encoder()
                .emit_blit_fill(&mut batch, dst.address(), size, pattern)?;
            Body::Commands(batch)
        };
        self.record(signal, waits, body, &[dst.allocation()])
    }

    /// Make prior writes to `ranges` visible
    pub fn append_memory_ranges_barrier(
        &mut self,
        ranges: &[MemoryRange],
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        if ranges.iter().any(|r| r.size == 0 || r.address.is_null()) {
            return Err(Error::InvalidArgument);
        }
        let mut batch = CommandBatch::new();
        if self.desc.engine.is_compute() {
            batch.push(Instruction::PipeControl {
                post_sync: PostSync::NoWrite,
                stall: true,
                dc_flush: true,
                partitioned: false,
            });
        } else {
            self.encoder().emit_flush(&mut batch, PostSync::NoWrite);
        }
        self.record(signal, waits, Body::Commands(batch), &[])
    }

    /// Write the GPU timestamp to `dst`
    pub fn append_write_global_timestamp(
        &mut self,
        dst: GpuAddr,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        if dst.is_null() || !dst.is_aligned(8) {
            return Err(Error::InvalidArgument);
        }
        let mut batch = CommandBatch::new();
        let post_sync = PostSync::WriteTimestamp { address: dst };
        if self.desc.engine.is_compute() {
            batch.push(Instruction::PipeControl {
                post_sync,
                stall: true,
                dc_flush: false,
                partitioned: false,
            });
        } else {
            self.encoder().emit_flush(&mut batch, post_sync);
        }
        self.record(signal, waits, Body::Commands(batch), &[])
    }

    /// Stall the engine until `compare(*address, value)` holds
    pub fn append_wait_on_memory(
        &mut self,
        address: GpuAddr,
        compare: CompareOp,
        value: u64,
        signal: Option<&Arc<Event>>,
    ) -> Result<()> {
        self.check_open()?;
        if address.is_null() || !address.is_aligned(4) {
            return Err(Error::InvalidArgument);
        }
        let mut batch = CommandBatch::new();
        self.encoder().emit_semaphore(&mut batch, address, value, compare);
        self.record(signal, &[], Body::Commands(batch), &[])
    }

    /// Store `value` at `address` once prior work retired
    pub fn append_write_to_memory(
        &mut self,
        address: GpuAddr,
        value: u64,
        qword: bool,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.check_open()?;
        let alignment = if qword { 8 } else { 4 };
        if address.is_null() || !address.is_aligned(alignment) || (!qword && value > u32::MAX as u64)
        {
            return Err(Error::InvalidArgument);
        }
        let mut batch = CommandBatch::new();
        batch.push(Instruction::StoreDataImm {
            address,
            value,
            qword,
            partition_offset: false,
        });
        self.record(signal, waits, Body::Commands(batch), &[])
    }

    // =========================================================================
    // Synchronization appends
    // =========================================================================

    /// Order everything after the barrier behind `waits` and prior work
    ///
    /// On an in-order list prior work is already ordered. Without a waitlist,
    /// and with no event or a counter-capable immediate-value event, the
    /// barrier records nothing and the event inherits the current counter
    /// value.
    pub fn append_barrier(&mut self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> Result<()> {
        self.check_open()?;
        if let Some(state) = &self.in_order {
            let inherits = waits.is_empty()
                && state.value > 0
                && signal.map_or(true, |e| e.kind() == EventKind::Regular && e.is_counter_based());
            if inherits {
                if let Some(event) = signal {
                    event.record_signal(&self.ctx, None, Some(state.current_binding()));
                    self.latest_flush_is_host_visible = event.is_host_visible();
                }
                log::trace!(
                    "cinder-list: barrier inherits counter value {}",
                    state.value
                );
                return Ok(());
            }
            return self.record(signal, waits, Body::Commands(CommandBatch::new()), &[]);
        }

        let mut batch = CommandBatch::new();
        if signal.is_none() {
            self.emit_engine_barrier(&mut batch, PostSync::NoWrite);
        }
        self.record(signal, waits, Body::Commands(batch), &[])
    }

    /// Signal `event` once prior work retired
    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> Result<()> {
        self.check_open()?;
        self.record(Some(event), &[], Body::Commands(CommandBatch::new()), &[])
    }

    /// Return `event` to the cleared state once prior work retired
    pub fn append_event_reset(&mut self, event: &Arc<Event>) -> Result<()> {
        self.check_open()?;
        let mut batch = CommandBatch::new();
        for packet in 0..event.max_packet_count() {
            self.encoder()
                .emit_store(&mut batch, event.completion_address(packet), STATE_CLEARED, false);
        }
        let pool = event.pool().allocation().clone();
        self.record(None, &[], Body::Commands(batch), &[&pool])?;
        event.clear_binding();
        Ok(())
    }

    /// Stall until every event in `events` is signaled
    pub fn append_wait_on_events(&mut self, events: &[Arc<Event>]) -> Result<()> {
        self.check_open()?;
        if events.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.record(None, events, Body::Commands(CommandBatch::new()), &[])
    }

    /// Advance the dependency counter without other work
    pub fn append_signal_in_order_dependency_counter(&mut self) -> Result<()> {
        self.check_open()?;
        if self.in_order.is_none() {
            return Err(Error::InvalidArgument);
        }
        self.record(None, &[], Body::Commands(CommandBatch::new()), &[])
    }

    // =========================================================================
    // Host synchronization
    // =========================================================================

    /// Wait for everything submitted so far
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        self.host_synchronize_with(timeout_ns, false)
    }

    /// Wait for everything submitted so far
    ///
    /// When the latest append signaled a host-visible event the counter page
    /// is polled; otherwise, or when `handle_post_sync` asks for post-sync
    /// processing, the wait goes through the context's task count.
    pub fn host_synchronize_with(&self, timeout_ns: u64, handle_post_sync: bool) -> Result<()> {
        let Some(task_count) = self.latest_task_count else {
            return Ok(());
        };
        let result = match &self.in_order {
            Some(state) if self.latest_flush_is_host_visible && !handle_post_sync => {
                sync::wait_for_counter(&*self.ctx, &state.counter, state.offset, state.value, timeout_ns)
            }
            _ => self.ctx.wait_for_task_count(task_count, timeout_ns),
        };
        if result.is_ok() {
            for kernel in &self.printf_kernels {
                kernel.flush_printf();
            }
        }
        result
    }

    /// Where submitted work stands, without blocking
    pub fn sync_state(&self) -> SyncState {
        if self.latest_task_count.is_none() {
            return SyncState::NotSubmitted;
        }
        SyncState::from_poll(self.host_synchronize(0))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Finish recording a regular list
    pub fn close(&mut self) -> Result<()> {
        if self.desc.list_type == ListType::Regular {
            self.closed = true;
        }
        Ok(())
    }

    /// Discard recorded work and restart the counter at zero
    pub fn reset(&mut self) {
        self.stream.reset();
        if let Some(state) = &mut self.in_order {
            state.reset();
        }
        self.contains_any_kernel = false;
        self.contains_cooperative_kernels = false;
        self.closed = false;
        self.latest_flush_is_host_visible = false;
        self.latest_task_count = None;
        self.appends = 0;
        self.submit_mark = self.stream.mark();
        self.submitted_bytes = self.stream.stats().bytes_written;
        self.printf_kernels.clear();
        log::debug!("cinder-list: list reset");
    }

    /// Whole recorded stream of a regular list
    pub(crate) fn submission(&self) -> Submission {
        Submission {
            start: self.stream.address_of(StreamMark::default()),
            bytes: self.stream.stats().bytes_written - self.submitted_bytes,
        }
    }

    /// Record a queue submission of this list
    pub(crate) fn mark_submitted(&mut self, task_count: TaskCount) {
        self.latest_task_count = Some(task_count);
    }

    // =========================================================================
    // Recording pipeline
    // =========================================================================

    fn encoder(&self) -> &'static dyn HwEncoder {
        self.device.encoder()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ListClosed)
        } else {
            Ok(())
        }
    }

    fn require_compute(&self) -> Result<()> {
        if self.desc.engine.is_compute() {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    fn check_kernel_mix(&self, cooperative: bool) -> Result<()> {
        if !self.config.allow_mixed_cooperative
            && self.contains_any_kernel
            && self.contains_cooperative_kernels != cooperative
        {
            return Err(Error::CooperativeMixing);
        }
        Ok(())
    }

    fn note_kernel(&mut self, kernel: &Arc<Kernel>, cooperative: bool) {
        self.contains_any_kernel = true;
        if cooperative {
            self.contains_cooperative_kernels = true;
        }
        if kernel.printf_buffer().is_some()
            && !self.printf_kernels.iter().any(|k| Arc::ptr_eq(k, kernel))
        {
            self.printf_kernels.push(kernel.clone());
        }
    }

    fn kernel_walker(&self, kernel: &Kernel, group_count: [u32; 3]) -> WalkerCmd {
        let entries = kernel.descriptor().binding_table_count;
        let btp_prefetch = match self.config.btp_prefetch_mode {
            BtpPrefetchMode::Default => self.encoder().default_btp_prefetch(entries),
            BtpPrefetchMode::Enabled => entries.min(MAX_BTP_PREFETCH),
            BtpPrefetchMode::Disabled => 0,
        };
        WalkerCmd {
            btp_prefetch,
            ..self.builtin_walker(group_count)
        }
    }

    fn builtin_walker(&self, group_count: [u32; 3]) -> WalkerCmd {
        WalkerCmd {
            partitioned: self.desc.partition_count > 1,
            ..WalkerCmd::new(group_count)
        }
    }

    /// Builtin copy/fill dispatches over `size` bytes at `dst`
    ///
    /// Unaligned or oversized operations are split and signal after a
    /// barrier instead of through the walker.
    fn builtin_body(&self, dst: GpuAddr, src: Option<GpuAddr>, size: u64) -> Body {
        let aligned =
            dst.is_aligned(4) && src.map_or(true, |s| s.is_aligned(4)) && size % 4 == 0;
        let max = dispatch_limit(&self.config);
        let walkers = plan_chunks(dst, size, aligned, max)
            .into_iter()
            .map(|chunk| {
                self.builtin_walker([chunk.div_ceil(BUILTIN_BYTES_PER_GROUP) as u32, 1, 1])
            })
            .collect();
        Body::Kernels {
            walkers,
            split: !aligned || size > max,
        }
    }

    /// Packets a signal of `event` writes; `None` when the counter alone
    /// carries completion
    fn event_packets(&self, event: &Event) -> Result<Option<u32>> {
        if self.in_order.is_some() && event.kind() == EventKind::Regular && event.is_counter_based() {
            return Ok(None);
        }
        let packets = if self.config.signal_all_event_packets {
            event.max_packet_count()
        } else {
            self.desc.partition_count
        };
        if packets > event.max_packet_count() {
            return Err(Error::InvalidArgument);
        }
        Ok(Some(packets))
    }

    fn needs_leading_stall(&self) -> bool {
        self.in_order.is_some()
            && self.desc.list_type == ListType::Regular
            && self.desc.engine.is_compute()
            && self.appends > 0
    }

    fn record(
        &mut self,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
        body: Body,
        resources: &[&Arc<GpuAllocation>],
    ) -> Result<()> {
        let emitter = Emitter {
            encoder: self.encoder(),
            interrupts: self.config.user_interrupt,
        };
        let packets = match signal {
            Some(event) => self.event_packets(event)?,
            None => None,
        };
        let plan = self.in_order.as_ref().map(InOrderState::plan).transpose()?;

        let mut batch = CommandBatch::new();
        if self.needs_leading_stall() {
            emitter.encoder.emit_stall(&mut batch, PostSync::NoWrite, false);
        }

        let mut waited = Vec::new();
        for event in waits {
            self.emit_event_wait(&emitter, &mut batch, event, &mut waited)?;
        }

        let packet_event = signal.zip(packets);
        match body {
            Body::Kernels { walkers, split } => {
                self.emit_kernels(&emitter, &mut batch, &walkers, split, packet_event, plan.as_ref())
            }
            Body::Commands(commands) => {
                batch.extend(commands.iter().copied());
                self.emit_command_signal(&emitter, &mut batch, packet_event, plan.as_ref());
            }
        }
        if let (Some(state), Some(plan)) = (&self.in_order, &plan) {
            emitter.finish_wrap(&mut batch, state, plan);
        }

        self.stream.append_batch(&batch)?;
        self.commit(signal, packets, plan, &waited, resources);

        if self.desc.list_type == ListType::Immediate {
            self.flush_immediate()?;
        }
        Ok(())
    }

    fn emit_event_wait(
        &self,
        emitter: &Emitter<'_>,
        batch: &mut CommandBatch,
        event: &Event,
        resident: &mut Vec<Arc<GpuAllocation>>,
    ) -> Result<()> {
        if event.is_completed_cached() {
            return Ok(());
        }
        match event.in_order_binding() {
            Some(binding) => {
                let counter = binding.counter().ok_or(Error::StaleEventBinding)?;
                if self.in_order.as_ref().is_some_and(|s| s.is_own(&binding)) {
                    return Ok(());
                }
                emitter.wait_counter(batch, &counter, binding.offset, binding.value);
                resident.push(counter.allocation().clone());
            }
            None => {
                for packet in 0..event.packets_in_use().max(1) {
                    emitter.dependency_semaphore(
                        batch,
                        event.completion_address(packet),
                        STATE_CLEARED as u64,
                        CompareOp::NotEqual,
                    );
                }
                resident.push(event.pool().allocation().clone());
            }
        }
        Ok(())
    }

    fn emit_kernels(
        &self,
        emitter: &Emitter<'_>,
        batch: &mut CommandBatch,
        walkers: &[WalkerCmd],
        split: bool,
        event: Option<(&Arc<Event>, u32)>,
        plan: Option<&SignalPlan>,
    ) {
        let encoder = emitter.encoder;
        let partitioned = self.desc.partition_count > 1;
        let Some((last, leading)) = walkers.split_last() else {
            return;
        };
        let counter = match (&self.in_order, plan) {
            (Some(state), Some(plan)) => Some((state.signal_address(plan), plan.value)),
            _ => None,
        };

        match (counter, event) {
            (Some((address, value)), Some((event, packets))) => {
                for packet in 0..packets {
                    encoder.emit_store(batch, event.completion_address(packet), STATE_CLEARED, false);
                }
                if split {
                    push_walkers(batch, walkers);
                    encoder.emit_stall(batch, event_post_sync(event), partitioned);
                    self.emit_extra_packets(batch, event, packets);
                } else {
                    push_walkers(batch, leading);
                    encoder.emit_signaling_dispatch(batch, *last, event_post_sync(event));
                    self.emit_extra_packets(batch, event, packets);
                    for packet in 0..packets {
                        emitter.dependency_semaphore(
                            batch,
                            event.completion_address(packet),
                            STATE_CLEARED as u64,
                            CompareOp::NotEqual,
                        );
                    }
                }
                emitter.counter_store(batch, address, value, partitioned);
            }
            (Some((address, value)), None) => {
                if split {
                    push_walkers(batch, walkers);
                    emitter.barrier_store(batch, address, value, partitioned);
                } else {
                    push_walkers(batch, leading);
                    encoder.emit_signaling_dispatch(
                        batch,
                        *last,
                        PostSync::WriteImmediate {
                            address,
                            value: value as u64,
                        },
                    );
                }
            }
            (None, Some((event, packets))) => {
                if split {
                    push_walkers(batch, walkers);
                    encoder.emit_stall(batch, event_post_sync(event), partitioned);
                } else {
                    push_walkers(batch, leading);
                    encoder.emit_signaling_dispatch(batch, *last, event_post_sync(event));
                }
                self.emit_extra_packets(batch, event, packets);
            }
            (None, None) => push_walkers(batch, walkers),
        }
    }

    fn emit_command_signal(
        &self,
        emitter: &Emitter<'_>,
        batch: &mut CommandBatch,
        event: Option<(&Arc<Event>, u32)>,
        plan: Option<&SignalPlan>,
    ) {
        let partitioned = self.desc.partition_count > 1;
        if let Some((event, packets)) = event {
            self.emit_engine_barrier(batch, event_post_sync(event));
            self.emit_extra_packets(batch, event, packets);
        }
        if let (Some(state), Some(plan)) = (&self.in_order, plan) {
            emitter.counter_store(batch, state.signal_address(plan), plan.value, partitioned);
        }
    }

    fn emit_engine_barrier(&self, batch: &mut CommandBatch, post_sync: PostSync) {
        if self.desc.engine.is_compute() {
            self.encoder()
                .emit_stall(batch, post_sync, self.desc.partition_count > 1);
        } else {
            self.encoder().emit_flush(batch, post_sync);
        }
    }

    /// Packets past the tiles that actually write are signaled directly
    fn emit_extra_packets(&self, batch: &mut CommandBatch, event: &Event, packets: u32) {
        for packet in self.desc.partition_count..packets {
            self.encoder()
                .emit_store(batch, event.completion_address(packet), STATE_SIGNALED, false);
        }
    }

    fn commit(
        &mut self,
        signal: Option<&Arc<Event>>,
        packets: Option<u32>,
        plan: Option<SignalPlan>,
        waited: &[Arc<GpuAllocation>],
        resources: &[&Arc<GpuAllocation>],
    ) {
        let mut binding = None;
        if let (Some(state), Some(plan)) = (self.in_order.as_mut(), plan) {
            binding = Some(state.binding_for(&plan));
            state.commit(plan);
            self.ctx.make_resident(state.counter.allocation());
        }

        match signal {
            Some(event) => {
                event.record_signal(&self.ctx, packets, binding);
                self.ctx.make_resident(event.pool().allocation());
                self.latest_flush_is_host_visible = event.is_host_visible();
            }
            None => self.latest_flush_is_host_visible = false,
        }
        for allocation in waited {
            self.ctx.make_resident(allocation);
        }
        for allocation in resources {
            self.ctx.make_resident(allocation);
        }
        self.appends += 1;
    }

    /// Submit everything recorded since the last successful flush
    ///
    /// A failed flush keeps the submit mark, so appends already recorded
    /// and counted go out with the next flush.
    fn flush_immediate(&mut self) -> Result<()> {
        let bytes_written = self.stream.stats().bytes_written;
        for buffer in self.stream.active_buffers() {
            self.ctx.make_resident(buffer);
        }
        let task_count = self.ctx.flush(Submission {
            start: self.stream.address_of(self.submit_mark),
            bytes: bytes_written - self.submitted_bytes,
        })?;
        self.latest_task_count = Some(task_count);
        self.submit_mark = self.stream.mark();
        self.submitted_bytes = bytes_written;
        Ok(())
    }

    // =========================================================================
    // CPU copy
    // =========================================================================

    fn copies_through_locked_ptr(&self, dst: &BufferRef, src: &BufferRef, size: u64) -> bool {
        self.desc.list_type == ListType::Immediate
            && self.config.copy_through_locked_ptr
            && size <= self.config.locked_copy_threshold
            && matches!(
                (src.placement(), dst.placement()),
                (Placement::Host, Placement::Device) | (Placement::Device, Placement::Host)
            )
    }

    fn cpu_copy(
        &mut self,
        dst: &BufferRef,
        src: &BufferRef,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        for event in waits {
            event.host_synchronize(u64::MAX)?;
        }
        self.host_synchronize(u64::MAX)?;

        let mut bytes = vec![0u8; size as usize];
        src.allocation.read_bytes(src.offset, &mut bytes)?;
        dst.allocation.write_bytes(dst.offset, &bytes)?;
        if let Some(event) = signal {
            event.host_signal();
        }
        log::trace!(
            "cinder-list: copied {} bytes on the host, {:?} -> {:?}",
            size,
            src.allocation.handle(),
            dst.allocation.handle()
        );
        Ok(())
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("desc", &self.desc)
            .field("in_order", &self.in_order)
            .field("contains_any_kernel", &self.contains_any_kernel)
            .field("contains_cooperative_kernels", &self.contains_cooperative_kernels)
            .field("closed", &self.closed)
            .field("latest_task_count", &self.latest_task_count)
            .field("stream", &self.stream)
            .finish()
    }
}

fn push_walkers(batch: &mut CommandBatch, walkers: &[WalkerCmd]) {
    batch.extend(walkers.iter().copied().map(Instruction::Walker));
}

/// Completion write of a packet-based event signal
fn event_post_sync(event: &Event) -> PostSync {
    match event.kind() {
        EventKind::Timestamp => PostSync::WriteTimestamp {
            address: event.packet_address(0),
        },
        EventKind::Regular => PostSync::WriteImmediate {
            address: event.packet_address(0),
            value: STATE_SIGNALED as u64,
        },
    }
}

/// Split a builtin operation into dispatch sizes
///
/// Unaligned operations get a head up to the next dword boundary of `dst`
/// and a tail holding the remainder; the dword-aligned middle is cut into
/// pieces of at most `max` bytes.
/// Largest builtin dispatch, rounded down to whole dwords
fn dispatch_limit(config: &ListConfig) -> u64 {
    config.max_dispatch_bytes & !3
}

fn plan_chunks(dst: GpuAddr, size: u64, aligned: bool, max: u64) -> Vec<u64> {
    let mut chunks = Vec::new();
    let (head, tail) = if aligned {
        (0, 0)
    } else {
        let head = ((4 - dst.raw() % 4) % 4).min(size);
        (head, (size - head) % 4)
    };
    if head > 0 {
        chunks.push(head);
    }
    let mut middle = size - head - tail;
    while middle > 0 {
        let chunk = middle.min(max);
        chunks.push(chunk);
        middle -= chunk;
    }
    if tail > 0 {
        chunks.push(tail);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SoftwareContext, SteppingClock};
    use crate::device::DeviceInfo;
    use crate::event::{EventDesc, EventPool, EventScope};
    use crate::kernel::KernelDescriptor;
    use alloc::boxed::Box;
    use cinder_cmd::InstructionKind;
    use cinder_core::{ContextId, GpuFamily, Tristate, UserInterruptMask};
    use cinder_mem::{AllocDesc, AllocationKind, HostAllocator};

    struct Fixture {
        device: Arc<Device>,
        sw: Arc<SoftwareContext>,
        ctx: Arc<dyn ExecutionContext>,
    }

    impl Fixture {
        fn new(family: GpuFamily) -> Self {
            Self::with_tiles(family, 1)
        }

        fn with_tiles(family: GpuFamily, tiles: u32) -> Self {
            let device = Device::new(
                DeviceInfo::new(family).with_tiles(tiles),
                Arc::new(HostAllocator::unbounded()),
                Arc::new(SteppingClock::new(1)),
            )
            .unwrap();
            let sw = Arc::new(SoftwareContext::with_clock(
                ContextId(0),
                Box::new(SteppingClock::new(1)),
            ));
            let ctx: Arc<dyn ExecutionContext> = sw.clone();
            Self { device, sw, ctx }
        }

        fn list(&self, desc: ListDesc, config: ListConfig) -> CommandList {
            CommandList::new(self.device.clone(), self.ctx.clone(), desc, config).unwrap()
        }

        fn immediate(&self) -> CommandList {
            self.list(ListDesc::immediate(EngineType::Compute), ListConfig::default())
        }

        fn kernel(&self) -> Arc<Kernel> {
            Kernel::new(&self.device, KernelDescriptor::new("k").with_binding_table(8)).unwrap()
        }

        fn pool(&self, kind: EventKind, packets: u32) -> Arc<EventPool> {
            EventPool::new(&self.device, kind, 8, packets).unwrap()
        }

        fn buffer(&self, size: u64, placement: Placement) -> Arc<GpuAllocation> {
            self.device
                .allocator()
                .allocate(&AllocDesc::new(AllocationKind::UserBuffer, size).placed(placement))
                .unwrap()
        }
    }

    fn groups() -> GroupCount {
        GroupCount::new(4, 1, 1)
    }

    fn since(list: &CommandList, mark: StreamMark) -> Vec<Instruction> {
        list.stream().instructions_since(mark).unwrap()
    }

    fn kinds(insts: &[Instruction]) -> Vec<InstructionKind> {
        insts.iter().map(Instruction::kind).collect()
    }

    fn count(insts: &[Instruction], kind: InstructionKind) -> usize {
        insts.iter().filter(|i| i.kind() == kind).count()
    }

    fn host_event(pool: &Arc<EventPool>, index: u32) -> Arc<Event> {
        pool.create_event(index, EventDesc::new().with_scope(EventScope::HOST))
            .unwrap()
    }

    // =========================================================================
    // Counter protocol
    // =========================================================================

    #[test]
    fn test_counter_matches_append_count() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let base = list.counter_allocation().unwrap().gpu_address();

        for i in 1..=3u32 {
            let mark = list.stream().mark();
            list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
            assert_eq!(list.dependency_counter(), i);
            match since(&list, mark).as_slice() {
                [Instruction::Walker(w)] => assert_eq!(
                    w.post_sync,
                    PostSync::WriteImmediate {
                        address: base,
                        value: i as u64
                    }
                ),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(fx.sw.stats().flushes, 3);
        assert_eq!(list.latest_task_count(), Some(3));
    }

    #[test]
    fn test_wait_on_own_previous_event_is_elided() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        assert!(event.is_in_order_exec_event());
        assert_eq!(event.in_order_exec_signal_value(), 1);

        let mark = list.stream().mark();
        list.append_launch_kernel(&kernel, groups(), None, &[event.clone()])
            .unwrap();
        assert_eq!(count(&since(&list, mark), InstructionKind::SemaphoreWait), 0);
        assert_eq!(list.dependency_counter(), 2);
    }

    #[test]
    fn test_wait_on_own_event_from_before_wrap_is_elided() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        assert_eq!(event.in_order_allocation_offset(), 0);
        if let Some(state) = list.in_order.as_mut() {
            state.value = u32::MAX - 1;
        }
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        assert_eq!(list.allocation_offset(), 8);

        let mark = list.stream().mark();
        list.append_wait_on_events(&[event.clone()]).unwrap();
        assert_eq!(count(&since(&list, mark), InstructionKind::SemaphoreWait), 0);
    }

    #[test]
    fn test_cross_list_wait_emits_semaphore() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut producer = fx.immediate();
        let mut consumer = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        producer
            .append_launch_kernel(&kernel, groups(), Some(&event), &[])
            .unwrap();
        let counter = producer.counter_allocation().unwrap().clone();
        assert_eq!(fx.sw.residency().residency_count(counter.handle()), 1);

        let mark = consumer.stream().mark();
        consumer
            .append_launch_kernel(&kernel, groups(), None, &[event.clone()])
            .unwrap();
        let insts = since(&consumer, mark);
        assert_eq!(
            insts[0],
            Instruction::SemaphoreWait {
                address: counter.gpu_address(),
                value: 1,
                compare: CompareOp::GreaterOrEqual
            }
        );
        assert_eq!(insts[1].kind(), InstructionKind::Walker);
        assert_eq!(fx.sw.residency().residency_count(counter.handle()), 2);
    }

    #[test]
    fn test_wait_after_list_reset_is_not_elided() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        list.reset();
        assert_eq!(list.dependency_counter(), 0);

        let mark = list.stream().mark();
        list.append_launch_kernel(&kernel, groups(), None, &[event.clone()])
            .unwrap();
        assert_eq!(count(&since(&list, mark), InstructionKind::SemaphoreWait), 1);
    }

    #[test]
    fn test_wait_on_reset_event_uses_packets() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut producer = fx.immediate();
        let mut consumer = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        producer
            .append_launch_kernel(&kernel, groups(), Some(&event), &[])
            .unwrap();
        event.reset();

        let mark = consumer.stream().mark();
        consumer
            .append_launch_kernel(&kernel, groups(), None, &[event.clone()])
            .unwrap();
        assert_eq!(
            since(&consumer, mark)[0],
            Instruction::SemaphoreWait {
                address: event.completion_address(0),
                value: STATE_CLEARED as u64,
                compare: CompareOp::NotEqual
            }
        );
        assert_eq!(
            fx.sw.residency().residency_count(pool.allocation().handle()),
            2
        );
    }

    #[test]
    fn test_overflow_restarts_at_next_offset() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();
        let base = list.counter_allocation().unwrap().gpu_address();
        if let Some(state) = list.in_order.as_mut() {
            state.value = u32::MAX - 1;
        }

        let mark = list.stream().mark();
        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();

        let insts = since(&list, mark);
        assert_eq!(
            kinds(&insts),
            vec![
                InstructionKind::Walker,
                InstructionKind::SemaphoreWait,
                InstructionKind::StoreDataImm
            ]
        );
        match insts[0] {
            Instruction::Walker(w) => assert_eq!(
                w.post_sync,
                PostSync::WriteImmediate {
                    address: base,
                    value: u32::MAX as u64
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            insts[1],
            Instruction::SemaphoreWait {
                address: base,
                value: u32::MAX as u64,
                compare: CompareOp::GreaterOrEqual
            }
        );
        assert_eq!(
            insts[2],
            Instruction::StoreDataImm {
                address: base + 8,
                value: 1,
                qword: false,
                partition_offset: false
            }
        );
        assert_eq!(list.dependency_counter(), 1);
        assert_eq!(list.allocation_offset(), 8);
        assert_eq!(event.in_order_exec_signal_value(), 1);
        assert_eq!(event.in_order_allocation_offset(), 8);
    }

    #[test]
    fn test_exhausted_counter_leaves_list_untouched() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let last = list.counter_allocation().unwrap().allocation().size() - 8;
        if let Some(state) = list.in_order.as_mut() {
            state.value = u32::MAX - 1;
            state.offset = last;
        }

        let mark = list.stream().mark();
        assert_eq!(
            list.append_launch_kernel(&kernel, groups(), None, &[]),
            Err(Error::CounterSpaceExhausted)
        );
        assert!(list.stream().is_empty_since(mark));
        assert_eq!(list.dependency_counter(), u32::MAX - 1);
        assert_eq!(list.allocation_offset(), last);
        assert_eq!(fx.sw.stats().flushes, 0);
    }

    #[test]
    fn test_multi_tile_signal_and_wait() {
        let fx = Fixture::with_tiles(GpuFamily::XeHp, 2);
        let desc = ListDesc::immediate(EngineType::Compute).with_partitions(2);
        let mut producer = fx.list(desc, ListConfig::default());
        let mut consumer = fx.list(desc, ListConfig::default());
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 2);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        let mark = producer.stream().mark();
        producer
            .append_launch_kernel(&kernel, groups(), Some(&event), &[])
            .unwrap();
        match since(&producer, mark)[0] {
            Instruction::Walker(w) => {
                assert!(w.partitioned);
                assert!(w.post_sync.writes());
            }
            other => panic!("unexpected {:?}", other),
        }

        let counter = producer.counter_allocation().unwrap().clone();
        let mark = consumer.stream().mark();
        consumer
            .append_launch_kernel(&kernel, groups(), None, &[event.clone()])
            .unwrap();
        let insts = since(&consumer, mark);
        assert_eq!(count(&insts, InstructionKind::SemaphoreWait), 2);
        assert_eq!(
            insts[1],
            Instruction::SemaphoreWait {
                address: counter.gpu_address() + 8,
                value: 1,
                compare: CompareOp::GreaterOrEqual
            }
        );

        counter.write_value(0, 0, 1);
        assert_eq!(event.query_status(), Err(Error::NotReady));
        counter.write_value(0, 1, 1);
        assert_eq!(event.query_status(), Ok(()));
    }

    #[test]
    fn test_multi_tile_host_synchronize_needs_every_partition() {
        let fx = Fixture::with_tiles(GpuFamily::XeHp, 2);
        let desc = ListDesc::immediate(EngineType::Compute).with_partitions(2);
        let mut list = fx.list(desc, ListConfig::default());
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 2);
        let event = host_event(&pool, 0);

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        assert!(list.latest_flush_is_host_visible());
        let counter = list.counter_allocation().unwrap().clone();

        counter.write_value(0, 0, 1);
        assert_eq!(list.host_synchronize(0), Err(Error::NotReady));
        counter.write_value(0, 1, 1);
        assert_eq!(list.host_synchronize(0), Ok(()));
        assert_eq!(fx.sw.stats().task_count_waits, 0);
    }

    #[test]
    fn test_failed_flush_resubmits_with_next_append() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();

        fx.sw.set_hang(true);
        assert_eq!(
            list.append_launch_kernel(&kernel, groups(), None, &[]),
            Err(Error::DeviceLost)
        );
        assert_eq!(list.dependency_counter(), 1);
        assert_eq!(list.latest_task_count(), None);
        assert_eq!(list.submitted_bytes, 0);
        let pending = list.stream().stats().bytes_written;
        assert!(pending > 0);

        fx.sw.set_hang(false);
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        assert_eq!(list.dependency_counter(), 2);
        assert_eq!(list.latest_task_count(), Some(1));
        assert_eq!(fx.sw.stats().flushes, 1);
        assert!(list.submitted_bytes > pending);
        assert_eq!(list.submitted_bytes, list.stream().stats().bytes_written);
    }

    #[test]
    fn test_counter_residency_per_append() {
        let fx = Fixture::new(GpuFamily::XeHpc);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let handle = list.counter_allocation().unwrap().handle();

        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        assert_eq!(fx.sw.residency().residency_count(handle), 1);
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        assert_eq!(fx.sw.residency().residency_count(handle), 2);
    }

    // =========================================================================
    // Events on kernel launches
    // =========================================================================

    #[test]
    fn test_timestamp_event_chaining() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Timestamp, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();
        let counter = list.counter_allocation().unwrap().gpu_address();

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            insts[0],
            Instruction::StoreDataImm {
                address: event.completion_address(0),
                value: STATE_CLEARED as u64,
                qword: false,
                partition_offset: false
            }
        );
        match insts[1] {
            Instruction::Walker(w) => assert_eq!(
                w.post_sync,
                PostSync::WriteTimestamp {
                    address: event.packet_address(0)
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            insts[2],
            Instruction::SemaphoreWait {
                address: event.completion_address(0),
                value: STATE_CLEARED as u64,
                compare: CompareOp::NotEqual
            }
        );
        assert_eq!(
            insts[3],
            Instruction::StoreDataImm {
                address: counter,
                value: 1,
                qword: false,
                partition_offset: false
            }
        );
        assert_eq!(insts.len(), 4);

        // Counter capable, so bound as well
        assert!(event.is_in_order_exec_event());
        assert_eq!(event.packets_in_use(), 1);
    }

    #[test]
    fn test_regular_packet_event_chaining() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool
            .create_event(0, EventDesc::new().with_counter_based(false))
            .unwrap();

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            kinds(&insts),
            vec![
                InstructionKind::StoreDataImm,
                InstructionKind::Walker,
                InstructionKind::SemaphoreWait,
                InstructionKind::StoreDataImm
            ]
        );
        match insts[1] {
            Instruction::Walker(w) => assert_eq!(
                w.post_sync,
                PostSync::WriteImmediate {
                    address: event.packet_address(0),
                    value: STATE_SIGNALED as u64
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!event.is_in_order_exec_event());
    }

    #[test]
    fn test_signal_all_event_packets() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_signal_all_event_packets(true);
        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Timestamp, 3);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        // 3 clears, walker, 2 direct signals, 3 semaphores, counter
        assert_eq!(insts.len(), 10);
        assert_eq!(count(&insts, InstructionKind::SemaphoreWait), 3);
        assert_eq!(event.packets_in_use(), 3);
    }

    // =========================================================================
    // Split dispatches
    // =========================================================================

    #[test]
    fn test_unaligned_copy_signals_after_barrier() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let dst = BufferRef::new(fx.buffer(64, Placement::Device), 1);
        let src = BufferRef::start(fx.buffer(64, Placement::Device));
        let counter = list.counter_allocation().unwrap().gpu_address();

        list.append_memory_copy(&dst, &src, 15, None, &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            kinds(&insts),
            vec![
                InstructionKind::Walker,
                InstructionKind::Walker,
                InstructionKind::PipeControl,
                InstructionKind::StoreDataImm
            ]
        );
        for inst in &insts[..2] {
            match inst {
                Instruction::Walker(w) => assert_eq!(w.post_sync, PostSync::NoWrite),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            insts[3],
            Instruction::StoreDataImm {
                address: counter,
                value: 1,
                qword: false,
                partition_offset: false
            }
        );
    }

    #[test]
    fn test_split_copy_clears_event_packets_first() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let dst = BufferRef::new(fx.buffer(64, Placement::Device), 1);
        let src = BufferRef::start(fx.buffer(64, Placement::Device));
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_memory_copy(&dst, &src, 15, Some(&event), &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            kinds(&insts),
            vec![
                InstructionKind::StoreDataImm,
                InstructionKind::Walker,
                InstructionKind::Walker,
                InstructionKind::PipeControl,
                InstructionKind::StoreDataImm
            ]
        );
        assert_eq!(
            insts[0],
            Instruction::StoreDataImm {
                address: event.completion_address(0),
                value: STATE_CLEARED as u64,
                qword: false,
                partition_offset: false
            }
        );
        assert_eq!(event.in_order_exec_signal_value(), 1);
    }

    #[test]
    fn test_gen12lp_split_folds_store_into_barrier() {
        let fx = Fixture::new(GpuFamily::Gen12Lp);
        let mut list = fx.immediate();
        let dst = BufferRef::new(fx.buffer(64, Placement::Device), 2);

        list.append_memory_fill(&dst, &[0xab], 7, None, &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(count(&insts, InstructionKind::StoreDataImm), 0);
        match insts.last() {
            Some(Instruction::PipeControl { post_sync, .. }) => assert_eq!(
                post_sync.address(),
                Some(list.counter_allocation().unwrap().gpu_address())
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oversized_aligned_copy_is_split() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_max_dispatch_bytes(64);
        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let dst = BufferRef::start(fx.buffer(256, Placement::Device));
        let src = BufferRef::start(fx.buffer(256, Placement::Device));

        list.append_memory_copy(&dst, &src, 256, None, &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(count(&insts, InstructionKind::Walker), 4);
        assert_eq!(count(&insts, InstructionKind::PipeControl), 1);
        assert_eq!(count(&insts, InstructionKind::StoreDataImm), 1);
    }

    #[test]
    fn test_dispatch_limit_rounds_to_dwords() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_max_dispatch_bytes(66);
        assert_eq!(dispatch_limit(&config), 64);
        assert_eq!(
            plan_chunks(GpuAddr::new(0x1001), 135, false, dispatch_limit(&config)),
            vec![3, 64, 64, 4]
        );

        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let dst = BufferRef::start(fx.buffer(256, Placement::Device));
        let src = BufferRef::start(fx.buffer(256, Placement::Device));
        list.append_memory_copy(&dst, &src, 256, None, &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(count(&insts, InstructionKind::Walker), 4);

        let too_small = ListConfig::default().with_max_dispatch_bytes(3);
        assert!(matches!(
            CommandList::new(
                fx.device.clone(),
                fx.ctx.clone(),
                ListDesc::immediate(EngineType::Compute),
                too_small
            ),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn test_aligned_copy_signals_through_walker() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let dst = BufferRef::start(fx.buffer(256, Placement::Device));
        let src = BufferRef::start(fx.buffer(256, Placement::Device));

        list.append_memory_copy(&dst, &src, 256, None, &[]).unwrap();
        match list.stream().instructions().unwrap().as_slice() {
            [Instruction::Walker(w)] => {
                assert_eq!(w.group_count, [4, 1, 1]);
                assert!(w.post_sync.writes());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_multiple_kernels_indirect_is_split() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernels = [fx.kernel(), fx.kernel()];
        let args = GpuAddr::new(0x8000_0000);

        list.append_launch_multiple_kernels_indirect(
            &kernels,
            GpuAddr::new(0x9000_0000),
            args,
            None,
            &[],
        )
        .unwrap();
        let insts = list.stream().instructions().unwrap();
        match insts[1] {
            Instruction::Walker(w) => {
                assert_eq!(w.indirect, Some(args + INDIRECT_ARGS_SIZE));
                assert_eq!(w.post_sync, PostSync::NoWrite);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(count(&insts, InstructionKind::PipeControl), 1);
        assert_eq!(count(&insts, InstructionKind::StoreDataImm), 1);
    }

    #[test]
    fn test_indirect_launch_reads_arguments() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let args = GpuAddr::new(0x8000_0000);

        assert_eq!(
            list.append_launch_kernel_indirect(&kernel, args + 2, None, &[]),
            Err(Error::InvalidArgument)
        );
        list.append_launch_kernel_indirect(&kernel, args, None, &[])
            .unwrap();
        match list.stream().instructions().unwrap().as_slice() {
            [Instruction::Walker(w)] => {
                assert_eq!(w.indirect, Some(args));
                assert_eq!(w.group_count, [0; 3]);
                assert!(w.post_sync.writes());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(list.dependency_counter(), 1);
    }

    #[test]
    fn test_copy_region_per_engine() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let dst = BufferRef::start(fx.buffer(1024, Placement::Device));
        let src = BufferRef::start(fx.buffer(1024, Placement::Device));
        let region = CopyRegion {
            width: 100,
            height: 4,
            dst_pitch: 128,
            src_pitch: 256,
        };

        let mut compute = fx.immediate();
        compute
            .append_memory_copy_region(&dst, &src, region, None, &[])
            .unwrap();
        match compute.stream().instructions().unwrap()[0] {
            Instruction::Walker(w) => assert_eq!(w.group_count, [2, 4, 1]),
            other => panic!("unexpected {:?}", other),
        }

        let mut copy = fx.list(ListDesc::immediate(EngineType::Copy), ListConfig::default());
        copy.append_memory_copy_region(&dst, &src, region, None, &[])
            .unwrap();
        let insts = copy.stream().instructions().unwrap();
        assert_eq!(
            insts[0],
            Instruction::CopyBlt {
                dst: dst.address(),
                src: src.address(),
                width: 100,
                height: 4,
                dst_pitch: 128,
                src_pitch: 256
            }
        );
        assert_eq!(insts[1].kind(), InstructionKind::StoreDataImm);

        let too_tall = CopyRegion {
            height: 8,
            ..region
        };
        assert_eq!(
            copy.append_memory_copy_region(&dst, &src, too_tall, None, &[]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(copy.dependency_counter(), 1);
    }

    #[test]
    fn test_chunk_plan() {
        assert_eq!(plan_chunks(GpuAddr::new(0x1001), 15, false, 1 << 20), vec![3, 12]);
        assert_eq!(plan_chunks(GpuAddr::new(0x1001), 17, false, 8), vec![3, 8, 4, 2]);
        assert_eq!(plan_chunks(GpuAddr::new(0x1001), 2, false, 8), vec![2]);
        assert_eq!(plan_chunks(GpuAddr::new(0x1000), 20, true, 8), vec![8, 8, 4]);
    }

    // =========================================================================
    // Copy engine
    // =========================================================================

    #[test]
    fn test_copy_engine_copy_then_store() {
        let fx = Fixture::new(GpuFamily::XeHpc);
        let mut list = fx.list(ListDesc::immediate(EngineType::Copy), ListConfig::default());
        let dst = BufferRef::start(fx.buffer(128, Placement::Device));
        let src = BufferRef::start(fx.buffer(128, Placement::Device));

        list.append_memory_copy(&dst, &src, 100, None, &[]).unwrap();
        list.append_memory_fill(&dst, &[7], 128, None, &[]).unwrap();
        assert_eq!(
            kinds(&list.stream().instructions().unwrap()),
            vec![
                InstructionKind::CopyBlt,
                InstructionKind::StoreDataImm,
                InstructionKind::MemSet,
                InstructionKind::StoreDataImm
            ]
        );
        assert_eq!(list.dependency_counter(), 2);
    }

    #[test]
    fn test_copy_engine_event_uses_flush() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.list(ListDesc::immediate(EngineType::Copy), ListConfig::default());
        let pool = fx.pool(EventKind::Timestamp, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();
        let dst = BufferRef::start(fx.buffer(64, Placement::Device));
        let src = BufferRef::start(fx.buffer(64, Placement::Device));

        list.append_memory_copy(&dst, &src, 64, Some(&event), &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            insts[1],
            Instruction::FlushDw {
                post_sync: PostSync::WriteTimestamp {
                    address: event.packet_address(0)
                }
            }
        );
        assert_eq!(insts[2].kind(), InstructionKind::StoreDataImm);
    }

    #[test]
    fn test_rejected_fill_leaves_list_untouched() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.list(ListDesc::immediate(EngineType::Copy), ListConfig::default());
        let dst = BufferRef::start(fx.buffer(96, Placement::Device));
        let kernel = fx.kernel();

        assert_eq!(
            list.append_memory_fill(&dst, &[1, 2, 3], 96, None, &[]),
            Err(Error::NotSupported)
        );
        assert_eq!(
            list.append_launch_kernel(&kernel, groups(), None, &[]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(list.stream().used(), 0);
        assert_eq!(list.dependency_counter(), 0);
    }

    // =========================================================================
    // Barriers and non-kernel appends
    // =========================================================================

    #[test]
    fn test_barrier_inherits_counter() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        let mark = list.stream().mark();
        list.append_barrier(Some(&event), &[]).unwrap();
        list.append_barrier(None, &[]).unwrap();

        assert!(list.stream().is_empty_since(mark));
        assert_eq!(list.dependency_counter(), 1);
        assert_eq!(event.in_order_exec_signal_value(), 1);
        assert_eq!(fx.sw.stats().flushes, 1);
    }

    #[test]
    fn test_barrier_on_fresh_list_signals() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        list.append_barrier(None, &[]).unwrap();
        assert_eq!(
            kinds(&list.stream().instructions().unwrap()),
            vec![InstructionKind::StoreDataImm]
        );
        assert_eq!(list.dependency_counter(), 1);
    }

    #[test]
    fn test_barrier_waits_only_on_foreign_events() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut other = fx.immediate();
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let foreign = pool.create_event(0, EventDesc::new()).unwrap();
        let own = pool.create_event(1, EventDesc::new()).unwrap();
        let signal = pool.create_event(2, EventDesc::new()).unwrap();

        other
            .append_launch_kernel(&kernel, groups(), Some(&foreign), &[])
            .unwrap();
        list.append_launch_kernel(&kernel, groups(), Some(&own), &[]).unwrap();

        let mark = list.stream().mark();
        list.append_barrier(Some(&signal), &[foreign.clone(), own.clone()])
            .unwrap();
        assert_eq!(
            kinds(&since(&list, mark)),
            vec![InstructionKind::SemaphoreWait, InstructionKind::StoreDataImm]
        );
        assert_eq!(signal.in_order_exec_signal_value(), 2);
    }

    #[test]
    fn test_timestamp_barrier_writes_packet_then_counter() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Timestamp, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        let mark = list.stream().mark();
        list.append_barrier(Some(&event), &[]).unwrap();
        let insts = since(&list, mark);
        match insts[0] {
            Instruction::PipeControl { post_sync, stall, .. } => {
                assert!(stall);
                assert_eq!(
                    post_sync,
                    PostSync::WriteTimestamp {
                        address: event.packet_address(0)
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        match insts[1] {
            Instruction::StoreDataImm { value, .. } => assert_eq!(value, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_kernel_appends_advance_counter() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();
        let target = fx.buffer(64, Placement::Device).gpu_address();
        let range = MemoryRange {
            address: target,
            size: 64,
        };

        list.append_memory_ranges_barrier(&[range], None, &[]).unwrap();
        list.append_write_global_timestamp(target, None, &[]).unwrap();
        list.append_wait_on_memory(target, CompareOp::Equal, 3, None).unwrap();
        list.append_write_to_memory(target + 8, 1 << 40, true, None, &[])
            .unwrap();
        list.append_signal_event(&event).unwrap();
        list.append_signal_in_order_dependency_counter().unwrap();
        list.append_wait_on_events(&[event.clone()]).unwrap();
        list.append_event_reset(&event).unwrap();
        assert_eq!(list.dependency_counter(), 8);
        assert!(!event.is_in_order_exec_event());

        assert_eq!(
            list.append_write_global_timestamp(target + 4, None, &[]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            list.append_write_to_memory(target, 1 << 40, false, None, &[]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(list.append_wait_on_events(&[]), Err(Error::InvalidArgument));
        assert_eq!(list.dependency_counter(), 8);
    }

    #[test]
    fn test_event_reset_append_clears_packets() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let pool = fx.pool(EventKind::Regular, 2);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        list.append_signal_event(&event).unwrap();
        assert!(event.is_in_order_exec_event());

        let mark = list.stream().mark();
        list.append_event_reset(&event).unwrap();
        let insts = since(&list, mark);
        assert_eq!(
            insts[1],
            Instruction::StoreDataImm {
                address: event.completion_address(1),
                value: STATE_CLEARED as u64,
                qword: false,
                partition_offset: false
            }
        );
        assert_eq!(count(&insts, InstructionKind::StoreDataImm), 3);
        assert!(!event.is_in_order_exec_event());
        assert_eq!(event.in_order_exec_signal_value(), 0);
    }

    // =========================================================================
    // Debug switches
    // =========================================================================

    #[test]
    fn test_user_interrupt_mask() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let foreign = pool.create_event(0, EventDesc::new()).unwrap();
        let mut producer = fx.immediate();
        producer
            .append_launch_kernel(&kernel, groups(), Some(&foreign), &[])
            .unwrap();

        let interrupts = |mask: UserInterruptMask| {
            let config = ListConfig::default().with_user_interrupt(mask);
            let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
            list.append_barrier(None, &[foreign.clone()]).unwrap();
            count(&list.stream().instructions().unwrap(), InstructionKind::UserInterrupt)
        };

        assert_eq!(interrupts(UserInterruptMask::AFTER_SEMAPHORE), 1);
        assert_eq!(interrupts(UserInterruptMask::ON_SIGNALING_FENCE), 1);
        assert_eq!(interrupts(UserInterruptMask::from_raw(1 << 4)), 0);
        assert_eq!(interrupts(UserInterruptMask::all()), 2);
    }

    #[test]
    fn test_btp_prefetch_modes() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let kernel = Kernel::new(
            &fx.device,
            KernelDescriptor::new("bt").with_binding_table(40),
        )
        .unwrap();

        let prefetch = |mode: BtpPrefetchMode| {
            let config = ListConfig::default().with_btp_prefetch(mode);
            let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
            list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
            match list.stream().instructions().unwrap()[0] {
                Instruction::Walker(w) => w.btp_prefetch,
                other => panic!("unexpected {:?}", other),
            }
        };

        assert_eq!(prefetch(BtpPrefetchMode::Default), MAX_BTP_PREFETCH);
        assert_eq!(prefetch(BtpPrefetchMode::Enabled), MAX_BTP_PREFETCH);
        assert_eq!(prefetch(BtpPrefetchMode::Disabled), 0);
    }

    #[test]
    fn test_cooperative_mixing() {
        let fx = Fixture::new(GpuFamily::XeHpc);
        let kernel = fx.kernel();

        let mut list = fx.immediate();
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        assert_eq!(
            list.append_launch_cooperative_kernel(&kernel, groups(), None, &[]),
            Err(Error::CooperativeMixing)
        );
        assert!(!list.contains_cooperative_kernels());

        let mut coop = fx.immediate();
        coop.append_launch_cooperative_kernel(&kernel, groups(), None, &[])
            .unwrap();
        assert_eq!(
            coop.append_launch_kernel(&kernel, groups(), None, &[]),
            Err(Error::CooperativeMixing)
        );

        let config = ListConfig::default().with_mixed_cooperative(true);
        let mut mixed = fx.list(ListDesc::immediate(EngineType::Compute), config);
        mixed.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        mixed
            .append_launch_cooperative_kernel(&kernel, groups(), None, &[])
            .unwrap();
        assert!(mixed.contains_any_kernel());
        assert!(mixed.contains_cooperative_kernels());
    }

    #[test]
    fn test_cooperative_group_limit() {
        let fx = Fixture::new(GpuFamily::XeHpc);
        let kernel = fx.kernel();
        let max = fx.device.max_cooperative_group_count(&kernel);
        let mut list = fx.immediate();

        assert_eq!(
            list.append_launch_cooperative_kernel(&kernel, GroupCount::new(max, 2, 1), None, &[]),
            Err(Error::GroupCountExceeded {
                requested: max as u64 * 2,
                max
            })
        );
        list.append_launch_cooperative_kernel(&kernel, GroupCount::new(max, 1, 1), None, &[])
            .unwrap();
        match list.stream().instructions().unwrap()[0] {
            Instruction::Walker(w) => assert!(w.cooperative),
            other => panic!("unexpected {:?}", other),
        }
    }

    // =========================================================================
    // Regular lists and lifecycle
    // =========================================================================

    #[test]
    fn test_regular_list_leading_stall() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let kernel = fx.kernel();
        let mut list = fx.list(ListDesc::regular(EngineType::Compute), ListConfig::default());

        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            kinds(&insts),
            vec![
                InstructionKind::Walker,
                InstructionKind::PipeControl,
                InstructionKind::Walker
            ]
        );
        assert_eq!(
            insts[1],
            Instruction::PipeControl {
                post_sync: PostSync::NoWrite,
                stall: true,
                dc_flush: false,
                partitioned: false
            }
        );
        assert_eq!(fx.sw.stats().flushes, 0);

        let dst = BufferRef::start(fx.buffer(64, Placement::Device));
        let src = BufferRef::start(fx.buffer(64, Placement::Device));
        let mut copy = fx.list(ListDesc::regular(EngineType::Copy), ListConfig::default());
        copy.append_memory_copy(&dst, &src, 64, None, &[]).unwrap();
        copy.append_memory_copy(&dst, &src, 64, None, &[]).unwrap();
        let insts = copy.stream().instructions().unwrap();
        assert_eq!(count(&insts, InstructionKind::PipeControl), 0);
        assert_eq!(count(&insts, InstructionKind::StoreDataImm), 2);
    }

    #[test]
    fn test_closed_list_rejects_appends() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let kernel = fx.kernel();
        let mut list = fx.list(ListDesc::regular(EngineType::Compute), ListConfig::default());
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        list.close().unwrap();

        assert_eq!(
            list.append_launch_kernel(&kernel, groups(), None, &[]),
            Err(Error::ListClosed)
        );
        list.reset();
        assert!(!list.is_closed());
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
    }

    #[test]
    fn test_reset_zeroes_counter() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();

        let counter = list.counter_allocation().unwrap().clone();
        counter.write_value(0, 0, 2);
        let generation = counter.generation();

        list.reset();
        assert_eq!(list.dependency_counter(), 0);
        assert_eq!(list.allocation_offset(), 0);
        assert_eq!(counter.host_value(0, 0), 0);
        assert_eq!(counter.generation(), generation + 1);
        assert_eq!(list.stream().used(), 0);
        assert!(!list.contains_any_kernel());
        assert_eq!(list.sync_state(), SyncState::NotSubmitted);
    }

    #[test]
    fn test_forced_out_of_order_list_uses_packets() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_in_order(Tristate::ForceOff);
        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = pool.create_event(0, EventDesc::new()).unwrap();

        assert!(!list.is_in_order());
        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        list.append_barrier(None, &[event.clone()]).unwrap();

        let insts = list.stream().instructions().unwrap();
        assert_eq!(
            kinds(&insts),
            vec![
                InstructionKind::Walker,
                InstructionKind::SemaphoreWait,
                InstructionKind::PipeControl
            ]
        );
        assert!(!event.is_in_order_exec_event());
        assert_eq!(
            list.append_signal_in_order_dependency_counter(),
            Err(Error::InvalidArgument)
        );

        fx.sw.complete_all();
        assert_eq!(list.host_synchronize(0), Ok(()));
        assert_eq!(fx.sw.stats().task_count_waits, 1);
    }

    // =========================================================================
    // Host synchronization
    // =========================================================================

    #[test]
    fn test_host_synchronize_polls_counter() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = host_event(&pool, 0);

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        assert!(list.latest_flush_is_host_visible());

        assert_eq!(list.host_synchronize(0), Err(Error::NotReady));
        let stats = fx.sw.stats();
        assert_eq!(stats.downloads, 1);
        assert_eq!(stats.hang_checks, 1);

        fx.sw.reset_stats();
        let counter = list.counter_allocation().unwrap().clone();
        fx.sw.set_download_hook(Box::new(move |_, n| {
            if n == 3 {
                counter.signal_all(0, 1);
            }
        }));
        assert_eq!(list.host_synchronize(u64::MAX), Ok(()));
        let stats = fx.sw.stats();
        assert_eq!(stats.downloads, 3);
        assert_eq!(stats.hang_checks, 2);
        assert_eq!(stats.task_count_waits, 0);
        assert_eq!(list.sync_state(), SyncState::Completed);
    }

    #[test]
    fn test_host_synchronize_falls_back_to_task_count() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = host_event(&pool, 0);

        assert_eq!(list.host_synchronize(0), Ok(()));
        assert_eq!(list.sync_state(), SyncState::NotSubmitted);

        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        assert_eq!(list.sync_state(), SyncState::SubmittedPending);
        fx.sw.complete_all();
        assert_eq!(list.host_synchronize(u64::MAX), Ok(()));
        assert_eq!(fx.sw.stats().downloads, 0);

        // Host-visible event, but post-sync handling requested
        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        fx.sw.complete_all();
        fx.sw.reset_stats();
        assert_eq!(list.host_synchronize_with(u64::MAX, true), Ok(()));
        let stats = fx.sw.stats();
        assert_eq!(stats.task_count_waits, 1);
        assert_eq!(stats.last_waited_task_count, 2);
        assert_eq!(stats.downloads, 0);
    }

    #[test]
    fn test_host_synchronize_reports_hang() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let event = host_event(&pool, 0);

        list.append_launch_kernel(&kernel, groups(), Some(&event), &[]).unwrap();
        fx.sw.set_hang(true);
        assert_eq!(list.host_synchronize(u64::MAX), Err(Error::DeviceLost));
        assert_eq!(list.sync_state(), SyncState::DeviceLost);
    }

    #[test]
    fn test_cpu_copy_through_locked_ptr() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_copy_through_locked_ptr(true);
        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let launched = host_event(&pool, 0);
        let ready = pool.create_event(1, EventDesc::new()).unwrap();
        let done = pool.create_event(2, EventDesc::new()).unwrap();
        ready.host_signal();

        list.append_launch_kernel(&kernel, groups(), Some(&launched), &[])
            .unwrap();
        let counter = list.counter_allocation().unwrap().clone();
        fx.sw.set_download_hook(Box::new(move |_, n| {
            if n == 3 {
                counter.signal_all(0, 1);
            }
        }));

        let src = BufferRef::start(fx.buffer(64, Placement::Host));
        let dst = BufferRef::start(fx.buffer(64, Placement::Device));
        src.allocation().write_bytes(0, &[0x5a; 64]).unwrap();
        let mark = list.stream().mark();
        fx.sw.reset_stats();

        list.append_memory_copy(&dst, &src, 64, Some(&done), &[ready.clone()])
            .unwrap();

        let mut out = [0u8; 64];
        dst.allocation().read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [0x5a; 64]);
        assert!(list.stream().is_empty_since(mark));
        assert_eq!(list.dependency_counter(), 1);
        assert!(done.is_completed_cached());

        let stats = fx.sw.stats();
        assert_eq!(stats.downloads, 3);
        assert_eq!(stats.hang_checks, 2);
        assert_eq!(stats.task_count_waits, 0);
        assert_eq!(stats.flushes, 0);
    }

    #[test]
    fn test_cpu_copy_reports_hang() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_copy_through_locked_ptr(true);
        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let kernel = fx.kernel();
        let pool = fx.pool(EventKind::Regular, 1);
        let launched = host_event(&pool, 0);

        list.append_launch_kernel(&kernel, groups(), Some(&launched), &[])
            .unwrap();
        fx.sw.set_hang(true);

        let src = BufferRef::start(fx.buffer(64, Placement::Device));
        let dst = BufferRef::start(fx.buffer(64, Placement::Host));
        assert_eq!(
            list.append_memory_copy(&dst, &src, 64, None, &[]),
            Err(Error::DeviceLost)
        );
    }

    #[test]
    fn test_large_copy_skips_cpu_path() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let config = ListConfig::default().with_copy_through_locked_ptr(true);
        let mut list = fx.list(ListDesc::immediate(EngineType::Compute), config);
        let size = config.locked_copy_threshold + 4;
        let src = BufferRef::start(fx.buffer(size, Placement::Host));
        let dst = BufferRef::start(fx.buffer(size, Placement::Device));

        list.append_memory_copy(&dst, &src, size, None, &[]).unwrap();
        assert_eq!(list.dependency_counter(), 1);
        assert_eq!(fx.sw.stats().flushes, 1);
    }

    #[test]
    fn test_printf_flushed_after_sync() {
        let fx = Fixture::new(GpuFamily::XeHp);
        let mut list = fx.immediate();
        let kernel =
            Kernel::new(&fx.device, KernelDescriptor::new("print").with_printf(true)).unwrap();
        list.append_launch_kernel(&kernel, groups(), None, &[]).unwrap();
        let buffer = kernel.printf_buffer().unwrap();
        assert!(fx.sw.residency().is_resident(buffer.handle()));

        buffer.write_bytes(4, b"hi\n").unwrap();
        buffer.store_u32(0, 3);
        fx.sw.complete_all();
        list.host_synchronize(u64::MAX).unwrap();
        assert_eq!(buffer.load_u32(0), 0);
    }
}
