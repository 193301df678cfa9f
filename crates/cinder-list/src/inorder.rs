//! # In-Order Protocol
//!
//! Counter bookkeeping of an in-order list and the instruction sequences
//! that wait on or advance a dependency counter.
//!
//! Every append signals `value + 1`. When that reaches `u32::MAX` the
//! append signals `u32::MAX` at the current offset, waits for it to land,
//! moves to the next offset and restarts the count at 1 there:
//!
//! ```text
//!   offset 0: ... u32::MAX-1 ──► u32::MAX ─┐ semaphore >= u32::MAX
//!                                          ▼
//!   offset 8*partitions:                   1 ──► 2 ──► ...
//! ```

use alloc::sync::Arc;

use cinder_cmd::{CommandBatch, CompareOp, HwEncoder, Instruction};
use cinder_core::{Error, GpuAddr, Result, UserInterruptMask};
use cinder_mem::DependencyCounterAllocation;

use crate::event::InOrderBinding;

// =============================================================================
// COUNTER STATE
// =============================================================================

/// Counter position an append will signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SignalPlan {
    /// Value the operation itself writes
    pub value: u32,
    /// Offset the operation writes at
    pub offset: u64,
    /// Offset the count restarts at after an overflow
    pub wrap_offset: Option<u64>,
}

impl SignalPlan {
    /// Counter value once the append retired
    pub fn final_value(&self) -> u32 {
        if self.wrap_offset.is_some() {
            1
        } else {
            self.value
        }
    }

    /// Counter offset once the append retired
    pub fn final_offset(&self) -> u64 {
        self.wrap_offset.unwrap_or(self.offset)
    }
}

/// Dependency counter of one in-order list
#[derive(Debug)]
pub(crate) struct InOrderState {
    pub counter: Arc<DependencyCounterAllocation>,
    pub value: u32,
    pub offset: u64,
}

impl InOrderState {
    pub fn new(counter: Arc<DependencyCounterAllocation>) -> Self {
        Self {
            counter,
            value: 0,
            offset: 0,
        }
    }

    pub fn partitioned(&self) -> bool {
        self.counter.partition_count() > 1
    }

    /// Plan the next signal without changing anything
    pub fn plan(&self) -> Result<SignalPlan> {
        let value = self.value.wrapping_add(1);
        if value != u32::MAX {
            return Ok(SignalPlan {
                value,
                offset: self.offset,
                wrap_offset: None,
            });
        }

        let next = self.offset + self.counter.offset_stride();
        if !self.counter.fits(next) {
            log::warn!(
                "cinder-list: counter {:?} has no room past offset {}",
                self.counter.handle(),
                self.offset
            );
            return Err(Error::CounterSpaceExhausted);
        }
        Ok(SignalPlan {
            value,
            offset: self.offset,
            wrap_offset: Some(next),
        })
    }

    /// Adopt a planned signal once its instructions are in the stream
    pub fn commit(&mut self, plan: SignalPlan) {
        if let Some(next) = plan.wrap_offset {
            log::debug!(
                "cinder-list: counter {:?} wrapped, offset {} -> {}",
                self.counter.handle(),
                self.offset,
                next
            );
        }
        self.value = plan.final_value();
        self.offset = plan.final_offset();
    }

    /// Address the signal of `plan` targets; tiles add their own slot
    pub fn signal_address(&self, plan: &SignalPlan) -> GpuAddr {
        self.counter.slot_address(plan.offset, 0)
    }

    /// Binding for an event signaled by `plan`
    pub fn binding_for(&self, plan: &SignalPlan) -> InOrderBinding {
        self.binding_at(plan.final_offset(), plan.final_value())
    }

    /// Binding to the current counter position
    pub fn current_binding(&self) -> InOrderBinding {
        self.binding_at(self.offset, self.value)
    }

    fn binding_at(&self, offset: u64, value: u32) -> InOrderBinding {
        InOrderBinding {
            counter: Arc::downgrade(&self.counter),
            handle: self.counter.handle(),
            generation: self.counter.generation(),
            offset,
            value,
        }
    }

    /// Whether waiting on `binding` is already implied by stream order
    ///
    /// Offsets only grow within a generation, so anything bound at an
    /// earlier offset was signaled before the current one started.
    pub fn is_own(&self, binding: &InOrderBinding) -> bool {
        binding.handle == self.counter.handle()
            && binding.generation == self.counter.generation()
            && (binding.offset < self.offset
                || (binding.offset == self.offset && binding.value <= self.value))
    }

    /// Zero the counter and start a new generation
    pub fn reset(&mut self) {
        self.counter.reset();
        self.value = 0;
        self.offset = 0;
    }
}

// =============================================================================
// EMISSION
// =============================================================================

/// Emits dependency waits and counter stores with the debug interrupts
#[derive(Debug, Clone, Copy)]
pub(crate) struct Emitter<'a> {
    pub encoder: &'a dyn HwEncoder,
    pub interrupts: UserInterruptMask,
}

impl Emitter<'_> {
    /// Semaphore guarding the following work
    pub fn dependency_semaphore(
        &self,
        batch: &mut CommandBatch,
        address: GpuAddr,
        value: u64,
        compare: CompareOp,
    ) {
        self.encoder.emit_semaphore(batch, address, value, compare);
        if self.interrupts.contains(UserInterruptMask::AFTER_SEMAPHORE) {
            batch.push(Instruction::UserInterrupt);
        }
    }

    /// Wait until every slot of `counter` at `offset` reached `value`
    pub fn wait_counter(
        &self,
        batch: &mut CommandBatch,
        counter: &DependencyCounterAllocation,
        offset: u64,
        value: u32,
    ) {
        for address in counter.slot_addresses(offset) {
            self.dependency_semaphore(batch, address, value as u64, CompareOp::GreaterOrEqual);
        }
    }

    /// Store-immediate of a counter value
    pub fn counter_store(&self, batch: &mut CommandBatch, address: GpuAddr, value: u32, partitioned: bool) {
        self.encoder.emit_store(batch, address, value, partitioned);
        self.signaling_fence(batch);
    }

    /// Stall followed by a counter write
    pub fn barrier_store(&self, batch: &mut CommandBatch, address: GpuAddr, value: u32, partitioned: bool) {
        self.encoder.emit_barrier_store(batch, address, value, partitioned);
        self.signaling_fence(batch);
    }

    fn signaling_fence(&self, batch: &mut CommandBatch) {
        if self.interrupts.contains(UserInterruptMask::ON_SIGNALING_FENCE) {
            batch.push(Instruction::UserInterrupt);
        }
    }

    /// Restart the count at the new offset after an overflowing signal
    pub fn finish_wrap(&self, batch: &mut CommandBatch, state: &InOrderState, plan: &SignalPlan) {
        let Some(next) = plan.wrap_offset else {
            return;
        };
        self.wait_counter(batch, &state.counter, plan.offset, u32::MAX);
        self.counter_store(
            batch,
            state.counter.slot_address(next, 0),
            1,
            state.partitioned(),
        );
    }
}
