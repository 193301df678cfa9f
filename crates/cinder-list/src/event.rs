//! # Events
//!
//! Events live in an [`EventPool`] allocation, one run of 32-byte packets per
//! event. A packet's completion field reads [`STATE_CLEARED`] until some
//! engine (or the host) writes [`STATE_SIGNALED`] into it.
//!
//! An event signaled by an in-order list may instead be bound to that list's
//! dependency counter. The binding is a weak reference to the counter page
//! plus the handle, generation, offset and value the event completes at:
//!
//! ```text
//!   Event ──binding──► (Weak<DependencyCounterAllocation>, handle,
//!                       generation, offset, value)
//!     │
//!     └──packets────► EventPool allocation [packet 0][packet 1]...
//! ```
//!
//! Reset drops the binding and the event falls back to packet semantics.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use cinder_core::{AllocationHandle, Error, GpuAddr, Result};
use cinder_mem::{AllocDesc, AllocationKind, DependencyCounterAllocation, GpuAllocation};

use crate::context::{timed_out, Clock, ExecutionContext};
use crate::device::Device;

/// Completion field value of a signaled packet
pub const STATE_SIGNALED: u32 = 0;

/// Completion field value of a cleared packet
pub const STATE_CLEARED: u32 = 1;

/// Bytes per event packet
pub const PACKET_SIZE: u64 = 32;

/// Largest packet count per event
pub const MAX_EVENT_PACKETS: u32 = 16;

const TIMESTAMP_FIELDS: u64 = 4;
const TIMESTAMP_FIELD_SIZE: u64 = 8;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Signal mode of a pool's events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Completion is an immediate value write
    Regular,
    /// Completion writes start/end timestamps
    Timestamp,
}

impl EventKind {
    /// Byte offset of the completion field inside a packet
    ///
    /// Timestamp packets are `[context start, global start, context end,
    /// global end]`; the context end field doubles as completion field.
    pub const fn completion_offset(self) -> u64 {
        match self {
            Self::Regular => 0,
            Self::Timestamp => 2 * TIMESTAMP_FIELD_SIZE,
        }
    }
}

bitflags::bitflags! {
    /// Memory visibility guaranteed once the event is signaled
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventScope: u32 {
        /// Visible to the host
        const HOST = 1 << 0;
        /// Visible to the device
        const DEVICE = 1 << 1;
    }
}

/// Event creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    /// Signal scope
    pub signal_scope: EventScope,
    /// May be bound to an in-order list's dependency counter
    pub counter_based: bool,
}

impl EventDesc {
    /// Device-scope, counter capable
    pub const fn new() -> Self {
        Self {
            signal_scope: EventScope::DEVICE,
            counter_based: true,
        }
    }

    /// Change the signal scope
    pub const fn with_scope(mut self, scope: EventScope) -> Self {
        self.signal_scope = scope;
        self
    }

    /// Change counter capability
    pub const fn with_counter_based(mut self, counter_based: bool) -> Self {
        self.counter_based = counter_based;
        self
    }
}

impl Default for EventDesc {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// EVENT POOL
// =============================================================================

/// Packet storage shared by a group of events
pub struct EventPool {
    allocation: Arc<GpuAllocation>,
    kind: EventKind,
    event_count: u32,
    max_packet_count: u32,
    clock: Arc<dyn Clock>,
}

impl EventPool {
    /// Allocate storage for `event_count` events of `max_packet_count` packets
    pub fn new(
        device: &Device,
        kind: EventKind,
        event_count: u32,
        max_packet_count: u32,
    ) -> Result<Arc<Self>> {
        if event_count == 0 || max_packet_count == 0 || max_packet_count > MAX_EVENT_PACKETS {
            return Err(Error::InvalidArgument);
        }
        let size = event_count as u64 * max_packet_count as u64 * PACKET_SIZE;
        let allocation = device
            .allocator()
            .allocate(&AllocDesc::new(AllocationKind::EventPool, size))?;

        let pool = Self {
            allocation,
            kind,
            event_count,
            max_packet_count,
            clock: device.clock().clone(),
        };
        for index in 0..event_count {
            pool.clear_packets(index);
        }
        log::debug!(
            "cinder-list: event pool {:?}: {} {:?} events x {} packets",
            pool.allocation.handle(),
            event_count,
            kind,
            max_packet_count
        );
        Ok(Arc::new(pool))
    }

    /// Create the event at `index`
    pub fn create_event(self: &Arc<Self>, index: u32, desc: EventDesc) -> Result<Arc<Event>> {
        if index >= self.event_count {
            return Err(Error::InvalidArgument);
        }
        Ok(Arc::new(Event {
            pool: self.clone(),
            index,
            desc,
            state: Mutex::new(EventState::new()),
        }))
    }

    /// Signal mode
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Packet storage
    pub fn allocation(&self) -> &Arc<GpuAllocation> {
        &self.allocation
    }

    /// Events in the pool
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Packets per event
    pub fn max_packet_count(&self) -> u32 {
        self.max_packet_count
    }

    fn packet_offset(&self, index: u32, packet: u32) -> u64 {
        (index as u64 * self.max_packet_count as u64 + packet as u64) * PACKET_SIZE
    }

    fn completion_offset(&self, index: u32, packet: u32) -> u64 {
        self.packet_offset(index, packet) + self.kind.completion_offset()
    }

    fn clear_packets(&self, index: u32) {
        for packet in 0..self.max_packet_count {
            let base = self.packet_offset(index, packet);
            match self.kind {
                EventKind::Regular => self.allocation.store_u32(base, STATE_CLEARED),
                EventKind::Timestamp => {
                    for field in 0..TIMESTAMP_FIELDS {
                        self.allocation
                            .store_u64(base + field * TIMESTAMP_FIELD_SIZE, STATE_CLEARED as u64);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("allocation", &self.allocation.handle())
            .field("kind", &self.kind)
            .field("event_count", &self.event_count)
            .field("max_packet_count", &self.max_packet_count)
            .finish()
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// Where an in-order event completes
#[derive(Debug, Clone)]
pub struct InOrderBinding {
    pub(crate) counter: Weak<DependencyCounterAllocation>,
    /// Counter allocation identity
    pub handle: AllocationHandle,
    /// Counter generation at signal time
    pub generation: u32,
    /// Byte offset of the counter slots
    pub offset: u64,
    /// Value the event completes at
    pub value: u32,
}

impl InOrderBinding {
    /// The counter allocation, if it is still alive
    pub fn counter(&self) -> Option<Arc<DependencyCounterAllocation>> {
        self.counter.upgrade()
    }
}

#[derive(Debug)]
struct EventState {
    in_order_exec_event: bool,
    binding: Option<InOrderBinding>,
    packets_in_use: u32,
    completed: bool,
    signaling_contexts: Vec<Arc<dyn ExecutionContext>>,
}

impl EventState {
    const fn new() -> Self {
        Self {
            in_order_exec_event: false,
            binding: None,
            packets_in_use: 1,
            completed: false,
            signaling_contexts: Vec::new(),
        }
    }
}

/// A synchronization event
pub struct Event {
    pool: Arc<EventPool>,
    index: u32,
    desc: EventDesc,
    state: Mutex<EventState>,
}

impl Event {
    /// Signal mode
    pub fn kind(&self) -> EventKind {
        self.pool.kind
    }

    /// Owning pool
    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    /// Slot in the pool
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Signal scope
    pub fn signal_scope(&self) -> EventScope {
        self.desc.signal_scope
    }

    /// Whether signaling makes memory visible to the host
    pub fn is_host_visible(&self) -> bool {
        self.desc.signal_scope.contains(EventScope::HOST)
    }

    /// Whether the event may be bound to a dependency counter
    pub fn is_counter_based(&self) -> bool {
        self.desc.counter_based
    }

    /// Packets per event
    pub fn max_packet_count(&self) -> u32 {
        self.pool.max_packet_count
    }

    /// GPU address of a packet
    pub fn packet_address(&self, packet: u32) -> GpuAddr {
        self.pool
            .allocation
            .gpu_address_at(self.pool.packet_offset(self.index, packet))
    }

    /// GPU address of a packet's completion field
    pub fn completion_address(&self, packet: u32) -> GpuAddr {
        self.pool
            .allocation
            .gpu_address_at(self.pool.completion_offset(self.index, packet))
    }

    /// Host view of a packet's completion field
    pub fn packet_state(&self, packet: u32) -> u32 {
        self.pool
            .allocation
            .load_u32(self.pool.completion_offset(self.index, packet))
    }

    /// Whether the latest signal bound the event to a dependency counter
    pub fn is_in_order_exec_event(&self) -> bool {
        self.state.lock().in_order_exec_event
    }

    /// Counter value the event completes at; 0 when unbound
    pub fn in_order_exec_signal_value(&self) -> u32 {
        self.state.lock().binding.as_ref().map_or(0, |b| b.value)
    }

    /// Counter offset the event completes at; 0 when unbound
    pub fn in_order_allocation_offset(&self) -> u64 {
        self.state.lock().binding.as_ref().map_or(0, |b| b.offset)
    }

    /// Current counter binding
    pub fn in_order_binding(&self) -> Option<InOrderBinding> {
        self.state.lock().binding.clone()
    }

    /// Packets the latest signal wrote
    pub fn packets_in_use(&self) -> u32 {
        self.state.lock().packets_in_use
    }

    /// Whether completion was already observed on the host
    pub fn is_completed_cached(&self) -> bool {
        self.state.lock().completed
    }

    /// Record a device-side signal
    ///
    /// `binding` is honored only for counter-capable events; everything else
    /// completes through its packets.
    pub(crate) fn record_signal(
        &self,
        ctx: &Arc<dyn ExecutionContext>,
        packets: Option<u32>,
        binding: Option<InOrderBinding>,
    ) {
        let mut state = self.state.lock();
        state.completed = false;
        state.signaling_contexts.clear();
        state.signaling_contexts.push(ctx.clone());
        if let Some(packets) = packets {
            state.packets_in_use = packets;
        }
        match binding {
            Some(binding) if self.desc.counter_based => {
                state.in_order_exec_event = true;
                state.binding = Some(binding);
            }
            _ => {
                state.in_order_exec_event = false;
                state.binding = None;
            }
        }
    }

    /// Drop the counter binding after a device-side reset was recorded
    pub(crate) fn clear_binding(&self) {
        let mut state = self.state.lock();
        state.in_order_exec_event = false;
        state.binding = None;
        state.completed = false;
    }

    /// Signal from the host
    pub fn host_signal(&self) {
        let mut state = self.state.lock();
        for packet in 0..self.pool.max_packet_count {
            self.pool.allocation.store_u32(
                self.pool.completion_offset(self.index, packet),
                STATE_SIGNALED,
            );
        }
        state.completed = true;
        state.in_order_exec_event = false;
        state.binding = None;
        state.packets_in_use = state.packets_in_use.max(1);
    }

    /// Return to the cleared state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.pool.clear_packets(self.index);
        state.completed = false;
        state.in_order_exec_event = false;
        state.binding = None;
        state.packets_in_use = state.packets_in_use.max(1);
        state.signaling_contexts.clear();
    }

    /// Non-blocking completion check
    ///
    /// `Ok(())` when signaled, `NotReady` otherwise.
    pub fn query_status(&self) -> Result<()> {
        let contexts = self.prepare_poll();
        self.download(&contexts);
        if self.poll_completion()? {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Wait for completion
    ///
    /// In-order events poll the bound counter slots, others their packets.
    /// Every iteration checks the signaling contexts for a hang.
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        if self.is_completed_cached() {
            return Ok(());
        }
        let contexts = self.prepare_poll();
        let start = self.pool.clock.now_ns();
        loop {
            self.download(&contexts);
            if self.poll_completion()? {
                return Ok(());
            }
            if contexts.iter().any(|ctx| ctx.check_gpu_hang()) {
                log::error!(
                    "cinder-list: device lost while waiting for event {} of {:?}",
                    self.index,
                    self.pool.allocation.handle()
                );
                return Err(Error::DeviceLost);
            }
            if timed_out(start, self.pool.clock.now_ns(), timeout_ns) {
                return Err(Error::NotReady);
            }
            core::hint::spin_loop();
        }
    }

    fn prepare_poll(&self) -> Vec<Arc<dyn ExecutionContext>> {
        self.state.lock().signaling_contexts.clone()
    }

    fn download(&self, contexts: &[Arc<dyn ExecutionContext>]) {
        let binding = self.in_order_binding();
        let counter = binding.as_ref().and_then(|b| b.counter.upgrade());
        for ctx in contexts {
            match &counter {
                Some(counter) => ctx.download_allocation(counter.allocation()),
                None => ctx.download_allocation(&self.pool.allocation),
            }
        }
    }

    fn poll_completion(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.completed {
            return Ok(true);
        }
        let done = match &state.binding {
            Some(binding) => {
                let counter = binding.counter.upgrade().ok_or(Error::StaleEventBinding)?;
                counter.is_reached(binding.offset, binding.value)
            }
            None => (0..state.packets_in_use.max(1))
                .all(|packet| self.packet_state(packet) != STATE_CLEARED),
        };
        state.completed = done;
        Ok(done)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Event")
            .field("pool", &self.pool.allocation.handle())
            .field("index", &self.index)
            .field("kind", &self.pool.kind)
            .field("in_order_exec_event", &state.in_order_exec_event)
            .field("binding", &state.binding)
            .field("completed", &state.completed)
            .finish()
    }
}
