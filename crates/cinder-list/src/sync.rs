//! # Host Synchronization
//!
//! Polling loops shared by command lists and events.
//!
//! ```text
//!   ┌──────────────┐ submit  ┌──────────────────┐ reached ┌───────────┐
//!   │ NotSubmitted ├────────►│ SubmittedPending ├────────►│ Completed │
//!   └──────────────┘         └────────┬─────────┘         └───────────┘
//!                                     │ hang
//!                                     ▼
//!                               ┌────────────┐
//!                               │ DeviceLost │
//!                               └────────────┘
//! ```

use cinder_core::{Error, Result};
use cinder_mem::DependencyCounterAllocation;

use crate::context::{timed_out, ExecutionContext};

/// Host view of submitted work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Nothing submitted yet
    NotSubmitted,
    /// Submitted, not yet observed complete
    SubmittedPending,
    /// Observed complete
    Completed,
    /// The engine hung
    DeviceLost,
}

impl SyncState {
    /// Classify the result of a zero-timeout synchronization
    pub fn from_poll(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(Error::DeviceLost) => Self::DeviceLost,
            Err(_) => Self::SubmittedPending,
        }
    }
}

/// Poll until every slot of `counter` at `offset` reached `target`
///
/// Each iteration downloads the counter page, checks it, then checks for a
/// hang and the timeout. A zero timeout checks once; `u64::MAX` never
/// times out.
pub fn wait_for_counter(
    ctx: &dyn ExecutionContext,
    counter: &DependencyCounterAllocation,
    offset: u64,
    target: u32,
    timeout_ns: u64,
) -> Result<()> {
    let start = ctx.now_ns();
    loop {
        ctx.download_allocation(counter.allocation());
        if counter.is_reached(offset, target) {
            return Ok(());
        }
        if ctx.check_gpu_hang() {
            log::error!(
                "cinder-list: device lost waiting for counter {:?} to reach {}",
                counter.handle(),
                target
            );
            return Err(Error::DeviceLost);
        }
        if timed_out(start, ctx.now_ns(), timeout_ns) {
            log::trace!(
                "cinder-list: counter {:?} at {} after {} ns, waiting for {}",
                counter.handle(),
                counter.host_value(offset, 0),
                timeout_ns,
                target
            );
            return Err(Error::NotReady);
        }
        core::hint::spin_loop();
    }
}
