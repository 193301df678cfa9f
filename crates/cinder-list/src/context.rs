//! # Execution Context
//!
//! The engine-side collaborator a command list submits through: residency,
//! task counts, allocation downloads and hang detection.
//!
//! [`SoftwareContext`] is a host-only context. Submissions complete when the
//! caller says so ([`SoftwareContext::complete_task`]), downloads can run a
//! hook that plays the role of the device writing memory, and a hang can be
//! injected.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use cinder_core::{ContextId, Error, GpuAddr, Result, TaskCount};
use cinder_mem::{GpuAllocation, ResidencyTracker};

// =============================================================================
// CLOCK
// =============================================================================

/// Monotonic nanosecond time source
pub trait Clock: Send + Sync + fmt::Debug {
    /// Nanoseconds since an arbitrary origin
    fn now_ns(&self) -> u64;
}

/// Wall clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Clock starting now
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock that advances by a fixed step on every read
#[derive(Debug)]
pub struct SteppingClock {
    now: AtomicU64,
    step: u64,
}

impl SteppingClock {
    /// Clock at zero advancing `step_ns` per read
    pub const fn new(step_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step: step_ns,
        }
    }
}

impl Clock for SteppingClock {
    fn now_ns(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }
}

// =============================================================================
// EXECUTION CONTEXT
// =============================================================================

/// A range of command stream handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// First instruction
    pub start: GpuAddr,
    /// Bytes recorded since the previous submission
    pub bytes: u64,
}

/// Engine submission and completion interface
pub trait ExecutionContext: Send + Sync + fmt::Debug {
    /// Context identity
    fn id(&self) -> ContextId;

    /// Register an allocation as used by pending work
    fn make_resident(&self, allocation: &GpuAllocation) -> u32;

    /// Submit work; returns the task count that completes it
    fn flush(&self, submission: Submission) -> Result<TaskCount>;

    /// Latest task count handed out
    fn task_count(&self) -> TaskCount;

    /// Wait until `task_count` completed
    ///
    /// `NotReady` after `timeout_ns`, `DeviceLost` on hang.
    fn wait_for_task_count(&self, task_count: TaskCount, timeout_ns: u64) -> Result<()>;

    /// Refresh the host copy of an allocation
    fn download_allocation(&self, allocation: &GpuAllocation);

    /// Whether the engine hung
    fn check_gpu_hang(&self) -> bool;

    /// Current time
    fn now_ns(&self) -> u64;
}

/// Elapsed-time check shared by every polling loop
pub(crate) fn timed_out(start_ns: u64, now_ns: u64, timeout_ns: u64) -> bool {
    now_ns.saturating_sub(start_ns) >= timeout_ns
}

// =============================================================================
// SOFTWARE CONTEXT
// =============================================================================

/// Download hook; receives the allocation and the 1-based download number
pub type DownloadHook = Box<dyn Fn(&GpuAllocation, u64) + Send + Sync>;

/// Call statistics
#[derive(Debug, Clone, Default)]
pub struct ContextStats {
    /// Submissions
    pub flushes: u64,
    /// Allocation downloads
    pub downloads: u64,
    /// Hang checks
    pub hang_checks: u64,
    /// Task count waits
    pub task_count_waits: u64,
    /// Task count of the latest wait
    pub last_waited_task_count: TaskCount,
}

/// Host-only execution context
pub struct SoftwareContext {
    id: ContextId,
    task_count: AtomicU32,
    completed: AtomicU32,
    residency: ResidencyTracker,
    hang: AtomicBool,
    download_hook: Mutex<Option<DownloadHook>>,
    stats: Mutex<ContextStats>,
    clock: Box<dyn Clock>,
}

impl SoftwareContext {
    /// Create a context reading time from `clock`
    pub fn with_clock(id: ContextId, clock: Box<dyn Clock>) -> Self {
        Self {
            id,
            task_count: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            residency: ResidencyTracker::new(),
            hang: AtomicBool::new(false),
            download_hook: Mutex::new(None),
            stats: Mutex::new(ContextStats::default()),
            clock,
        }
    }

    /// Create a context on the wall clock
    #[cfg(feature = "std")]
    pub fn new(id: ContextId) -> Self {
        Self::with_clock(id, Box::new(StdClock::new()))
    }

    /// Residency registrations
    pub fn residency(&self) -> &ResidencyTracker {
        &self.residency
    }

    /// Mark every task up to `task_count` complete
    pub fn complete_task(&self, task_count: TaskCount) {
        self.completed.fetch_max(task_count, Ordering::AcqRel);
    }

    /// Mark everything submitted so far complete
    pub fn complete_all(&self) {
        self.complete_task(self.task_count.load(Ordering::Acquire));
    }

    /// Highest completed task count
    pub fn completed_task_count(&self) -> TaskCount {
        self.completed.load(Ordering::Acquire)
    }

    /// Report (or clear) an engine hang
    pub fn set_hang(&self, hung: bool) {
        self.hang.store(hung, Ordering::Release);
    }

    /// Install the download hook
    pub fn set_download_hook(&self, hook: DownloadHook) {
        *self.download_hook.lock() = Some(hook);
    }

    /// Remove the download hook
    pub fn clear_download_hook(&self) {
        *self.download_hook.lock() = None;
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ContextStats {
        self.stats.lock().clone()
    }

    /// Zero the statistics
    pub fn reset_stats(&self) {
        *self.stats.lock() = ContextStats::default();
    }
}

impl ExecutionContext for SoftwareContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn make_resident(&self, allocation: &GpuAllocation) -> u32 {
        self.residency.make_resident(allocation)
    }

    fn flush(&self, submission: Submission) -> Result<TaskCount> {
        if self.hang.load(Ordering::Acquire) {
            return Err(Error::DeviceLost);
        }
        let task_count = self.task_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.lock().flushes += 1;
        log::trace!(
            "cinder-list: context {} submitted {} bytes at {} as task {}",
            self.id.0,
            submission.bytes,
            submission.start,
            task_count
        );
        Ok(task_count)
    }

    fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    fn wait_for_task_count(&self, task_count: TaskCount, timeout_ns: u64) -> Result<()> {
        {
            let mut stats = self.stats.lock();
            stats.task_count_waits += 1;
            stats.last_waited_task_count = task_count;
        }
        let start = self.clock.now_ns();
        loop {
            if self.completed_task_count() >= task_count {
                return Ok(());
            }
            if self.check_gpu_hang() {
                return Err(Error::DeviceLost);
            }
            if timed_out(start, self.clock.now_ns(), timeout_ns) {
                return Err(Error::NotReady);
            }
            core::hint::spin_loop();
        }
    }

    fn download_allocation(&self, allocation: &GpuAllocation) {
        let number = {
            let mut stats = self.stats.lock();
            stats.downloads += 1;
            stats.downloads
        };
        if let Some(hook) = self.download_hook.lock().as_ref() {
            hook(allocation, number);
        }
    }

    fn check_gpu_hang(&self) -> bool {
        self.stats.lock().hang_checks += 1;
        let hung = self.hang.load(Ordering::Acquire);
        if hung {
            log::error!("cinder-list: context {} reports a GPU hang", self.id.0);
        }
        hung
    }

    fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }
}

impl fmt::Debug for SoftwareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareContext")
            .field("id", &self.id)
            .field("task_count", &self.task_count)
            .field("completed", &self.completed)
            .field("hang", &self.hang)
            .finish()
    }
}
