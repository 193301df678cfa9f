//! # List Configuration
//!
//! Behavior switches fixed at command list construction. Each list carries
//! its own copy, so two lists in the same process may differ.

use crate::types::PAGE_SIZE_64K;

// =============================================================================
// SWITCH TYPES
// =============================================================================

/// Three-way override for a boolean decided elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tristate {
    /// Keep the requested value
    #[default]
    Default,
    /// Force off
    ForceOff,
    /// Force on
    ForceOn,
}

impl Tristate {
    /// Apply the override to a requested value
    pub const fn resolve(self, requested: bool) -> bool {
        match self {
            Self::Default => requested,
            Self::ForceOff => false,
            Self::ForceOn => true,
        }
    }
}

/// Binding table prefetch programming for dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BtpPrefetchMode {
    /// Follow the GPU generation's preference
    #[default]
    Default,
    /// Prefetch the kernel's binding table entries
    Enabled,
    /// Never prefetch
    Disabled,
}

bitflags::bitflags! {
    /// Where to place user interrupts once a dependency resolves
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UserInterruptMask: u32 {
        /// After every dependency semaphore wait
        const AFTER_SEMAPHORE = 1 << 0;
        /// After every store that signals the dependency counter
        const ON_SIGNALING_FENCE = 1 << 1;
    }
}

impl UserInterruptMask {
    /// Build from a raw debug value, ignoring unknown bits
    pub const fn from_raw(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }
}

// =============================================================================
// LIST CONFIG
// =============================================================================

/// Default size of one command buffer before chaining
pub const DEFAULT_COMMAND_BUFFER_SIZE: u64 = PAGE_SIZE_64K;

/// Default upper bound for the CPU copy path
pub const DEFAULT_LOCKED_COPY_THRESHOLD: u64 = 4 * 1024;

/// Default largest byte range a single copy/fill dispatch covers
pub const DEFAULT_MAX_DISPATCH_BYTES: u64 = 1 << 32;

/// Command list configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListConfig {
    /// Allow cooperative and regular kernels in the same list
    pub allow_mixed_cooperative: bool,
    /// Binding table prefetch programming
    pub btp_prefetch_mode: BtpPrefetchMode,
    /// Override of the in-order flag requested at creation
    pub force_in_order_execution: Tristate,
    /// User interrupt placement
    pub user_interrupt: UserInterruptMask,
    /// Serve small host/device copies on the CPU
    pub copy_through_locked_ptr: bool,
    /// Largest copy served by the CPU path
    pub locked_copy_threshold: u64,
    /// Chain every event packet instead of one per partition
    pub signal_all_event_packets: bool,
    /// Largest range one copy/fill dispatch covers, rounded down to dwords
    pub max_dispatch_bytes: u64,
    /// Command buffer size used for chaining
    pub command_buffer_size: u64,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            allow_mixed_cooperative: false,
            btp_prefetch_mode: BtpPrefetchMode::Default,
            force_in_order_execution: Tristate::Default,
            user_interrupt: UserInterruptMask::empty(),
            copy_through_locked_ptr: false,
            locked_copy_threshold: DEFAULT_LOCKED_COPY_THRESHOLD,
            signal_all_event_packets: false,
            max_dispatch_bytes: DEFAULT_MAX_DISPATCH_BYTES,
            command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
        }
    }
}

impl ListConfig {
    /// Permit cooperative/regular mixing
    pub const fn with_mixed_cooperative(mut self, allow: bool) -> Self {
        self.allow_mixed_cooperative = allow;
        self
    }

    /// Set binding table prefetch mode
    pub const fn with_btp_prefetch(mut self, mode: BtpPrefetchMode) -> Self {
        self.btp_prefetch_mode = mode;
        self
    }

    /// Override in-order execution
    pub const fn with_in_order(mut self, force: Tristate) -> Self {
        self.force_in_order_execution = force;
        self
    }

    /// Set user interrupt placement
    pub const fn with_user_interrupt(mut self, mask: UserInterruptMask) -> Self {
        self.user_interrupt = mask;
        self
    }

    /// Enable the CPU copy path
    pub const fn with_copy_through_locked_ptr(mut self, enable: bool) -> Self {
        self.copy_through_locked_ptr = enable;
        self
    }

    /// Chain all event packets
    pub const fn with_signal_all_event_packets(mut self, enable: bool) -> Self {
        self.signal_all_event_packets = enable;
        self
    }

    /// Limit one copy/fill dispatch
    pub const fn with_max_dispatch_bytes(mut self, bytes: u64) -> Self {
        self.max_dispatch_bytes = bytes;
        self
    }

    /// Set command buffer size
    pub const fn with_command_buffer_size(mut self, bytes: u64) -> Self {
        self.command_buffer_size = bytes;
        self
    }

    /// Final in-order decision for a list created with `requested`
    pub fn in_order_enabled(&self, requested: bool) -> bool {
        let enabled = self.force_in_order_execution.resolve(requested);
        if enabled != requested {
            log::debug!(
                "cinder: in-order execution forced {} by configuration",
                if enabled { "on" } else { "off" }
            );
        }
        enabled
    }
}
