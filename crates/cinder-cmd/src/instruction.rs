//! # Instructions
//!
//! Logical command-buffer instructions and their binary form.
//!
//! Every instruction is a header dword followed by a fixed-size payload:
//!
//! ```text
//!   31        24 23                 0
//!  ┌────────────┬────────────────────┐
//!  │   opcode   │ length in dwords   │   header (length includes header)
//!  ├────────────┴────────────────────┤
//!  │   payload (repr(C) Pod struct   │
//!  │   of u32 fields, lo/hi pairs)   │
//!  └─────────────────────────────────┘
//! ```

use alloc::vec::Vec;
use core::mem::size_of;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use cinder_core::{Error, GpuAddr, Result};

// =============================================================================
// OPCODES
// =============================================================================

/// Instruction opcodes (header bits 31:24)
pub mod opcode {
    /// Semaphore wait
    pub const SEMAPHORE_WAIT: u8 = 0x1C;
    /// Store data immediate
    pub const STORE_DATA_IMM: u8 = 0x20;
    /// Compute walker
    pub const WALKER: u8 = 0x27;
    /// Pipe control
    pub const PIPE_CONTROL: u8 = 0x7A;
    /// Blitter linear/region copy
    pub const COPY_BLT: u8 = 0x43;
    /// Blitter color fill
    pub const COLOR_BLT: u8 = 0x44;
    /// Blitter byte fill
    pub const MEM_SET: u8 = 0x5B;
    /// Copy engine flush
    pub const FLUSH_DW: u8 = 0x26;
    /// User interrupt
    pub const USER_INTERRUPT: u8 = 0x02;
    /// Batch buffer start (chaining)
    pub const BATCH_BUFFER_START: u8 = 0x31;
}

bitflags! {
    /// Flag dword shared by several payloads
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncodedFlags: u32 {
        /// 64-bit store
        const QWORD = 1 << 0;
        /// Each tile writes at its own partition slot
        const PARTITIONED = 1 << 1;
        /// Command streamer stall
        const STALL = 1 << 2;
        /// Data cache flush
        const DC_FLUSH = 1 << 3;
        /// Cooperative dispatch
        const COOPERATIVE = 1 << 4;
        /// Group count read from memory
        const INDIRECT = 1 << 5;
    }
}

// =============================================================================
// LOGICAL INSTRUCTIONS
// =============================================================================

/// Semaphore comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompareOp {
    /// `*addr >= value`
    GreaterOrEqual = 0,
    /// `*addr != value`
    NotEqual = 1,
    /// `*addr == value`
    Equal = 2,
}

impl CompareOp {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::GreaterOrEqual),
            1 => Some(Self::NotEqual),
            2 => Some(Self::Equal),
            _ => None,
        }
    }
}

/// Post-sync operation carried by walkers, pipe controls and flushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostSync {
    /// No completion write
    #[default]
    NoWrite,
    /// Write `value` to `address` on completion
    WriteImmediate {
        /// Destination
        address: GpuAddr,
        /// Value written
        value: u64,
    },
    /// Write start/end timestamps to `address` on completion
    WriteTimestamp {
        /// Destination (packet base)
        address: GpuAddr,
    },
}

impl PostSync {
    /// Whether a completion write happens
    pub fn writes(&self) -> bool {
        !matches!(self, Self::NoWrite)
    }

    /// Destination of the completion write
    pub fn address(&self) -> Option<GpuAddr> {
        match self {
            Self::NoWrite => None,
            Self::WriteImmediate { address, .. } | Self::WriteTimestamp { address } => {
                Some(*address)
            }
        }
    }
}

/// Compute dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerCmd {
    /// Thread group counts
    pub group_count: [u32; 3],
    /// Group counts are read from this address
    pub indirect: Option<GpuAddr>,
    /// Completion write
    pub post_sync: PostSync,
    /// Post-sync writes land at per-tile partition slots
    pub partitioned: bool,
    /// Binding table entries prefetched
    pub btp_prefetch: u32,
    /// Cooperative dispatch
    pub cooperative: bool,
}

impl WalkerCmd {
    /// Direct dispatch with no completion write
    pub const fn new(group_count: [u32; 3]) -> Self {
        Self {
            group_count,
            indirect: None,
            post_sync: PostSync::NoWrite,
            partitioned: false,
            btp_prefetch: 0,
            cooperative: false,
        }
    }
}

/// A command-buffer instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Stall the engine until `compare(*address, value)` holds
    SemaphoreWait {
        /// Polled address
        address: GpuAddr,
        /// Comparison operand
        value: u64,
        /// Comparison
        compare: CompareOp,
    },
    /// Store an immediate once prior work retired
    StoreDataImm {
        /// Destination
        address: GpuAddr,
        /// Value
        value: u64,
        /// 64-bit store
        qword: bool,
        /// Each tile stores at its own partition slot
        partition_offset: bool,
    },
    /// Compute dispatch
    Walker(WalkerCmd),
    /// Pipeline synchronization on the compute engine
    PipeControl {
        /// Completion write
        post_sync: PostSync,
        /// Stall until prior work completes
        stall: bool,
        /// Flush data caches
        dc_flush: bool,
        /// Post-sync lands at per-tile partition slots
        partitioned: bool,
    },
    /// Copy engine copy (`height == 1` for linear copies)
    CopyBlt {
        /// Destination
        dst: GpuAddr,
        /// Source
        src: GpuAddr,
        /// Bytes per row
        width: u32,
        /// Rows
        height: u32,
        /// Destination row pitch
        dst_pitch: u32,
        /// Source row pitch
        src_pitch: u32,
    },
    /// Copy engine fill with a dword pattern
    ColorBlt {
        /// Destination
        dst: GpuAddr,
        /// Bytes
        size: u64,
        /// Pattern
        pattern: u32,
    },
    /// Copy engine byte fill
    MemSet {
        /// Destination
        dst: GpuAddr,
        /// Bytes
        size: u64,
        /// Fill byte
        value: u8,
    },
    /// Copy engine flush with optional completion write
    FlushDw {
        /// Completion write
        post_sync: PostSync,
    },
    /// Raise a user interrupt
    UserInterrupt,
    /// Continue execution at another buffer
    BatchBufferStart {
        /// Target
        address: GpuAddr,
    },
}

/// Instruction discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    /// [`Instruction::SemaphoreWait`]
    SemaphoreWait,
    /// [`Instruction::StoreDataImm`]
    StoreDataImm,
    /// [`Instruction::Walker`]
    Walker,
    /// [`Instruction::PipeControl`]
    PipeControl,
    /// [`Instruction::CopyBlt`]
    CopyBlt,
    /// [`Instruction::ColorBlt`]
    ColorBlt,
    /// [`Instruction::MemSet`]
    MemSet,
    /// [`Instruction::FlushDw`]
    FlushDw,
    /// [`Instruction::UserInterrupt`]
    UserInterrupt,
    /// [`Instruction::BatchBufferStart`]
    BatchBufferStart,
}

// =============================================================================
// BINARY PAYLOADS
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct AddrWords {
    lo: u32,
    hi: u32,
}

impl AddrWords {
    fn of(addr: GpuAddr) -> Self {
        Self {
            lo: addr.low(),
            hi: addr.high(),
        }
    }

    fn get(self) -> GpuAddr {
        GpuAddr::from_parts(self.lo, self.hi)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QwordWords {
    lo: u32,
    hi: u32,
}

impl QwordWords {
    fn of(value: u64) -> Self {
        Self {
            lo: value as u32,
            hi: (value >> 32) as u32,
        }
    }

    fn get(self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PostSyncWords {
    op: u32,
    address: AddrWords,
    value: QwordWords,
}

const POST_SYNC_NONE: u32 = 0;
const POST_SYNC_IMMEDIATE: u32 = 1;
const POST_SYNC_TIMESTAMP: u32 = 3;

impl PostSyncWords {
    fn of(post_sync: PostSync) -> Self {
        match post_sync {
            PostSync::NoWrite => Self::zeroed(),
            PostSync::WriteImmediate { address, value } => Self {
                op: POST_SYNC_IMMEDIATE,
                address: AddrWords::of(address),
                value: QwordWords::of(value),
            },
            PostSync::WriteTimestamp { address } => Self {
                op: POST_SYNC_TIMESTAMP,
                address: AddrWords::of(address),
                value: QwordWords::of(0),
            },
        }
    }

    fn get(self) -> Option<PostSync> {
        match self.op {
            POST_SYNC_NONE => Some(PostSync::NoWrite),
            POST_SYNC_IMMEDIATE => Some(PostSync::WriteImmediate {
                address: self.address.get(),
                value: self.value.get(),
            }),
            POST_SYNC_TIMESTAMP => Some(PostSync::WriteTimestamp {
                address: self.address.get(),
            }),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SemaphoreWaitPayload {
    address: AddrWords,
    value: QwordWords,
    compare: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct StoreDataImmPayload {
    address: AddrWords,
    value: QwordWords,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WalkerPayload {
    group_count: [u32; 3],
    indirect: AddrWords,
    post_sync: PostSyncWords,
    flags: u32,
    btp_prefetch: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PipeControlPayload {
    post_sync: PostSyncWords,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CopyBltPayload {
    dst: AddrWords,
    src: AddrWords,
    width: u32,
    height: u32,
    dst_pitch: u32,
    src_pitch: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FillPayload {
    dst: AddrWords,
    size: QwordWords,
    pattern: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FlushDwPayload {
    post_sync: PostSyncWords,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BatchBufferStartPayload {
    address: AddrWords,
}

static_assertions::const_assert_eq!(size_of::<PostSyncWords>(), 20);
static_assertions::const_assert_eq!(size_of::<WalkerPayload>(), 48);
static_assertions::const_assert_eq!(size_of::<BatchBufferStartPayload>(), 8);

const fn dwords<P>() -> usize {
    1 + size_of::<P>() / size_of::<u32>()
}

/// Size of an encoded batch buffer start in bytes
pub const BATCH_BUFFER_START_SIZE: u64 = (dwords::<BatchBufferStartPayload>() * 4) as u64;

fn push_payload<P: Pod>(out: &mut Vec<u32>, op: u8, payload: &P) {
    out.push(((op as u32) << 24) | dwords::<P>() as u32);
    out.extend_from_slice(bytemuck::cast_slice(core::slice::from_ref(payload)));
}

fn read_payload<P: Pod>(words: &[u32], byte_offset: usize) -> Result<P> {
    let len = dwords::<P>();
    let body = words
        .get(1..len)
        .ok_or(Error::MalformedStream { offset: byte_offset })?;
    bytemuck::try_pod_read_unaligned(bytemuck::cast_slice(body))
        .map_err(|_| Error::MalformedStream { offset: byte_offset })
}

fn flag(set: bool, bit: EncodedFlags) -> EncodedFlags {
    if set {
        bit
    } else {
        EncodedFlags::empty()
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

impl Instruction {
    /// Discriminant
    pub fn kind(&self) -> InstructionKind {
        match self {
            Self::SemaphoreWait { .. } => InstructionKind::SemaphoreWait,
            Self::StoreDataImm { .. } => InstructionKind::StoreDataImm,
            Self::Walker(_) => InstructionKind::Walker,
            Self::PipeControl { .. } => InstructionKind::PipeControl,
            Self::CopyBlt { .. } => InstructionKind::CopyBlt,
            Self::ColorBlt { .. } => InstructionKind::ColorBlt,
            Self::MemSet { .. } => InstructionKind::MemSet,
            Self::FlushDw { .. } => InstructionKind::FlushDw,
            Self::UserInterrupt => InstructionKind::UserInterrupt,
            Self::BatchBufferStart { .. } => InstructionKind::BatchBufferStart,
        }
    }

    /// Encoded size in dwords
    pub fn size_dwords(&self) -> usize {
        match self {
            Self::SemaphoreWait { .. } => dwords::<SemaphoreWaitPayload>(),
            Self::StoreDataImm { .. } => dwords::<StoreDataImmPayload>(),
            Self::Walker(_) => dwords::<WalkerPayload>(),
            Self::PipeControl { .. } => dwords::<PipeControlPayload>(),
            Self::CopyBlt { .. } => dwords::<CopyBltPayload>(),
            Self::ColorBlt { .. } | Self::MemSet { .. } => dwords::<FillPayload>(),
            Self::FlushDw { .. } => dwords::<FlushDwPayload>(),
            Self::UserInterrupt => 1,
            Self::BatchBufferStart { .. } => dwords::<BatchBufferStartPayload>(),
        }
    }

    /// Encoded size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_dwords() as u64 * 4
    }

    /// Append the binary form to `out`
    pub fn encode(&self, out: &mut Vec<u32>) {
        match *self {
            Self::SemaphoreWait {
                address,
                value,
                compare,
            } => push_payload(
                out,
                opcode::SEMAPHORE_WAIT,
                &SemaphoreWaitPayload {
                    address: AddrWords::of(address),
                    value: QwordWords::of(value),
                    compare: compare as u32,
                },
            ),
            Self::StoreDataImm {
                address,
                value,
                qword,
                partition_offset,
            } => {
                let flags = flag(qword, EncodedFlags::QWORD)
                    | flag(partition_offset, EncodedFlags::PARTITIONED);
                push_payload(
                    out,
                    opcode::STORE_DATA_IMM,
                    &StoreDataImmPayload {
                        address: AddrWords::of(address),
                        value: QwordWords::of(value),
                        flags: flags.bits(),
                    },
                )
            }
            Self::Walker(walker) => {
                let flags = flag(walker.partitioned, EncodedFlags::PARTITIONED)
                    | flag(walker.cooperative, EncodedFlags::COOPERATIVE)
                    | flag(walker.indirect.is_some(), EncodedFlags::INDIRECT);
                push_payload(
                    out,
                    opcode::WALKER,
                    &WalkerPayload {
                        group_count: walker.group_count,
                        indirect: AddrWords::of(walker.indirect.unwrap_or(GpuAddr::null())),
                        post_sync: PostSyncWords::of(walker.post_sync),
                        flags: flags.bits(),
                        btp_prefetch: walker.btp_prefetch,
                    },
                )
            }
            Self::PipeControl {
                post_sync,
                stall,
                dc_flush,
                partitioned,
            } => {
                let flags = flag(stall, EncodedFlags::STALL)
                    | flag(dc_flush, EncodedFlags::DC_FLUSH)
                    | flag(partitioned, EncodedFlags::PARTITIONED);
                push_payload(
                    out,
                    opcode::PIPE_CONTROL,
                    &PipeControlPayload {
                        post_sync: PostSyncWords::of(post_sync),
                        flags: flags.bits(),
                    },
                )
            }
            Self::CopyBlt {
                dst,
                src,
                width,
                height,
                dst_pitch,
                src_pitch,
            } => push_payload(
                out,
                opcode::COPY_BLT,
                &CopyBltPayload {
                    dst: AddrWords::of(dst),
                    src: AddrWords::of(src),
                    width,
                    height,
                    dst_pitch,
                    src_pitch,
                },
            ),
            Self::ColorBlt { dst, size, pattern } => push_payload(
                out,
                opcode::COLOR_BLT,
                &FillPayload {
                    dst: AddrWords::of(dst),
                    size: QwordWords::of(size),
                    pattern,
                },
            ),
            Self::MemSet { dst, size, value } => push_payload(
                out,
                opcode::MEM_SET,
                &FillPayload {
                    dst: AddrWords::of(dst),
                    size: QwordWords::of(size),
                    pattern: value as u32,
                },
            ),
            Self::FlushDw { post_sync } => push_payload(
                out,
                opcode::FLUSH_DW,
                &FlushDwPayload {
                    post_sync: PostSyncWords::of(post_sync),
                },
            ),
            Self::UserInterrupt => out.push(((opcode::USER_INTERRUPT as u32) << 24) | 1),
            Self::BatchBufferStart { address } => push_payload(
                out,
                opcode::BATCH_BUFFER_START,
                &BatchBufferStartPayload {
                    address: AddrWords::of(address),
                },
            ),
        }
    }

    /// Decode one instruction from the front of `words`
    ///
    /// `byte_offset` is only used for error reporting. Returns the
    /// instruction and the number of dwords consumed.
    pub fn decode(words: &[u32], byte_offset: usize) -> Result<(Self, usize)> {
        let malformed = Error::MalformedStream { offset: byte_offset };
        let header = *words.first().ok_or(malformed)?;
        let op = (header >> 24) as u8;
        let len = (header & 0x00ff_ffff) as usize;

        let inst = match op {
            opcode::SEMAPHORE_WAIT => {
                let p: SemaphoreWaitPayload = read_payload(words, byte_offset)?;
                Self::SemaphoreWait {
                    address: p.address.get(),
                    value: p.value.get(),
                    compare: CompareOp::from_raw(p.compare).ok_or(malformed)?,
                }
            }
            opcode::STORE_DATA_IMM => {
                let p: StoreDataImmPayload = read_payload(words, byte_offset)?;
                let flags = EncodedFlags::from_bits_truncate(p.flags);
                Self::StoreDataImm {
                    address: p.address.get(),
                    value: p.value.get(),
                    qword: flags.contains(EncodedFlags::QWORD),
                    partition_offset: flags.contains(EncodedFlags::PARTITIONED),
                }
            }
            opcode::WALKER => {
                let p: WalkerPayload = read_payload(words, byte_offset)?;
                let flags = EncodedFlags::from_bits_truncate(p.flags);
                Self::Walker(WalkerCmd {
                    group_count: p.group_count,
                    indirect: flags
                        .contains(EncodedFlags::INDIRECT)
                        .then(|| p.indirect.get()),
                    post_sync: p.post_sync.get().ok_or(malformed)?,
                    partitioned: flags.contains(EncodedFlags::PARTITIONED),
                    btp_prefetch: p.btp_prefetch,
                    cooperative: flags.contains(EncodedFlags::COOPERATIVE),
                })
            }
            opcode::PIPE_CONTROL => {
                let p: PipeControlPayload = read_payload(words, byte_offset)?;
                let flags = EncodedFlags::from_bits_truncate(p.flags);
                Self::PipeControl {
                    post_sync: p.post_sync.get().ok_or(malformed)?,
                    stall: flags.contains(EncodedFlags::STALL),
                    dc_flush: flags.contains(EncodedFlags::DC_FLUSH),
                    partitioned: flags.contains(EncodedFlags::PARTITIONED),
                }
            }
            opcode::COPY_BLT => {
                let p: CopyBltPayload = read_payload(words, byte_offset)?;
                Self::CopyBlt {
                    dst: p.dst.get(),
                    src: p.src.get(),
                    width: p.width,
                    height: p.height,
                    dst_pitch: p.dst_pitch,
                    src_pitch: p.src_pitch,
                }
            }
            opcode::COLOR_BLT => {
                let p: FillPayload = read_payload(words, byte_offset)?;
                Self::ColorBlt {
                    dst: p.dst.get(),
                    size: p.size.get(),
                    pattern: p.pattern,
                }
            }
            opcode::MEM_SET => {
                let p: FillPayload = read_payload(words, byte_offset)?;
                Self::MemSet {
                    dst: p.dst.get(),
                    size: p.size.get(),
                    value: p.pattern as u8,
                }
            }
            opcode::FLUSH_DW => {
                let p: FlushDwPayload = read_payload(words, byte_offset)?;
                Self::FlushDw {
                    post_sync: p.post_sync.get().ok_or(malformed)?,
                }
            }
            opcode::USER_INTERRUPT => Self::UserInterrupt,
            opcode::BATCH_BUFFER_START => {
                let p: BatchBufferStartPayload = read_payload(words, byte_offset)?;
                Self::BatchBufferStart {
                    address: p.address.get(),
                }
            }
            _ => return Err(malformed),
        };

        if len != inst.size_dwords() {
            return Err(malformed);
        }
        Ok((inst, len))
    }
}

/// Decode a whole dword stream
pub fn decode_all(words: &[u32]) -> Result<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < words.len() {
        let (inst, len) = Instruction::decode(&words[at..], at * 4)?;
        out.push(inst);
        at += len;
    }
    Ok(out)
}
