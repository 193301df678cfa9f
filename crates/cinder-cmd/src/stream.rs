//! # Command Stream
//!
//! Append-only instruction storage backed by command-buffer allocations.
//! The tail of every buffer is reserved for a batch buffer start; when the
//! next batch does not fit, the stream jumps to a fresh buffer.
//!
//! ```text
//!   buffer 0                         buffer 1
//!  ┌──────────────────────┬─────┐   ┌───────────────────────────┐
//!  │ instructions ...     │ BBS ├──►│ instructions ...          │
//!  └──────────────────────┴─────┘   └───────────────────────────┘
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use cinder_core::{Error, GpuAddr, Result};
use cinder_mem::{AllocDesc, AllocationKind, GpuAllocation, MemoryAllocator};

use crate::batch::CommandBatch;
use crate::instruction::{Instruction, BATCH_BUFFER_START_SIZE};

/// Position inside a command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMark {
    buffer: usize,
    offset: u64,
}

/// Stream statistics
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Batches written
    pub batches: u64,
    /// Bytes written, chaining included
    pub bytes_written: u64,
    /// Jumps to another buffer
    pub chains: u64,
}

/// Chained command stream
pub struct CommandStream {
    allocator: Arc<dyn MemoryAllocator>,
    buffer_size: u64,
    buffers: Vec<Arc<GpuAllocation>>,
    current: usize,
    used: u64,
    stats: StreamStats,
}

impl CommandStream {
    /// Create a stream and allocate its first buffer
    pub fn new(allocator: Arc<dyn MemoryAllocator>, buffer_size: u64) -> Result<Self> {
        if buffer_size < BATCH_BUFFER_START_SIZE * 2 || buffer_size % 4 != 0 {
            return Err(Error::InvalidArgument);
        }
        let first = allocator.allocate(&AllocDesc::new(AllocationKind::CommandBuffer, buffer_size))?;
        Ok(Self {
            allocator,
            buffer_size,
            buffers: alloc::vec![first],
            current: 0,
            used: 0,
            stats: StreamStats::default(),
        })
    }

    /// Bytes usable for instructions in one buffer
    pub fn capacity(&self) -> u64 {
        self.buffer_size - BATCH_BUFFER_START_SIZE
    }

    /// Bytes used in the current buffer
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Bytes left in the current buffer
    pub fn available(&self) -> u64 {
        self.capacity() - self.used
    }

    /// Buffers owned by the stream
    pub fn buffers(&self) -> &[Arc<GpuAllocation>] {
        &self.buffers
    }

    /// Buffers reachable from the start of the stream
    pub fn active_buffers(&self) -> &[Arc<GpuAllocation>] {
        &self.buffers[..=self.current]
    }

    /// Statistics snapshot
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Current write position
    pub fn mark(&self) -> StreamMark {
        StreamMark {
            buffer: self.current,
            offset: self.used,
        }
    }

    /// GPU address of a position
    pub fn address_of(&self, mark: StreamMark) -> GpuAddr {
        self.buffers
            .get(mark.buffer)
            .map_or(GpuAddr::null(), |b| b.gpu_address_at(mark.offset))
    }

    /// True when nothing was written since `mark`
    pub fn is_empty_since(&self, mark: StreamMark) -> bool {
        mark == self.mark()
    }

    /// Write a batch; on error nothing is written
    pub fn append_batch(&mut self, batch: &CommandBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Plan the layout before touching any buffer
        let capacity = self.capacity();
        let mut pos = self.used;
        let mut jumps = 0usize;
        for inst in batch {
            let size = inst.size_bytes();
            if size > capacity {
                return Err(Error::InvalidArgument);
            }
            if pos + size > capacity {
                jumps += 1;
                pos = 0;
            }
            pos += size;
        }

        let spare = self.buffers.len() - 1 - self.current;
        let mut fresh = Vec::new();
        for _ in spare..jumps {
            let desc = AllocDesc::new(AllocationKind::CommandBuffer, self.buffer_size);
            fresh.push(self.allocator.allocate(&desc)?);
        }
        self.buffers.extend(fresh);

        let mut words = Vec::new();
        for inst in batch {
            if self.used + inst.size_bytes() > capacity {
                self.chain();
            }
            words.clear();
            inst.encode(&mut words);
            self.write_words(&words);
        }
        self.stats.batches += 1;
        Ok(())
    }

    fn write_words(&mut self, words: &[u32]) {
        let buffer = &self.buffers[self.current];
        for (i, word) in words.iter().enumerate() {
            buffer.store_u32(self.used + i as u64 * 4, *word);
        }
        let bytes = words.len() as u64 * 4;
        self.used += bytes;
        self.stats.bytes_written += bytes;
    }

    fn chain(&mut self) {
        let next = self.buffers[self.current + 1].gpu_address();
        let mut words = Vec::new();
        Instruction::BatchBufferStart { address: next }.encode(&mut words);

        // The reserved tail always fits the jump
        let buffer = &self.buffers[self.current];
        for (i, word) in words.iter().enumerate() {
            buffer.store_u32(self.used + i as u64 * 4, *word);
        }
        self.stats.bytes_written += BATCH_BUFFER_START_SIZE;
        self.stats.chains += 1;

        log::debug!(
            "cinder-cmd: stream chained from buffer {} to {} at {}",
            self.current,
            self.current + 1,
            next
        );
        self.current += 1;
        self.used = 0;
    }

    /// Decode everything written after `mark`, following chaining jumps
    ///
    /// Jumps themselves are not returned.
    pub fn instructions_since(&self, mark: StreamMark) -> Result<Vec<Instruction>> {
        let mut out = Vec::new();
        let mut buffer = mark.buffer;
        let mut offset = mark.offset;

        while buffer <= self.current {
            let storage = self
                .buffers
                .get(buffer)
                .ok_or(Error::MalformedStream { offset: 0 })?;
            let limit = if buffer == self.current {
                self.used
            } else {
                self.buffer_size
            };
            let words: Vec<u32> = (offset..limit)
                .step_by(4)
                .map(|at| storage.load_u32(at))
                .collect();

            let mut at = 0usize;
            let mut jumped = false;
            while at < words.len() {
                let byte_offset = offset as usize + at * 4;
                let (inst, len) = Instruction::decode(&words[at..], byte_offset)?;
                if let Instruction::BatchBufferStart { address } = inst {
                    let target = self.buffers.get(buffer + 1).map(|b| b.gpu_address());
                    if target != Some(address) {
                        return Err(Error::MalformedStream {
                            offset: byte_offset,
                        });
                    }
                    jumped = true;
                    break;
                }
                out.push(inst);
                at += len;
            }

            if buffer == self.current {
                break;
            }
            if !jumped {
                return Err(Error::MalformedStream {
                    offset: limit as usize,
                });
            }
            buffer += 1;
            offset = 0;
        }
        Ok(out)
    }

    /// Decode the whole stream
    pub fn instructions(&self) -> Result<Vec<Instruction>> {
        self.instructions_since(StreamMark::default())
    }

    /// Rewind to the start of the first buffer, keeping buffers for reuse
    pub fn reset(&mut self) {
        self.current = 0;
        self.used = 0;
    }
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("buffer_size", &self.buffer_size)
            .field("buffers", &self.buffers.len())
            .field("current", &self.current)
            .field("used", &self.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{CompareOp, InstructionKind};
    use cinder_mem::HostAllocator;

    fn semaphore(value: u64) -> Instruction {
        Instruction::SemaphoreWait {
            address: GpuAddr::new(0x1000),
            value,
            compare: CompareOp::GreaterOrEqual,
        }
    }

    fn batch_of(count: u64) -> CommandBatch {
        let mut batch = CommandBatch::new();
        for i in 0..count {
            batch.push(semaphore(i));
        }
        batch
    }

    #[test]
    fn test_append_and_decode() {
        let mut stream = CommandStream::new(Arc::new(HostAllocator::unbounded()), 4096).unwrap();
        let start = stream.mark();
        stream.append_batch(&batch_of(3)).unwrap();

        assert_eq!(stream.used(), 3 * 24);
        let decoded = stream.instructions_since(start).unwrap();
        assert_eq!(decoded, batch_of(3).instructions());

        let mid = stream.mark();
        stream.append_batch(&batch_of(1)).unwrap();
        assert_eq!(stream.instructions_since(mid).unwrap().len(), 1);
        assert_eq!(stream.instructions().unwrap().len(), 4);
    }

    #[test]
    fn test_chains_when_buffer_exhausted() {
        // Five semaphores fill the 120 usable bytes, the sixth chains
        let mut stream = CommandStream::new(Arc::new(HostAllocator::unbounded()), 132).unwrap();
        assert_eq!(stream.capacity(), 120);

        stream.append_batch(&batch_of(4)).unwrap();
        assert_eq!(stream.available(), 24);
        stream.append_batch(&batch_of(2)).unwrap();

        assert_eq!(stream.buffers().len(), 2);
        assert_eq!(stream.stats().chains, 1);
        assert_eq!(stream.used(), 24);

        let all = stream.instructions().unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.iter().all(|i| i.kind() == InstructionKind::SemaphoreWait));

        let first = stream.buffers()[0].clone();
        let jump = first.load_u32(120);
        assert_eq!(jump >> 24, crate::instruction::opcode::BATCH_BUFFER_START as u32);
    }

    #[test]
    fn test_failed_allocation_leaves_stream_untouched() {
        let allocator = Arc::new(HostAllocator::new(132));
        let mut stream = CommandStream::new(allocator, 132).unwrap();
        stream.append_batch(&batch_of(4)).unwrap();

        let before = stream.mark();
        assert_eq!(stream.append_batch(&batch_of(2)), Err(Error::OutOfMemory));
        assert_eq!(stream.mark(), before);
        assert_eq!(stream.instructions().unwrap().len(), 4);
    }

    #[test]
    fn test_reset_reuses_buffers() {
        let allocator = Arc::new(HostAllocator::unbounded());
        let mut stream = CommandStream::new(allocator, 132).unwrap();
        stream.append_batch(&batch_of(6)).unwrap();
        assert_eq!(stream.buffers().len(), 2);

        stream.reset();
        assert!(stream.instructions().unwrap().is_empty());
        stream.append_batch(&batch_of(6)).unwrap();
        assert_eq!(stream.buffers().len(), 2);
        assert_eq!(stream.instructions().unwrap().len(), 6);
    }

    #[test]
    fn test_oversized_instruction_rejected() {
        let mut stream = CommandStream::new(Arc::new(HostAllocator::unbounded()), 32).unwrap();
        assert_eq!(stream.append_batch(&batch_of(1)), Err(Error::InvalidArgument));
    }
}
