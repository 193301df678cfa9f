//! # Command Batch
//!
//! Instructions for one append are collected here first and written to the
//! command stream in a single step, so a failing append never leaves a
//! partially written stream behind.

use alloc::vec::Vec;

use crate::instruction::{Instruction, InstructionKind};

/// Ordered instructions awaiting a stream write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBatch {
    instructions: Vec<Instruction>,
}

impl CommandBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one instruction
    pub fn push(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    /// Instructions in order
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Iterate instructions
    pub fn iter(&self) -> core::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Encoded size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.instructions.iter().map(Instruction::size_bytes).sum()
    }

    /// Number of instructions of `kind`
    pub fn count(&self, kind: InstructionKind) -> usize {
        self.instructions.iter().filter(|i| i.kind() == kind).count()
    }

    /// Encode every instruction
    pub fn encode(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity((self.size_bytes() / 4) as usize);
        for inst in &self.instructions {
            inst.encode(&mut out);
        }
        out
    }

    /// Drop all instructions
    pub fn clear(&mut self) {
        self.instructions.clear();
    }
}

impl Extend<Instruction> for CommandBatch {
    fn extend<T: IntoIterator<Item = Instruction>>(&mut self, iter: T) {
        self.instructions.extend(iter);
    }
}

impl<'a> IntoIterator for &'a CommandBatch {
    type Item = &'a Instruction;
    type IntoIter = core::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
