//! Bytecode writer.
//!
//! [`BytecodeWriter`] appends encoded instructions to a bounded buffer and
//! keeps a table of labels. Branches and calls are emitted with the label
//! *id* as a placeholder; [`BytecodeWriter::end_write`] walks the finished
//! stream once, decoding each instruction with the shared ISA table, and
//! replaces every placeholder with the label's byte offset.
//!
//! ```ignore
//! let mut w = BytecodeWriter::new(256);
//! let done = w.create_label()?;
//! w.const32(1)?;
//! w.jmp(done)?;
//! w.const32(2)?;
//! w.place_label(done)?;
//! w.end()?;
//! let bytecode = w.end_write()?;
//! ```

use crate::debug;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, OPERAND_OFFSET, OperandKind};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Offset value of a label that has not been placed.
pub const INVALID_LABEL: u32 = u32::MAX;

/// Maximum number of labels one writer can create.
pub const MAX_LABELS: usize = 1024;

/// Capacity used by [`BytecodeWriter::default`].
pub const DEFAULT_BYTECODE_CAPACITY: usize = 64 * 1024;

/// Code offsets are `u32` and `INVALID_LABEL` is reserved.
const MAX_CAPACITY: usize = (INVALID_LABEL - 1) as usize;

/// Handle to an entry in a writer's label table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    /// Rebuilds a handle from a raw label id.
    pub const fn from_id(id: u32) -> Self {
        Label(id)
    }

    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Operand value passed to [`BytecodeWriter::emit`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Operand {
    Word(u32),
    Wide(u64),
    Index(i32),
    Label(Label),
}

impl Operand {
    pub const fn kind(&self) -> OperandKind {
        match self {
            Operand::Word(_) => OperandKind::ImmU32,
            Operand::Wide(_) => OperandKind::ImmU64,
            Operand::Index(_) => OperandKind::Index,
            Operand::Label(_) => OperandKind::Label,
        }
    }
}

/// Finished, immutable bytecode. Cheap to clone and safe to share between
/// VM instances on different threads.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Bytecode(Arc<[u8]>);

impl Bytecode {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Bytecode {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Bytecode {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Bytecode {
    fn from(code: Vec<u8>) -> Self {
        Bytecode(code.into())
    }
}

impl From<&[u8]> for Bytecode {
    fn from(code: &[u8]) -> Self {
        Bytecode(code.into())
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytecode({} bytes)", self.0.len())
    }
}

/// Append-only bytecode emitter with a bounded label table.
#[derive(Debug)]
pub struct BytecodeWriter {
    code: Vec<u8>,
    capacity: usize,
    /// Resolved offset per label id, `INVALID_LABEL` until placed.
    labels: Vec<u32>,
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new(DEFAULT_BYTECODE_CAPACITY)
    }
}

impl BytecodeWriter {
    /// Starts an empty writer that refuses to grow past `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Self {
            code: Vec::with_capacity(capacity.min(DEFAULT_BYTECODE_CAPACITY)),
            capacity,
            labels: Vec::new(),
        }
    }

    /// Bytes written so far; also the offset of the next instruction.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.code.len()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Adds an unplaced label to the table. Writes nothing.
    pub fn create_label(&mut self) -> Result<Label, VMError> {
        if self.labels.len() >= MAX_LABELS {
            return Err(VMError::TooManyLabels { max: MAX_LABELS });
        }
        let label = Label(self.labels.len() as u32);
        self.labels.push(INVALID_LABEL);
        Ok(label)
    }

    /// Binds `label` to the current write offset. Writes nothing.
    pub fn place_label(&mut self, label: Label) -> Result<(), VMError> {
        let offset = self.code.len() as u32;
        let count = self.labels.len();
        let slot = self
            .labels
            .get_mut(label.0 as usize)
            .ok_or(VMError::InvalidLabel {
                label: label.0,
                count,
            })?;
        if *slot != INVALID_LABEL {
            return Err(VMError::LabelAlreadyPlaced {
                label: label.0,
                offset: *slot,
            });
        }
        *slot = offset;
        Ok(())
    }

    /// Byte offset `label` was placed at.
    pub fn offset_of(&self, label: Label) -> Result<u32, VMError> {
        let offset = *self
            .labels
            .get(label.0 as usize)
            .ok_or(VMError::InvalidLabel {
                label: label.0,
                count: self.labels.len(),
            })?;
        if offset == INVALID_LABEL {
            return Err(VMError::UnplacedLabel { label: label.0 });
        }
        Ok(offset)
    }

    /// Appends one instruction. Nothing is written if the operand does not
    /// match the instruction or the instruction does not fit.
    pub fn emit(&mut self, instr: Instruction, operand: Option<Operand>) -> Result<(), VMError> {
        match (instr.operand_kind(), operand) {
            (None, None) => {}
            (Some(expected), Some(op)) if op.kind() == expected => {}
            (Some(expected), Some(op)) => {
                return Err(VMError::InvalidOperand {
                    token: format!("{op:?}"),
                    expected: expected.describe(),
                });
            }
            (expected, actual) => {
                return Err(VMError::ArityMismatch {
                    instruction: instr.mnemonic().to_string(),
                    expected: expected.is_some() as usize,
                    actual: actual.is_some() as usize,
                });
            }
        }

        if let Some(Operand::Label(label)) = operand
            && label.0 as usize >= self.labels.len()
        {
            return Err(VMError::InvalidLabel {
                label: label.0,
                count: self.labels.len(),
            });
        }

        let size = instr.size();
        if size > self.remaining() {
            return Err(VMError::CapacityExceeded {
                requested: size,
                remaining: self.remaining(),
            });
        }

        self.code.push(instr as u8);
        match operand {
            None => {}
            Some(Operand::Word(v)) => self.code.extend_from_slice(&v.to_le_bytes()),
            Some(Operand::Wide(v)) => self.code.extend_from_slice(&v.to_le_bytes()),
            Some(Operand::Index(v)) => self.code.extend_from_slice(&v.to_le_bytes()),
            Some(Operand::Label(l)) => self.code.extend_from_slice(&l.0.to_le_bytes()),
        }
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::End, None)
    }

    pub fn syscall(&mut self, arg_count: u32) -> Result<(), VMError> {
        self.emit(Instruction::Syscall, Some(Operand::Word(arg_count)))
    }

    pub fn const32(&mut self, value: u32) -> Result<(), VMError> {
        self.emit(Instruction::Const32, Some(Operand::Word(value)))
    }

    /// `CONST32` with the bit pattern of `value`.
    pub fn const_float(&mut self, value: f32) -> Result<(), VMError> {
        self.const32(value.to_bits())
    }

    pub fn const64(&mut self, value: u64) -> Result<(), VMError> {
        self.emit(Instruction::Const64, Some(Operand::Wide(value)))
    }

    pub fn pop(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::Pop, None)
    }

    pub fn get(&mut self, idx: i32) -> Result<(), VMError> {
        self.emit(Instruction::Get, Some(Operand::Index(idx)))
    }

    pub fn get_local(&mut self, idx: i32) -> Result<(), VMError> {
        self.emit(Instruction::GetLocal, Some(Operand::Index(idx)))
    }

    pub fn set(&mut self, idx: i32) -> Result<(), VMError> {
        self.emit(Instruction::Set, Some(Operand::Index(idx)))
    }

    pub fn add(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::Add, None)
    }

    pub fn addf(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::AddF, None)
    }

    pub fn mul(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::Mul, None)
    }

    pub fn mulf(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::MulF, None)
    }

    pub fn eq(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::Eq, Some(Operand::Label(target)))
    }

    pub fn neq(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::Neq, Some(Operand::Label(target)))
    }

    pub fn lt(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::Lt, Some(Operand::Label(target)))
    }

    pub fn gt(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::Gt, Some(Operand::Label(target)))
    }

    pub fn ltf(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::LtF, Some(Operand::Label(target)))
    }

    pub fn gtf(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::GtF, Some(Operand::Label(target)))
    }

    pub fn jmp(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::Jmp, Some(Operand::Label(target)))
    }

    pub fn call(&mut self, target: Label) -> Result<(), VMError> {
        self.emit(Instruction::Call, Some(Operand::Label(target)))
    }

    pub fn ret(&mut self) -> Result<(), VMError> {
        self.emit(Instruction::Ret, None)
    }

    /// Resolves every label operand and returns the finished bytecode.
    ///
    /// Consuming the writer guarantees the patch pass runs exactly once.
    pub fn end_write(mut self) -> Result<Bytecode, VMError> {
        let mut ip = 0;
        while ip < self.code.len() {
            let opcode = self.code[ip];
            let instr = Instruction::try_from(opcode)
                .map_err(|_| VMError::InvalidInstruction { opcode, offset: ip })?;

            if instr.has_label_operand() {
                let at = ip + OPERAND_OFFSET;
                let len = self.code.len();
                let field = self
                    .code
                    .get_mut(at..at + 4)
                    .ok_or(VMError::UnexpectedEndOfBytecode {
                        ip: at,
                        requested: 4,
                        available: len.saturating_sub(at),
                    })?;
                let mut id = [0u8; 4];
                id.copy_from_slice(field);
                let id = u32::from_le_bytes(id);
                let offset = *self.labels.get(id as usize).ok_or(VMError::InvalidLabel {
                    label: id,
                    count: self.labels.len(),
                })?;
                if offset == INVALID_LABEL {
                    return Err(VMError::UnplacedLabel { label: id });
                }
                field.copy_from_slice(&offset.to_le_bytes());
            }

            ip += instr.size();
        }

        debug!(
            "bytecode finished: {} bytes, {} labels",
            self.code.len(),
            self.labels.len()
        );
        Ok(Bytecode::from(self.code))
    }
}
