//! Stack-based bytecode interpreter.
//!
//! A [`Vm`] owns a fixed-capacity word stack and borrows the host's
//! environment (a flat `u32` slice) for its whole lifetime. [`Vm::call`] runs
//! finished bytecode from an entry offset until `END`, calling back into a
//! [`SyscallHandler`] for every `SYSCALL`.
//!
//! # Addressing
//!
//! The accessors share one index convention: `idx >= 0` addresses
//! `environment[idx]`, `idx < 0` addresses the stack relative to `sp`
//! (`-1` is the top). 64-bit values and host pointers span two words,
//! low word at `idx`, high word at `idx + 1`. Every access is bounds checked.

mod limits;
mod stack;
mod syscall;

pub use limits::{KVM_STACK_SIZE, VmConfig};
pub use syscall::{FnSyscall, NoSyscalls, SyscallHandler, syscall_fn};

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::writer::INVALID_LABEL;
use crate::warn;
use limits::StepBudget;
use stack::Stack;

/// One stack or environment slot.
pub type Word = u32;

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Halt,
}

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        cursor = $cursor:ident,
        syscall = $syscall:ident,
        instr = $instr:ident,
        halt = $halt:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $instr {
            Instruction::$halt => Ok(Flow::Halt),
            $(
                Instruction::$variant => {
                    exec_vm!(@call $vm, $cursor, $syscall, $handler, $args)?;
                    Ok(Flow::Continue)
                }
            ),*
        }
    }};

    // Handler that calls back into the host
    (@call $vm:ident, $cursor:ident, $syscall:ident, $handler:ident,
        (syscall; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $cursor, $kind)?; )*
        $vm.$handler($syscall, $( $field ),*)
    }};

    // Handler that moves the instruction pointer
    (@call $vm:ident, $cursor:ident, $syscall:ident, $handler:ident,
        (cursor; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $cursor, $kind)?; )*
        $vm.$handler($cursor, $( $field ),*)
    }};

    // Plain stack handler
    (@call $vm:ident, $cursor:ident, $syscall:ident, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $cursor, $kind)?; )*
        $vm.$handler($( $field ),*)
    }};

    (@read $cursor:ident, ImmU32) => {
        $cursor.read_array::<4>().map(u32::from_le_bytes)
    };

    (@read $cursor:ident, ImmU64) => {
        $cursor.read_array::<8>().map(u64::from_le_bytes)
    };

    (@read $cursor:ident, Index) => {
        $cursor.read_array::<4>().map(i32::from_le_bytes)
    };

    (@read $cursor:ident, Label) => {
        $cursor.read_array::<4>().map(u32::from_le_bytes)
    };
}

/// Read position inside the bytecode being executed.
struct Cursor<'c> {
    code: &'c [u8],
    ip: usize,
}

impl<'c> Cursor<'c> {
    fn read_exact(&mut self, count: usize) -> Result<&'c [u8], VMError> {
        let code = self.code;
        let start = self.ip;
        let available = code.len().saturating_sub(start);
        let bytes = start
            .checked_add(count)
            .and_then(|end| code.get(start..end))
            .ok_or(VMError::UnexpectedEndOfBytecode {
                ip: start,
                requested: count,
                available,
            })?;
        self.ip += count;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], VMError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    fn jump(&mut self, target: u32) {
        self.ip = target as usize;
    }
}

/// Bytecode interpreter bound to one host environment.
///
/// Constructing a `Vm` is the `init` step: `sp` starts at zero and the
/// environment stays borrowed until the VM is dropped. `sp` carries over
/// between calls; a balanced program leaves it where it found it.
pub struct Vm<'env> {
    stack: Stack,
    environment: &'env mut [Word],
    config: VmConfig,
    /// Instructions executed by the most recent `call`.
    steps: u64,
}

impl<'env> Vm<'env> {
    pub fn new(environment: &'env mut [Word]) -> Self {
        Self::with_config(environment, VmConfig::default())
    }

    pub fn with_config(environment: &'env mut [Word], config: VmConfig) -> Self {
        Self {
            stack: Stack::new(config.stack_size),
            environment,
            config,
            steps: 0,
        }
    }

    /// Rebinds the environment and empties the stack.
    pub fn init(&mut self, environment: &'env mut [Word]) {
        self.environment = environment;
        self.reset();
    }

    /// Empties the stack (`sp = 0`).
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Current stack pointer, in words.
    pub fn sp(&self) -> usize {
        self.stack.sp()
    }

    /// Live stack words, bottom first.
    pub fn stack(&self) -> &[Word] {
        self.stack.live()
    }

    pub fn environment(&self) -> &[Word] {
        &*self.environment
    }

    pub fn environment_mut(&mut self) -> &mut [Word] {
        &mut *self.environment
    }

    /// Instructions executed by the most recent [`Vm::call`], including
    /// the final `END`.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Runs `bytecode` from byte offset `entry` until `END`.
    ///
    /// Runtime errors abort the call. The stack is left as it was at the
    /// failing instruction; [`Vm::reset`] makes the VM reusable.
    pub fn call<H>(&mut self, bytecode: &[u8], syscall: &mut H, entry: u32) -> Result<(), VMError>
    where
        H: SyscallHandler + ?Sized,
    {
        // Return offsets are pushed as words, so the code must be addressable by u32.
        if entry == INVALID_LABEL
            || entry as usize >= bytecode.len()
            || bytecode.len() > INVALID_LABEL as usize
        {
            return Err(VMError::InvalidEntryPoint {
                offset: entry,
                len: bytecode.len(),
            });
        }

        let mut cursor = Cursor {
            code: bytecode,
            ip: entry as usize,
        };
        let mut budget = StepBudget::new(self.config.step_limit);
        let result = self.run(&mut cursor, syscall, &mut budget);
        self.steps = budget.used();

        if let Err(VMError::StepLimitExceeded { limit }) = &result {
            warn!(
                "step limit of {limit} reached at offset {} (entry {entry})",
                cursor.ip
            );
        }
        result
    }

    fn run<H>(
        &mut self,
        cursor: &mut Cursor<'_>,
        syscall: &mut H,
        budget: &mut StepBudget,
    ) -> Result<(), VMError>
    where
        H: SyscallHandler + ?Sized,
    {
        loop {
            budget.charge()?;
            let offset = cursor.ip;
            let [opcode] = cursor.read_array::<1>()?;
            let instr = Instruction::try_from(opcode)
                .map_err(|_| VMError::InvalidInstruction { opcode, offset })?;
            if self.exec(instr, cursor, syscall)? == Flow::Halt {
                return Ok(());
            }
            debug_assert!(self.stack.sp() <= self.stack.capacity());
        }
    }

    /// Executes a single instruction whose opcode has been consumed.
    fn exec<H>(
        &mut self,
        instruction: Instruction,
        cursor: &mut Cursor<'_>,
        syscall: &mut H,
    ) -> Result<Flow, VMError>
    where
        H: SyscallHandler + ?Sized,
    {
        exec_vm! {
            vm = self,
            cursor = cursor,
            syscall = syscall,
            instr = instruction,
            halt = End,
            {
                // Host interface
                Syscall => op_syscall(syscall; argc: ImmU32),
                // Stack and environment
                Const32 => op_const32(value: ImmU32),
                Const64 => op_const64(value: ImmU64),
                Pop => op_pop(),
                Get => op_get(idx: Index),
                GetLocal => op_get_local(idx: Index),
                Set => op_set(idx: Index),
                // Arithmetic
                Add => op_add(),
                AddF => op_addf(),
                Mul => op_mul(),
                MulF => op_mulf(),
                // Compare and branch
                Eq => op_eq(cursor; target: Label),
                Neq => op_neq(cursor; target: Label),
                Lt => op_lt(cursor; target: Label),
                Gt => op_gt(cursor; target: Label),
                LtF => op_ltf(cursor; target: Label),
                GtF => op_gtf(cursor; target: Label),
                // Control flow
                Jmp => op_jmp(cursor; target: Label),
                Call => op_call(cursor; target: Label),
                Ret => op_ret(cursor;),
            }
        }
    }

    // ==================== Accessors ====================

    /// Reads one word (see the module docs for index rules).
    pub fn get(&self, idx: i32) -> Result<Word, VMError> {
        if idx < 0 {
            self.stack.read(idx as i64)
        } else {
            self.load(idx)
        }
    }

    pub fn get_float(&self, idx: i32) -> Result<f32, VMError> {
        self.get(idx).map(f32::from_bits)
    }

    /// Reads a 64-bit value from `idx` (low) and `idx + 1` (high).
    pub fn get64(&self, idx: i32) -> Result<u64, VMError> {
        let (low, high) = self.pair_indices(idx)?;
        Ok(u64::from(self.get(low)?) | (u64::from(self.get(high)?) << 32))
    }

    /// Reads a host pointer stored with [`Vm::push_ptr`] or [`Vm::set_ptr`].
    pub fn get_ptr(&self, idx: i32) -> Result<usize, VMError> {
        // Stored as 64 bits, so this is lossless for pointers of this host.
        self.get64(idx).map(|raw| raw as usize)
    }

    /// Writes one word in place.
    pub fn set(&mut self, idx: i32, value: Word) -> Result<(), VMError> {
        if idx < 0 {
            self.stack.write(idx as i64, value)
        } else {
            self.store(idx, value)
        }
    }

    pub fn set_float(&mut self, idx: i32, value: f32) -> Result<(), VMError> {
        self.set(idx, value.to_bits())
    }

    pub fn set64(&mut self, idx: i32, value: u64) -> Result<(), VMError> {
        let (low, high) = self.pair_indices(idx)?;
        // Check both slots before writing either.
        self.get(high)?;
        self.set(low, value as u32)?;
        self.set(high, (value >> 32) as u32)
    }

    pub fn set_ptr(&mut self, idx: i32, ptr: usize) -> Result<(), VMError> {
        self.set64(idx, ptr as u64)
    }

    pub fn push(&mut self, value: Word) -> Result<(), VMError> {
        self.stack.push(value)
    }

    pub fn push_float(&mut self, value: f32) -> Result<(), VMError> {
        self.push(value.to_bits())
    }

    /// Pushes the low word, then the high word.
    pub fn push64(&mut self, value: u64) -> Result<(), VMError> {
        if self.stack.capacity() - self.stack.sp() < 2 {
            return Err(VMError::StackOverflow {
                capacity: self.stack.capacity(),
            });
        }
        self.push(value as u32)?;
        self.push((value >> 32) as u32)
    }

    /// Pushes an opaque host handle as two words.
    pub fn push_ptr(&mut self, ptr: usize) -> Result<(), VMError> {
        self.push64(ptr as u64)
    }

    pub fn pop(&mut self) -> Result<Word, VMError> {
        self.stack.pop()
    }

    /// Index pair for a two-word value; both must address the same region.
    fn pair_indices(&self, idx: i32) -> Result<(i32, i32), VMError> {
        match idx.checked_add(1) {
            Some(high) if idx >= 0 || high < 0 => Ok((idx, high)),
            _ if idx < 0 => Err(VMError::StackIndexOutOfBounds {
                index: i64::from(idx) + 1,
                sp: self.stack.sp(),
            }),
            _ => Err(VMError::EnvironmentIndexOutOfBounds {
                index: i64::from(idx) + 1,
                size: self.environment.len(),
            }),
        }
    }

    fn load(&self, idx: i32) -> Result<Word, VMError> {
        usize::try_from(idx)
            .ok()
            .and_then(|at| self.environment.get(at))
            .copied()
            .ok_or(VMError::EnvironmentIndexOutOfBounds {
                index: i64::from(idx),
                size: self.environment.len(),
            })
    }

    fn store(&mut self, idx: i32, value: Word) -> Result<(), VMError> {
        let size = self.environment.len();
        let slot = usize::try_from(idx)
            .ok()
            .and_then(|at| self.environment.get_mut(at))
            .ok_or(VMError::EnvironmentIndexOutOfBounds {
                index: i64::from(idx),
                size,
            })?;
        *slot = value;
        Ok(())
    }

    // ==================== Host interface ====================

    fn op_syscall<H>(&mut self, syscall: &mut H, argc: u32) -> Result<(), VMError>
    where
        H: SyscallHandler + ?Sized,
    {
        let arg_count = argc as usize;
        self.stack.require(arg_count)?;
        let sp_before = self.stack.sp();

        syscall.syscall(self, argc)?;

        let sp_after = self.stack.sp();
        if sp_after < sp_before {
            return Err(VMError::SyscallUnbalanced {
                arg_count: argc,
                sp_before,
                sp_after,
            });
        }
        self.stack.collapse(sp_before - arg_count, sp_before);
        Ok(())
    }

    // ==================== Stack and environment ====================

    fn op_const32(&mut self, value: u32) -> Result<(), VMError> {
        self.push(value)
    }

    fn op_const64(&mut self, value: u64) -> Result<(), VMError> {
        self.push64(value)
    }

    fn op_pop(&mut self) -> Result<(), VMError> {
        self.stack.pop().map(drop)
    }

    fn op_get(&mut self, idx: i32) -> Result<(), VMError> {
        let value = self.load(idx)?;
        self.push(value)
    }

    fn op_get_local(&mut self, idx: i32) -> Result<(), VMError> {
        if idx < 0 {
            return Err(VMError::StackIndexOutOfBounds {
                index: i64::from(idx),
                sp: self.stack.sp(),
            });
        }
        let value = self.stack.read(i64::from(idx))?;
        self.push(value)
    }

    fn op_set(&mut self, idx: i32) -> Result<(), VMError> {
        let value = self.stack.pop()?;
        self.store(idx, value)
    }

    // ==================== Arithmetic ====================

    fn binary(&mut self, op: impl FnOnce(Word, Word) -> Word) -> Result<(), VMError> {
        let (a, b) = self.stack.pop2()?;
        self.push(op(a, b))
    }

    fn binary_float(&mut self, op: impl FnOnce(f32, f32) -> f32) -> Result<(), VMError> {
        self.binary(|a, b| op(f32::from_bits(a), f32::from_bits(b)).to_bits())
    }

    fn op_add(&mut self) -> Result<(), VMError> {
        self.binary(Word::wrapping_add)
    }

    fn op_addf(&mut self) -> Result<(), VMError> {
        self.binary_float(|a, b| a + b)
    }

    fn op_mul(&mut self) -> Result<(), VMError> {
        self.binary(Word::wrapping_mul)
    }

    fn op_mulf(&mut self) -> Result<(), VMError> {
        self.binary_float(|a, b| a * b)
    }

    // ==================== Compare and branch ====================

    /// Pops `a` and `b`; falls through when `holds(a, b)`, otherwise jumps.
    fn branch_unless(
        &mut self,
        cursor: &mut Cursor<'_>,
        target: u32,
        holds: impl FnOnce(Word, Word) -> bool,
    ) -> Result<(), VMError> {
        let (a, b) = self.stack.pop2()?;
        if !holds(a, b) {
            cursor.jump(target);
        }
        Ok(())
    }

    fn op_eq(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        self.branch_unless(cursor, target, |a, b| a == b)
    }

    fn op_neq(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        self.branch_unless(cursor, target, |a, b| a != b)
    }

    fn op_lt(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        self.branch_unless(cursor, target, |a, b| a < b)
    }

    fn op_gt(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        self.branch_unless(cursor, target, |a, b| a > b)
    }

    fn op_ltf(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        self.branch_unless(cursor, target, |a, b| {
            f32::from_bits(a) < f32::from_bits(b)
        })
    }

    fn op_gtf(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        self.branch_unless(cursor, target, |a, b| {
            f32::from_bits(a) > f32::from_bits(b)
        })
    }

    // ==================== Control flow ====================

    fn op_jmp(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        cursor.jump(target);
        Ok(())
    }

    fn op_call(&mut self, cursor: &mut Cursor<'_>, target: u32) -> Result<(), VMError> {
        // `call` rejects code longer than u32 offsets.
        self.push(cursor.ip as u32)?;
        cursor.jump(target);
        Ok(())
    }

    fn op_ret(&mut self, cursor: &mut Cursor<'_>) -> Result<(), VMError> {
        let target = self.stack.pop()?;
        cursor.jump(target);
        Ok(())
    }
}
