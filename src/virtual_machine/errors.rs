use crate::types::encoding::DecodeError;
use kvm_derive::Error;

/// Errors raised while writing, assembling, loading or executing bytecode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VMError {
    // ==================== Bytecode writer ====================
    /// Emitting an instruction would exceed the writer's capacity.
    #[error("bytecode capacity exceeded: {requested} bytes requested, {remaining} remaining")]
    CapacityExceeded { requested: usize, remaining: usize },
    #[error("label table is full ({max} labels)")]
    TooManyLabels { max: usize },
    #[error("label {label} does not exist ({count} labels created)")]
    InvalidLabel { label: u32, count: usize },
    #[error("label {label} is already placed at offset {offset}")]
    LabelAlreadyPlaced { label: u32, offset: u32 },
    #[error("label {label} is referenced but never placed")]
    UnplacedLabel { label: u32 },

    // ==================== Text assembly ====================
    #[error("unknown instruction '{name}'")]
    InvalidInstructionName { name: String },
    #[error("operand count mismatch for {instruction}: expected {expected}, got {actual}")]
    ArityMismatch {
        instruction: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid operand '{token}': expected {expected}")]
    InvalidOperand {
        token: String,
        expected: &'static str,
    },
    #[error("duplicate label '{label}'")]
    DuplicateLabel { label: String },
    #[error("undefined label '{label}'")]
    UndefinedLabel { label: String },
    #[error("duplicate variable '{name}'")]
    DuplicateVariable { name: String },
    #[error("unknown directive '{directive}'")]
    UnknownDirective { directive: String },
    #[error("line {line}:{offset}: {message}")]
    ParseError {
        line: usize,
        offset: usize,
        message: &'static str,
    },
    #[error("line {line}:{offset}: {source}")]
    AssemblyError {
        line: usize,
        offset: usize,
        source: String,
    },
    #[error("cannot read {path}: {source}")]
    IoError { path: String, source: String },

    // ==================== Execution ====================
    #[error("entry point {offset} is outside the bytecode ({len} bytes)")]
    InvalidEntryPoint { offset: u32, len: usize },
    #[error("invalid instruction 0x{opcode:02x} at offset {offset}")]
    InvalidInstruction { opcode: u8, offset: usize },
    #[error(
        "unexpected end of bytecode at offset {ip}: needed {requested} bytes, {available} available"
    )]
    UnexpectedEndOfBytecode {
        ip: usize,
        requested: usize,
        available: usize,
    },
    #[error("stack overflow (capacity {capacity} words)")]
    StackOverflow { capacity: usize },
    #[error("stack underflow: {required} words required, sp is {sp}")]
    StackUnderflow { required: usize, sp: usize },
    #[error("stack index {index} out of bounds (sp {sp})")]
    StackIndexOutOfBounds { index: i64, sp: usize },
    #[error("environment index {index} out of bounds ({size} words)")]
    EnvironmentIndexOutOfBounds { index: i64, size: usize },
    #[error("step limit of {limit} instructions exceeded")]
    StepLimitExceeded { limit: u64 },
    #[error(
        "syscall with {arg_count} arguments left sp at {sp_after}, below its entry value {sp_before}"
    )]
    SyscallUnbalanced {
        arg_count: u32,
        sp_before: usize,
        sp_after: usize,
    },
    #[error("SYSCALL with {arg_count} arguments but no handler is installed")]
    NoSyscallHandler { arg_count: u32 },

    // ==================== Host conventions ====================
    #[error("unknown syscall code {code}")]
    UnknownSyscall { code: u32 },

    // ==================== Resources ====================
    #[error("decoding error: {reason}")]
    DecodeError { reason: String },
}

impl From<DecodeError> for VMError {
    fn from(err: DecodeError) -> Self {
        VMError::DecodeError {
            reason: err.to_string(),
        }
    }
}
