//! Instruction Set Architecture (ISA) definitions.
//!
//! [`for_each_instruction!`](crate::for_each_instruction) holds the canonical
//! instruction table and hands it to a callback macro, so the enum, operand
//! sizes, the writer's label patching, the text assembler and the interpreter
//! dispatch are all generated from one list.
//!
//! # Bytecode Format
//!
//! Every instruction is a 1-byte opcode followed by fixed-size little-endian
//! operands, densely packed:
//! - `ImmU32`: 4 bytes, a raw word (floats are stored by bit pattern)
//! - `ImmU64`: 8 bytes, pushed as two words, low word first
//! - `Index`: 4 bytes, signed environment or stack slot
//! - `Label`: 4 bytes, absolute byte offset once the writer has finished

use crate::virtual_machine::errors::VMError;

/// Version of the encoding produced by this table.
pub const BYTECODE_VERSION: u32 = 1;

/// Invokes a callback macro with the complete instruction definition list.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Host interface
            // =========================
            /// END ; stop execution and return to the host
            End = 0x00, "END" => [],
            /// SYSCALL argc ; call the host with the top `argc` words as arguments
            Syscall = 0x01, "SYSCALL" => [argc: ImmU32],
            // =========================
            // Stack and environment
            // =========================
            /// CONST32 value ; push value
            Const32 = 0x02, "CONST32" => [value: ImmU32],
            /// CONST64 value ; push low word, then high word
            Const64 = 0x03, "CONST64" => [value: ImmU64],
            /// POP ; discard the top word
            Pop = 0x04, "POP" => [],
            /// GET idx ; push environment[idx]
            Get = 0x05, "GET" => [idx: Index],
            /// GET_LOCAL idx ; push stack[idx] (absolute slot)
            GetLocal = 0x06, "GET_LOCAL" => [idx: Index],
            /// SET idx ; environment[idx] = pop
            Set = 0x07, "SET" => [idx: Index],
            // =========================
            // Arithmetic
            // =========================
            /// ADD ; push(pop + pop), wrapping u32
            Add = 0x10, "ADD" => [],
            /// ADDF ; push(pop + pop), f32
            AddF = 0x11, "ADDF" => [],
            /// MUL ; push(pop * pop), wrapping u32
            Mul = 0x12, "MUL" => [],
            /// MULF ; push(pop * pop), f32
            MulF = 0x13, "MULF" => [],
            // =========================
            // Compare and branch
            // =========================
            /// EQ target ; pop b, pop a ; continue if a == b, else jump to target
            Eq = 0x20, "EQ" => [target: Label],
            /// NEQ target ; pop b, pop a ; continue if a != b, else jump to target
            Neq = 0x21, "NEQ" => [target: Label],
            /// LT target ; pop b, pop a ; continue if a < b (u32), else jump to target
            Lt = 0x22, "LT" => [target: Label],
            /// GT target ; pop b, pop a ; continue if a > b (u32), else jump to target
            Gt = 0x23, "GT" => [target: Label],
            /// LTF target ; pop b, pop a ; continue if a < b (f32), else jump to target
            LtF = 0x24, "LTF" => [target: Label],
            /// GTF target ; pop b, pop a ; continue if a > b (f32), else jump to target
            GtF = 0x25, "GTF" => [target: Label],
            // =========================
            // Control flow
            // =========================
            /// JMP target ; ip = target
            Jmp = 0x30, "JMP" => [target: Label],
            /// CALL target ; push return offset, ip = target
            Call = 0x31, "CALL" => [target: Label],
            /// RET ; ip = pop
            Ret = 0x32, "RET" => [],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// Every instruction, in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Looks an instruction up by its assembly mnemonic.
            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                match name {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }

            /// Kind of the single operand, if the instruction takes one.
            pub const fn operand_kind(&self) -> Option<OperandKind> {
                match self {
                    $( Instruction::$name => define_instructions!(@kind $( $kind )*), )*
                }
            }
        }
    };

    (@kind) => { None };
    (@kind $kind:ident) => { Some(OperandKind::$kind) };
}

for_each_instruction!(define_instructions);

/// Operand encodings used by the instruction table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// Raw 32-bit word.
    ImmU32,
    /// 64-bit value, pushed as two words.
    ImmU64,
    /// Signed environment or stack slot.
    Index,
    /// Code offset, written as a label id and patched by the writer.
    Label,
}

impl OperandKind {
    pub const fn size(self) -> usize {
        match self {
            OperandKind::ImmU32 | OperandKind::Index | OperandKind::Label => 4,
            OperandKind::ImmU64 => 8,
        }
    }

    pub const fn describe(self) -> &'static str {
        match self {
            OperandKind::ImmU32 => "a 32-bit value",
            OperandKind::ImmU64 => "a 64-bit value",
            OperandKind::Index => "a slot index",
            OperandKind::Label => "a label",
        }
    }
}

impl Instruction {
    /// Encoded size in bytes: opcode plus operand.
    pub const fn size(&self) -> usize {
        match self.operand_kind() {
            Some(kind) => 1 + kind.size(),
            None => 1,
        }
    }

    /// Whether the instruction carries a label that the writer patches.
    pub const fn has_label_operand(&self) -> bool {
        matches!(self.operand_kind(), Some(OperandKind::Label))
    }
}

/// Offset of the operand inside an encoded instruction.
pub const OPERAND_OFFSET: usize = 1;
