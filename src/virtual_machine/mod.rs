//! Stack-based bytecode virtual machine for game scripts.
//!
//! Scripts are compiled to compact bytecode, either directly through the
//! [`writer::BytecodeWriter`] API or from text through the [`assembler`],
//! and run by [`vm::Vm`] against a host-owned environment of `u32` words.
//!
//! # Architecture
//!
//! - **Stack**: fixed-capacity word stack, `sp` counts words
//! - **Environment**: flat `u32` slice owned by the host, addressed by `GET`/`SET`
//! - **Instruction format**: 1-byte opcode, at most one little-endian operand
//! - **Host interface**: `SYSCALL argc` hands the top `argc` words to a
//!   [`vm::SyscallHandler`]; words it pushes replace the arguments
//! - **Labels**: jump targets are label ids while writing and absolute byte
//!   offsets once [`writer::BytecodeWriter::end_write`] has patched them
//!
//! # Modules
//!
//! - [`assembler`]: Assembly parsing, diagnostics, and script generation
//! - [`environment`]: Host environment layout and syscall codes
//! - [`errors`]: Writer, assembly and execution error types
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`script`]: Compiled script resource format
//! - [`vm`]: Interpreter, accessors and syscall handlers
//! - [`writer`]: Bytecode writer with label patching

pub mod assembler;
pub mod environment;
pub mod errors;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod script;
pub mod vm;
pub mod writer;
