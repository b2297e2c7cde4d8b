//! KVM library.
//!
//! Provides a word-addressed stack virtual machine for game scripts, the
//! bytecode writer and assembler that produce its code, and the binary
//! encoding used for compiled script resources.

pub mod types;
pub mod utils;
pub mod virtual_machine;
