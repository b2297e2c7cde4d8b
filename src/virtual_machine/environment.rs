//! Environment layout and syscall codes shared by scripts and their host.
//!
//! The first words of every script environment are reserved for the host;
//! script variables follow at [`VARIABLES`]. Scripts pass a [`ScriptSyscall`]
//! code as the last `SYSCALL` argument.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::script::CompiledScript;
use crate::virtual_machine::vm::Word;

/// Id of the entity running the script.
pub const SELF: usize = 0;
/// Host handle to the universe, two words (see `Vm::get_ptr`).
pub const UNIVERSE: usize = 1;
/// Seconds since the previous update, as `f32` bits.
pub const TIME_DELTA: usize = 3;
/// First script variable.
pub const VARIABLES: usize = 4;

pub const fn variable_index(variable: usize) -> usize {
    VARIABLES + variable
}

pub const fn environment_size(variable_count: usize) -> usize {
    VARIABLES + variable_count
}

/// Zeroed environment sized for `script`.
pub fn new_environment(script: &CompiledScript) -> Vec<Word> {
    vec![0; script.environment_size()]
}

/// Host operations scripts request through `SYSCALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ScriptSyscall {
    /// `(entity, property, value, code)`
    SetProperty = 0,
    /// `(entity, yaw, code)`
    SetYaw = 1,
}

impl ScriptSyscall {
    /// Arguments including the trailing code.
    pub const fn arg_count(self) -> u32 {
        match self {
            ScriptSyscall::SetProperty => 4,
            ScriptSyscall::SetYaw => 3,
        }
    }
}

impl TryFrom<u32> for ScriptSyscall {
    type Error = VMError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ScriptSyscall::SetProperty),
            1 => Ok(ScriptSyscall::SetYaw),
            _ => Err(VMError::UnknownSyscall { code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::vm::{Vm, syscall_fn};
    use crate::virtual_machine::writer::BytecodeWriter;

    #[test]
    fn layout() {
        assert_eq!(variable_index(0), VARIABLES);
        assert_eq!(environment_size(3), 7);
        assert!(UNIVERSE + 2 <= TIME_DELTA);
    }

    #[test]
    fn syscall_codes() {
        assert_eq!(ScriptSyscall::try_from(0), Ok(ScriptSyscall::SetProperty));
        assert_eq!(ScriptSyscall::try_from(1), Ok(ScriptSyscall::SetYaw));
        assert_eq!(
            ScriptSyscall::try_from(2),
            Err(VMError::UnknownSyscall { code: 2 })
        );
    }

    #[test]
    fn host_dispatches_on_trailing_code() {
        let mut w = BytecodeWriter::default();
        w.get(SELF as i32).unwrap();
        w.const_float(0.25).unwrap();
        w.const32(ScriptSyscall::SetYaw as u32).unwrap();
        w.syscall(ScriptSyscall::SetYaw.arg_count()).unwrap();
        w.end().unwrap();
        let code = w.end_write().unwrap();

        let mut env = vec![0; environment_size(0)];
        env[SELF] = 42;
        let mut yaws = Vec::new();
        let mut vm = Vm::new(&mut env);
        vm.set_ptr(UNIVERSE as i32, 0xFEED).unwrap();
        let mut host = syscall_fn(|vm: &mut Vm<'_>, argc: u32| {
            match ScriptSyscall::try_from(vm.get(-1)?)? {
                ScriptSyscall::SetYaw => {
                    assert_eq!(argc, 3);
                    assert_eq!(vm.get_ptr(UNIVERSE as i32)?, 0xFEED);
                    yaws.push((vm.get(-3)?, vm.get_float(-2)?));
                }
                ScriptSyscall::SetProperty => unreachable!(),
            }
            Ok(())
        });
        vm.call(&code, &mut host, 0).unwrap();
        assert_eq!(vm.sp(), 0);
        assert_eq!(yaws, vec![(42, 0.25)]);
    }
}
