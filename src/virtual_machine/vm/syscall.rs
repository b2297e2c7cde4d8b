use super::Vm;
use crate::virtual_machine::errors::VMError;

/// Host callback invoked by `SYSCALL`.
///
/// On entry the arguments are the top `arg_count` stack words, readable with
/// `vm.get(-(arg_count as i32))..=vm.get(-1)`. Words the handler pushes are
/// its results: once it returns, the VM moves them down over the arguments.
/// Errors abort the running `call` and are returned to the host unchanged.
pub trait SyscallHandler {
    fn syscall(&mut self, vm: &mut Vm<'_>, arg_count: u32) -> Result<(), VMError>;
}

/// Handler for bytecode that is not expected to issue syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSyscalls;

impl SyscallHandler for NoSyscalls {
    fn syscall(&mut self, _vm: &mut Vm<'_>, arg_count: u32) -> Result<(), VMError> {
        Err(VMError::NoSyscallHandler { arg_count })
    }
}

/// Closure adapter created by [`syscall_fn`].
pub struct FnSyscall<F>(F);

/// Wraps a closure as a [`SyscallHandler`].
pub fn syscall_fn<F>(handler: F) -> FnSyscall<F>
where
    F: FnMut(&mut Vm<'_>, u32) -> Result<(), VMError>,
{
    FnSyscall(handler)
}

impl<F> SyscallHandler for FnSyscall<F>
where
    F: FnMut(&mut Vm<'_>, u32) -> Result<(), VMError>,
{
    fn syscall(&mut self, vm: &mut Vm<'_>, arg_count: u32) -> Result<(), VMError> {
        (self.0)(vm, arg_count)
    }
}
