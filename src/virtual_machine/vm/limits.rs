use crate::virtual_machine::errors::VMError;

/// Default stack capacity in words.
pub const KVM_STACK_SIZE: usize = 1024;

/// Per-VM execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Stack capacity in words.
    pub stack_size: usize,
    /// Maximum instructions per `call`; `None` runs until `END`.
    pub step_limit: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: KVM_STACK_SIZE,
            step_limit: None,
        }
    }
}

impl VmConfig {
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = Some(limit);
        self
    }

    pub fn with_stack_size(mut self, words: usize) -> Self {
        self.stack_size = words;
        self
    }
}

/// Counts executed instructions against an optional limit.
#[derive(Debug, Clone, Copy)]
pub(super) struct StepBudget {
    used: u64,
    limit: Option<u64>,
}

impl StepBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self { used: 0, limit }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    #[inline(always)]
    pub fn charge(&mut self) -> Result<(), VMError> {
        if let Some(limit) = self.limit
            && self.used >= limit
        {
            return Err(VMError::StepLimitExceeded { limit });
        }
        self.used += 1;
        Ok(())
    }
}
