use super::Word;
use crate::virtual_machine::errors::VMError;

/// Fixed-capacity word stack. `sp` counts words and never exceeds capacity.
#[derive(Debug)]
pub(super) struct Stack {
    slots: Box<[Word]>,
    sp: usize,
}

impl Stack {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity].into_boxed_slice(),
            sp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Words below `sp`.
    pub fn live(&self) -> &[Word] {
        &self.slots[..self.sp]
    }

    pub fn clear(&mut self) {
        self.sp = 0;
    }

    pub fn push(&mut self, word: Word) -> Result<(), VMError> {
        let capacity = self.capacity();
        let slot = self
            .slots
            .get_mut(self.sp)
            .ok_or(VMError::StackOverflow { capacity })?;
        *slot = word;
        self.sp += 1;
        debug_assert!(self.sp <= capacity);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Word, VMError> {
        self.require(1)?;
        self.sp -= 1;
        Ok(self.slots[self.sp])
    }

    /// Pops `b` then `a`, returning `(a, b)`: `a` was `stack[-2]`.
    pub fn pop2(&mut self) -> Result<(Word, Word), VMError> {
        self.require(2)?;
        self.sp -= 2;
        Ok((self.slots[self.sp], self.slots[self.sp + 1]))
    }

    pub fn require(&self, words: usize) -> Result<(), VMError> {
        if self.sp < words {
            return Err(VMError::StackUnderflow {
                required: words,
                sp: self.sp,
            });
        }
        Ok(())
    }

    /// Absolute position of `index`: non-negative values are absolute slots,
    /// negative values count down from `sp` (`-1` is the top).
    pub fn position(&self, index: i64) -> Result<usize, VMError> {
        let absolute = if index < 0 {
            self.sp as i64 + index
        } else {
            index
        };
        if absolute < 0 || absolute >= self.sp as i64 {
            return Err(VMError::StackIndexOutOfBounds { index, sp: self.sp });
        }
        Ok(absolute as usize)
    }

    pub fn read(&self, index: i64) -> Result<Word, VMError> {
        let at = self.position(index)?;
        Ok(self.slots[at])
    }

    pub fn write(&mut self, index: i64, word: Word) -> Result<(), VMError> {
        let at = self.position(index)?;
        self.slots[at] = word;
        Ok(())
    }

    /// Moves the words in `from..sp` down to start at `to` and drops
    /// everything in between.
    pub fn collapse(&mut self, to: usize, from: usize) {
        debug_assert!(to <= from && from <= self.sp);
        self.slots.copy_within(from..self.sp, to);
        self.sp = to + (self.sp - from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_order() {
        let mut stack = Stack::new(4);
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        assert_eq!(stack.pop2().unwrap(), (1, 2));
        assert_eq!(stack.sp(), 0);
    }

    #[test]
    fn overflow_and_underflow() {
        let mut stack = Stack::new(1);
        stack.push(7).unwrap();
        assert_eq!(stack.push(8), Err(VMError::StackOverflow { capacity: 1 }));
        assert_eq!(stack.sp(), 1);
        assert_eq!(
            stack.pop2(),
            Err(VMError::StackUnderflow { required: 2, sp: 1 })
        );
        assert_eq!(stack.pop().unwrap(), 7);
        assert!(stack.pop().is_err());
    }

    #[test]
    fn relative_and_absolute_positions() {
        let mut stack = Stack::new(8);
        for w in [10, 20, 30] {
            stack.push(w).unwrap();
        }
        assert_eq!(stack.read(-1).unwrap(), 30);
        assert_eq!(stack.read(-3).unwrap(), 10);
        assert_eq!(stack.read(1).unwrap(), 20);
        assert!(stack.read(-4).is_err());
        assert!(stack.read(3).is_err());
    }

    #[test]
    fn collapse_moves_results_down() {
        let mut stack = Stack::new(8);
        for w in [1, 2, 3, 4, 99] {
            stack.push(w).unwrap();
        }
        // args 2..4 (three words) replaced by the result above them
        stack.collapse(1, 4);
        assert_eq!(stack.live(), &[1, 99]);
    }
}
