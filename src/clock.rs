use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Result};

/// Discrete cycle counter with a hard budget.
///
/// Components are stepped in a fixed order each cycle; `advance` moves to
/// the next cycle and fails once the budget is exhausted, which is the only
/// fatal error an otherwise-healthy simulation can produce.
#[derive(Debug)]
pub struct Clock {
    pub cycle: u64,
    pub max_cycles: u64,
}

impl Clock {
    pub fn new(max_cycles: u64) -> Self {
        Clock { cycle: 0, max_cycles }
    }

    pub fn advance(&mut self) -> Result<()> {
        if self.cycle >= self.max_cycles {
            bail!("clock timeout at cycle {} (budget {})", self.cycle, self.max_cycles);
        }
        self.cycle += 1;
        Ok(())
    }
}

/// Single-assignment result cell.
///
/// The producer holds a clone and fulfils it once; the consumer polls
/// `take`/`is_set` while stepping the clock.
pub struct Promise<T> {
    cell: Rc<RefCell<Option<T>>>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise { cell: Rc::new(RefCell::new(None)) }
    }

    pub fn set(&self, value: T) {
        let mut cell = self.cell.borrow_mut();
        assert!(cell.is_none(), "promise fulfilled twice");
        *cell = Some(value);
    }

    pub fn is_set(&self) -> bool {
        self.cell.borrow().is_some()
    }

    pub fn take(&self) -> Option<T> {
        self.cell.borrow_mut().take()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise { cell: Rc::clone(&self.cell) }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_times_out() {
        let mut clock = Clock::new(3);
        for _ in 0..3 {
            clock.advance().unwrap();
        }
        assert!(clock.advance().is_err());
    }

    #[test]
    fn test_promise() {
        let p: Promise<u32> = Promise::new();
        let writer = p.clone();
        assert!(!p.is_set());
        writer.set(7);
        assert!(p.is_set());
        assert_eq!(p.take(), Some(7));
        assert!(!p.is_set());
    }
}
