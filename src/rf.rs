use std::collections::HashMap;

use fixedbitset::FixedBitSet;

#[derive(Debug)]
struct RfEntry {
    read: FixedBitSet,
    write: FixedBitSet,
}

/// Hazard tracker for a kamlet's register file.
///
/// Each unresolved issue holds the registers it reads and writes under an
/// `rf_ident`; dependants stall until the conflicting sets drain. The same
/// sets must be passed back at `finish`.
pub struct KamletRegisterFile {
    n_vregs: usize,
    live: HashMap<u32, RfEntry>,
    next_ident: u32,
}

impl KamletRegisterFile {
    pub fn new(n_vregs: usize) -> Self {
        KamletRegisterFile { n_vregs, live: HashMap::new(), next_ident: 0 }
    }

    fn to_set(&self, regs: &[usize]) -> FixedBitSet {
        let mut set = FixedBitSet::with_capacity(self.n_vregs);
        for &reg in regs {
            assert!(reg < self.n_vregs, "register v{reg} out of range");
            set.insert(reg);
        }
        set
    }

    /// True when issuing with these sets would not conflict with any live
    /// issue: readers wait for writers, writers wait for everyone.
    pub fn is_available(&self, read_regs: &[usize], write_regs: &[usize]) -> bool {
        let read = self.to_set(read_regs);
        let write = self.to_set(write_regs);
        for entry in self.live.values() {
            if entry.write.intersection(&read).next().is_some()
                || entry.write.intersection(&write).next().is_some()
                || entry.read.intersection(&write).next().is_some()
            {
                return false;
            }
        }
        true
    }

    pub fn start(&mut self, read_regs: &[usize], write_regs: &[usize]) -> u32 {
        assert!(self.is_available(read_regs, write_regs),
            "rf start while hazards live: read={read_regs:?} write={write_regs:?}");
        let ident = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        let entry = RfEntry { read: self.to_set(read_regs), write: self.to_set(write_regs) };
        self.live.insert(ident, entry);
        ident
    }

    pub fn finish(&mut self, rf_ident: u32, read_regs: &[usize], write_regs: &[usize]) {
        let entry = self.live.remove(&rf_ident).expect("finish of unknown rf ident");
        assert_eq!(entry.read, self.to_set(read_regs), "read set changed between start and finish");
        assert_eq!(entry.write, self.to_set(write_regs),
            "write set changed between start and finish");
    }

    pub fn n_live(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_waits_for_writer() {
        let mut rf = KamletRegisterFile::new(8);
        let ident = rf.start(&[1], &[2]);
        assert!(!rf.is_available(&[2], &[3]));
        assert!(!rf.is_available(&[3], &[2]));
        // Writing a register someone reads is also a conflict.
        assert!(!rf.is_available(&[], &[1]));
        rf.finish(ident, &[1], &[2]);
        assert!(rf.is_available(&[2], &[3]));
    }

    #[test]
    fn test_concurrent_readers_allowed() {
        let mut rf = KamletRegisterFile::new(8);
        let a = rf.start(&[1, 2], &[3]);
        assert!(rf.is_available(&[1, 2], &[4]));
        let b = rf.start(&[1, 2], &[4]);
        rf.finish(a, &[1, 2], &[3]);
        rf.finish(b, &[1, 2], &[4]);
        assert_eq!(rf.n_live(), 0);
    }

    #[test]
    #[should_panic]
    fn test_finish_with_changed_sets_panics() {
        let mut rf = KamletRegisterFile::new(8);
        let ident = rf.start(&[1], &[2]);
        rf.finish(ident, &[1], &[3]);
    }
}
