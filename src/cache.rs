use std::num::NonZeroUsize;

use lru::LruCache;
use smallvec::SmallVec;

use crate::addresses::KMAddr;
use crate::params::LamletParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Invalid,
    Reading,
    Shared,
    Modified,
    WritingReading,
    Evicting,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotState {
    pub state: CacheState,
    /// Line-aligned kamlet-memory address held (or being fetched).
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRequestKind {
    /// Fetch a line into an empty or clean slot.
    Read,
    /// Write the victim back and refill the same slot.
    WriteRead,
    /// Pure eviction.
    Write,
}

/// One coalesced line fetch/eviction owned by the kamlet coordinator.
/// Every jamlet sends exactly one packet for it; `sent`/`acked` keep the
/// jamlets in lockstep.
#[derive(Debug)]
pub struct CacheRequest {
    pub kind: CacheRequestKind,
    pub slot: usize,
    pub read_addr: u64,
    pub write_addr: u64,
    pub sent: Vec<bool>,
    pub acks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotHolder {
    writeset_ident: u32,
}

const N_CACHE_REQUEST_IDENTS: usize = 4;

/// Per-kamlet cache bookkeeping: slot states, the line-to-slot map with LRU
/// victim order, outstanding line requests, and which waiting items hold
/// which slots.
pub struct CacheTable {
    params: LamletParams,
    pub slots: Vec<SlotState>,
    line_to_slot: LruCache<u64, usize>,
    requests: Vec<Option<CacheRequest>>,
    holders: Vec<SmallVec<[SlotHolder; 2]>>,
}

impl CacheTable {
    pub fn new(params: &LamletParams) -> Self {
        let n_slots = params.n_cache_slots();
        CacheTable {
            params: params.clone(),
            slots: vec![SlotState { state: CacheState::Invalid, tag: 0 }; n_slots],
            line_to_slot: LruCache::new(NonZeroUsize::new(n_slots).unwrap()),
            requests: (0..N_CACHE_REQUEST_IDENTS).map(|_| None).collect(),
            holders: vec![SmallVec::new(); n_slots],
        }
    }

    pub fn line_addr(&self, km_addr: &KMAddr) -> u64 {
        km_addr.line_addr(&self.params)
    }

    /// SRAM byte address of a kamlet-space address within a slot, for the
    /// jamlet the address names.
    pub fn sram_addr(&self, slot: usize, km_addr: &KMAddr) -> usize {
        let in_line = (km_addr.addr % self.params.cache_line_bytes as u64) as usize;
        let vline_in_line = in_line / self.params.kamlet_vline_bytes();
        slot * self.params.line_bytes_per_jamlet()
            + vline_in_line * self.params.word_bytes
            + km_addr.byte_in_word(&self.params)
    }

    pub fn slot_for_line(&mut self, line_addr: u64) -> Option<usize> {
        self.line_to_slot.get(&line_addr).copied()
    }

    fn request_in_flight_for_slot(&self, slot: usize) -> bool {
        self.requests.iter().flatten().any(|r| r.slot == slot)
    }

    fn free_request_ident(&self) -> Option<usize> {
        self.requests.iter().position(|r| r.is_none())
    }

    /// Map a line to a slot, starting a fetch (and eviction if the victim is
    /// dirty) when it is not resident. Returns the slot as soon as one is
    /// assigned; callers wait on `slot_avail` for the data.
    pub fn map_line(&mut self, line_addr: u64) -> Option<usize> {
        if let Some(slot) = self.slot_for_line(line_addr) {
            return Some(slot);
        }
        let ident = self.free_request_ident()?;
        let slot = self.choose_victim()?;
        let victim = self.slots[slot];
        let kind = match victim.state {
            CacheState::Invalid => CacheRequestKind::Read,
            CacheState::Shared => {
                self.line_to_slot.pop(&victim.tag);
                CacheRequestKind::Read
            }
            CacheState::Modified => {
                self.line_to_slot.pop(&victim.tag);
                CacheRequestKind::WriteRead
            }
            other => panic!("victim slot {slot} in state {other:?}"),
        };
        let state = match kind {
            CacheRequestKind::Read => CacheState::Reading,
            CacheRequestKind::WriteRead => CacheState::WritingReading,
            CacheRequestKind::Write => unreachable!(),
        };
        self.slots[slot] = SlotState { state, tag: line_addr };
        self.line_to_slot.put(line_addr, slot);
        self.requests[ident] = Some(CacheRequest {
            kind,
            slot,
            read_addr: line_addr,
            write_addr: victim.tag,
            sent: vec![false; self.params.j_in_k()],
            acks: 0,
        });
        Some(slot)
    }

    /// Begin a pure eviction of a dirty resident line.
    pub fn evict_line(&mut self, line_addr: u64) -> Option<usize> {
        let slot = self.slot_for_line(line_addr)?;
        assert_eq!(self.slots[slot].state, CacheState::Modified);
        let ident = self.free_request_ident()?;
        self.slots[slot].state = CacheState::Evicting;
        self.line_to_slot.pop(&line_addr);
        self.requests[ident] = Some(CacheRequest {
            kind: CacheRequestKind::Write,
            slot,
            read_addr: 0,
            write_addr: line_addr,
            sent: vec![false; self.params.j_in_k()],
            acks: 0,
        });
        Some(slot)
    }

    /// Claim a slot for a line without fetching from memory (the caller will
    /// fill it, e.g. with zeros). Fails while a dirty victim or an
    /// in-flight fetch of the same line is in the way.
    pub fn map_line_without_fetch(&mut self, line_addr: u64) -> Option<usize> {
        if let Some(slot) = self.slot_for_line(line_addr) {
            if !matches!(self.slots[slot].state, CacheState::Shared | CacheState::Modified) {
                return None;
            }
            self.slots[slot].state = CacheState::Modified;
            return Some(slot);
        }
        let slot = self.choose_victim()?;
        let victim = self.slots[slot];
        match victim.state {
            CacheState::Invalid => {}
            CacheState::Shared => {
                self.line_to_slot.pop(&victim.tag);
            }
            CacheState::Modified => {
                // Dirty victim: put it on its way out and let the caller
                // retry once the slot is clean.
                self.evict_line(victim.tag);
                return None;
            }
            _ => return None,
        }
        self.slots[slot] = SlotState { state: CacheState::Modified, tag: line_addr };
        self.line_to_slot.put(line_addr, slot);
        Some(slot)
    }

    /// Drop a resident line without writing it back.
    pub fn discard_line(&mut self, line_addr: u64) -> bool {
        if let Some(slot) = self.slot_for_line(line_addr) {
            if self.request_in_flight_for_slot(slot) || !self.holders[slot].is_empty() {
                return false;
            }
            self.slots[slot] = SlotState { state: CacheState::Invalid, tag: 0 };
            self.line_to_slot.pop(&line_addr);
        }
        true
    }

    fn choose_victim(&mut self) -> Option<usize> {
        if let Some(slot) = self.slots.iter().position(|s| s.state == CacheState::Invalid) {
            if !self.request_in_flight_for_slot(slot) {
                return Some(slot);
            }
        }
        // Oldest resident line whose slot is quiescent and unheld.
        let candidates: Vec<u64> = self
            .line_to_slot
            .iter()
            .map(|(line, _)| *line)
            .collect();
        for line in candidates.into_iter().rev() {
            let slot = *self.line_to_slot.peek(&line).unwrap();
            let ok_state =
                matches!(self.slots[slot].state, CacheState::Shared | CacheState::Modified);
            if ok_state && self.holders[slot].is_empty() && !self.request_in_flight_for_slot(slot) {
                return Some(slot);
            }
        }
        None
    }

    pub fn acquire_slot(&mut self, slot: usize, writeset_ident: u32) {
        self.holders[slot].push(SlotHolder { writeset_ident });
    }

    pub fn release_slot(&mut self, slot: usize, writeset_ident: u32) {
        let holders = &mut self.holders[slot];
        let pos = holders
            .iter()
            .position(|h| h.writeset_ident == writeset_ident)
            .expect("release of a slot not held");
        holders.remove(pos);
    }

    fn clashes(&self, slot: usize, writeset_ident: u32) -> bool {
        self.holders[slot].iter().any(|h| h.writeset_ident != writeset_ident)
    }

    /// The slot is held by a waiting item of a different writeset. Holders
    /// of two writesets never coexist on one slot; callers wait (or drop)
    /// instead of stacking a second writeset's holder.
    pub fn held_by_other(&self, slot: usize, writeset_ident: u32) -> bool {
        self.clashes(slot, writeset_ident)
    }

    /// The line is mapped to a slot held by a different writeset.
    pub fn line_held_by_other(&mut self, line_addr: u64, writeset_ident: u32) -> bool {
        match self.slot_for_line(line_addr) {
            Some(slot) => self.clashes(slot, writeset_ident),
            None => false,
        }
    }

    /// The line is resident and this writeset may touch it now.
    pub fn slot_avail(&self, slot: usize, line_addr: u64, writeset_ident: u32) -> bool {
        let s = &self.slots[slot];
        s.tag == line_addr
            && matches!(s.state, CacheState::Shared | CacheState::Modified)
            && !self.clashes(slot, writeset_ident)
    }

    /// A foreign access (no slot held) may read/write the addressed word.
    pub fn can_access(&mut self, km_addr: &KMAddr, writeset_ident: u32) -> Option<usize> {
        let line = self.line_addr(km_addr);
        let slot = self.slot_for_line(line)?;
        if self.slot_avail(slot, line, writeset_ident) {
            Some(slot)
        } else {
            None
        }
    }

    pub fn mark_modified(&mut self, slot: usize) {
        assert!(matches!(
            self.slots[slot].state,
            CacheState::Shared | CacheState::Modified
        ));
        self.slots[slot].state = CacheState::Modified;
    }

    /// Requests with unsent jamlet packets, in ident order.
    pub fn pending_sends(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (ident, request) in self.requests.iter().enumerate() {
            if let Some(request) = request {
                for (j, sent) in request.sent.iter().enumerate() {
                    if !sent {
                        out.push((ident, j));
                    }
                }
            }
        }
        out
    }

    pub fn request(&self, ident: usize) -> &CacheRequest {
        self.requests[ident].as_ref().expect("unknown cache request")
    }

    pub fn mark_sent(&mut self, ident: usize, j_in_k_index: usize) {
        self.requests[ident].as_mut().unwrap().sent[j_in_k_index] = true;
    }

    /// A memlet drop: the jamlet must re-send its packet.
    pub fn clear_sent(&mut self, ident: usize, j_in_k_index: usize) {
        self.requests[ident].as_mut().unwrap().sent[j_in_k_index] = false;
    }

    /// Count one response toward a request; retires the request and settles
    /// the slot state once fully acknowledged. Line-fill data goes straight
    /// into the jamlet's SRAM by the caller; eviction acks arrive once per
    /// kamlet, fills once per jamlet.
    pub fn receive_response(&mut self, ident: usize) {
        let request = self.requests[ident].as_mut().expect("response for idle request ident");
        request.acks += 1;
        let expected = match request.kind {
            CacheRequestKind::Read | CacheRequestKind::WriteRead => self.params.j_in_k(),
            CacheRequestKind::Write => 1,
        };
        assert!(request.acks <= expected);
        if request.acks == expected {
            let slot = request.slot;
            match request.kind {
                CacheRequestKind::Read | CacheRequestKind::WriteRead => {
                    assert!(matches!(
                        self.slots[slot].state,
                        CacheState::Reading | CacheState::WritingReading
                    ));
                    self.slots[slot].state = CacheState::Shared;
                }
                CacheRequestKind::Write => {
                    assert_eq!(self.slots[slot].state, CacheState::Evicting);
                    self.slots[slot] = SlotState { state: CacheState::Invalid, tag: 0 };
                }
            }
            self.requests[ident] = None;
        }
    }

    /// Coherence check used by tests: outstanding request packets per slot
    /// state.
    pub fn n_requests_for_slot(&self, slot: usize) -> usize {
        self.requests.iter().flatten().filter(|r| r.slot == slot).count()
    }

    /// Slot states and outstanding requests must agree at every cycle.
    pub fn assert_consistent(&self) {
        for (slot, state) in self.slots.iter().enumerate() {
            let n = self.n_requests_for_slot(slot);
            match state.state {
                CacheState::Reading | CacheState::WritingReading | CacheState::Evicting => {
                    assert_eq!(n, 1, "slot {slot} in {:?} with {n} requests", state.state)
                }
                CacheState::Shared | CacheState::Modified | CacheState::Invalid => {
                    assert_eq!(n, 0, "slot {slot} in {:?} with {n} requests", state.state)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::{Ordering, WordOrder};

    fn km(params: &LamletParams, addr: u64) -> KMAddr {
        KMAddr {
            addr,
            k_index: 0,
            j_in_k_index: (addr as usize % params.kamlet_vline_bytes()) / params.word_bytes,
            ordering: Ordering::new(WordOrder::Standard, 32),
        }
    }

    #[test]
    fn test_map_line_starts_fetch() {
        let params = LamletParams::small();
        let mut table = CacheTable::new(&params);
        let slot = table.map_line(0).unwrap();
        assert_eq!(table.slots[slot].state, CacheState::Reading);
        assert_eq!(table.n_requests_for_slot(slot), 1);
        // Coalesced: a second map of the same line reuses the request.
        assert_eq!(table.map_line(0), Some(slot));
        assert_eq!(table.n_requests_for_slot(slot), 1);
        table.receive_response(0);
        assert_eq!(table.slots[slot].state, CacheState::Shared);
        assert_eq!(table.n_requests_for_slot(slot), 0);
    }

    #[test]
    fn test_dirty_victim_writes_back() {
        let params = LamletParams::small();
        let mut table = CacheTable::new(&params);
        let line_bytes = params.cache_line_bytes as u64;
        // Fill every slot with a dirty line.
        for i in 0..params.n_cache_slots() as u64 {
            let slot = table.map_line(i * line_bytes).unwrap();
            table.receive_response(0);
            table.mark_modified(slot);
        }
        let slot = table.map_line(100 * line_bytes).unwrap();
        assert_eq!(table.slots[slot].state, CacheState::WritingReading);
        let (ident, _) = table.pending_sends()[0];
        assert_eq!(table.request(ident).kind, CacheRequestKind::WriteRead);
    }

    #[test]
    fn test_holders_block_access_and_eviction() {
        let params = LamletParams::small();
        let mut table = CacheTable::new(&params);
        let slot = table.map_line(0).unwrap();
        table.receive_response(0);
        table.acquire_slot(slot, 7);
        assert!(table.slot_avail(slot, 0, 7));
        // A different writeset clashes.
        assert!(!table.slot_avail(slot, 0, 8));
        assert!(table.can_access(&km(&params, 0), 8).is_none());
        assert!(table.held_by_other(slot, 8));
        assert!(table.line_held_by_other(0, 8));
        // The same writeset may stack holders.
        assert!(!table.held_by_other(slot, 7));
        table.release_slot(slot, 7);
        assert!(!table.line_held_by_other(0, 8));
        assert!(table.can_access(&km(&params, 0), 8).is_some());
    }

    #[test]
    fn test_sram_addr_layout() {
        let params = LamletParams::small();
        let table = CacheTable::new(&params);
        // Third vline of the line in slot 2, byte 5 of the word.
        let addr = 2 * params.cache_line_bytes as u64 + 16 + 5;
        let a = table.sram_addr(2, &km(&params, addr));
        assert_eq!(a, 2 * params.line_bytes_per_jamlet() + 2 * params.word_bytes + 5);
    }
}
