use crate::kamlet::{KamletBody, StepCtx};
use crate::message::Packet;
use crate::txn;

/// Per-tag sender-side protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Initial,
    NeedToSend,
    WaitingForResponse,
    /// Scatter/gather tags targeting non-idempotent memory hold here until
    /// fault sync resolves.
    WaitingInCaseFault,
    Complete,
}

/// Per-tag receiver-side protocol state for the J2J request/retry pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    WaitingForRequest,
    NeedToAskForResend,
    Complete,
}

/// Barrier participation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitemSyncState {
    NotStarted,
    InProgress,
    Complete,
}

/// Fields shared by every waiting item.
#[derive(Debug, Clone)]
pub struct WitemCore {
    pub instr_ident: u32,
    pub writeset_ident: u32,
    pub rf_ident: Option<u32>,
    /// Cache line this item needs resident, if any.
    pub line_addr: Option<u64>,
    pub cache_slot: Option<usize>,
    pub cache_is_avail: bool,
    /// Receiver-side items are matched by (ident, source) rather than by
    /// ident alone.
    pub source: Option<(i32, i32)>,
}

impl WitemCore {
    pub fn new(instr_ident: u32, writeset_ident: u32, rf_ident: Option<u32>) -> Self {
        WitemCore {
            instr_ident,
            writeset_ident,
            rf_ident,
            line_addr: None,
            cache_slot: None,
            cache_is_avail: false,
            source: None,
        }
    }
}

/// An outstanding multi-message operation. One variant per operation kind;
/// the per-kind logic lives beside its message handlers in `txn`.
pub enum Witem {
    LoadJ2J(txn::load_j2j::WaitingLoadJ2J),
    StoreJ2J(txn::store_j2j::WaitingStoreJ2J),
    LoadGather(txn::gather::WaitingLoadGather),
    StoreScatter(txn::scatter::WaitingStoreScatter),
    LoadIndexedElement(txn::indexed_element::WaitingIndexedElement),
    StoreIndexedElement(txn::indexed_element::WaitingIndexedElement),
    RegGather(txn::reg_gather::WaitingRegGather),
    /// Receiver side of WRITE_MEM_WORD when the line is not ready.
    WriteMemWord(txn::mem_word::WaitingWriteMemWord),
    /// Receiver side of READ_MEM_WORD when the line is not ready.
    ReadMemWord(txn::mem_word::WaitingReadMemWord),
    /// Cache-through probes for the scalar front-end.
    WriteImmBytes(txn::probes::WaitingWriteImmBytes),
    ReadBytes(txn::probes::WaitingReadBytes),
    ZeroLines(txn::probes::WaitingZeroLines),
    DiscardLines(txn::probes::WaitingDiscardLines),
}

impl Witem {
    pub fn core(&self) -> &WitemCore {
        match self {
            Witem::LoadJ2J(w) => &w.core,
            Witem::StoreJ2J(w) => &w.core,
            Witem::LoadGather(w) => &w.core,
            Witem::StoreScatter(w) => &w.core,
            Witem::LoadIndexedElement(w) => &w.core,
            Witem::StoreIndexedElement(w) => &w.core,
            Witem::RegGather(w) => &w.core,
            Witem::WriteMemWord(w) => &w.core,
            Witem::ReadMemWord(w) => &w.core,
            Witem::WriteImmBytes(w) => &w.core,
            Witem::ReadBytes(w) => &w.core,
            Witem::ZeroLines(w) => &w.core,
            Witem::DiscardLines(w) => &w.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut WitemCore {
        match self {
            Witem::LoadJ2J(w) => &mut w.core,
            Witem::StoreJ2J(w) => &mut w.core,
            Witem::LoadGather(w) => &mut w.core,
            Witem::StoreScatter(w) => &mut w.core,
            Witem::LoadIndexedElement(w) => &mut w.core,
            Witem::StoreIndexedElement(w) => &mut w.core,
            Witem::RegGather(w) => &mut w.core,
            Witem::WriteMemWord(w) => &mut w.core,
            Witem::ReadMemWord(w) => &mut w.core,
            Witem::WriteImmBytes(w) => &mut w.core,
            Witem::ReadBytes(w) => &mut w.core,
            Witem::ZeroLines(w) => &mut w.core,
            Witem::DiscardLines(w) => &mut w.core,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Witem::LoadJ2J(_) => "WaitingLoadJ2J",
            Witem::StoreJ2J(_) => "WaitingStoreJ2J",
            Witem::LoadGather(_) => "WaitingLoadGather",
            Witem::StoreScatter(_) => "WaitingStoreScatter",
            Witem::LoadIndexedElement(_) => "WaitingLoadIndexedElement",
            Witem::StoreIndexedElement(_) => "WaitingStoreIndexedElement",
            Witem::RegGather(_) => "WaitingRegGather",
            Witem::WriteMemWord(_) => "WaitingWriteMemWord",
            Witem::ReadMemWord(_) => "WaitingReadMemWord",
            Witem::WriteImmBytes(_) => "WaitingWriteImmBytes",
            Witem::ReadBytes(_) => "WaitingReadBytes",
            Witem::ZeroLines(_) => "WaitingZeroLines",
            Witem::DiscardLines(_) => "WaitingDiscardLines",
        }
    }

    pub fn monitor_jamlet(&mut self, body: &mut KamletBody, j: usize, ctx: &mut StepCtx) {
        match self {
            Witem::LoadJ2J(w) => txn::load_j2j::monitor_jamlet(w, body, j, ctx),
            Witem::StoreJ2J(w) => txn::store_j2j::monitor_jamlet(w, body, j, ctx),
            Witem::LoadGather(w) => txn::gather::monitor_jamlet(w, body, j, ctx),
            Witem::StoreScatter(w) => txn::scatter::monitor_jamlet(w, body, j, ctx),
            Witem::LoadIndexedElement(w) | Witem::StoreIndexedElement(w) => {
                txn::indexed_element::monitor_jamlet(w, body, j, ctx)
            }
            Witem::RegGather(w) => txn::reg_gather::monitor_jamlet(w, body, j, ctx),
            _ => {}
        }
    }

    pub fn monitor_kamlet(&mut self, body: &mut KamletBody, ctx: &mut StepCtx) {
        match self {
            Witem::LoadGather(w) => txn::gather::monitor_kamlet(w, body, ctx),
            Witem::StoreScatter(w) => txn::scatter::monitor_kamlet(w, body, ctx),
            Witem::LoadIndexedElement(w) | Witem::StoreIndexedElement(w) => {
                txn::indexed_element::monitor_kamlet(w, body, ctx)
            }
            Witem::RegGather(w) => txn::reg_gather::monitor_kamlet(w, body, ctx),
            Witem::WriteMemWord(w) => txn::mem_word::monitor_kamlet_write(w, body, ctx),
            Witem::ReadMemWord(w) => txn::mem_word::monitor_kamlet_read(w, body, ctx),
            Witem::WriteImmBytes(w) => txn::probes::monitor_kamlet_write_imm(w, body, ctx),
            Witem::ReadBytes(w) => txn::probes::monitor_kamlet_read_bytes(w, body, ctx),
            Witem::ZeroLines(w) => txn::probes::monitor_kamlet_zero_lines(w, body, ctx),
            Witem::DiscardLines(w) => txn::probes::monitor_kamlet_discard_lines(w, body, ctx),
            _ => {}
        }
    }

    pub fn process_response(
        &mut self,
        body: &mut KamletBody,
        j: usize,
        packet: &Packet,
        ctx: &mut StepCtx,
    ) {
        match self {
            Witem::LoadJ2J(w) => txn::load_j2j::process_response(w, body, j, packet, ctx),
            Witem::StoreJ2J(w) => txn::store_j2j::process_response(w, body, j, packet, ctx),
            Witem::LoadGather(w) => txn::gather::process_response(w, body, j, packet, ctx),
            Witem::StoreScatter(w) => txn::scatter::process_response(w, body, j, packet, ctx),
            Witem::LoadIndexedElement(w) | Witem::StoreIndexedElement(w) => {
                txn::indexed_element::process_response(w, body, j, packet, ctx)
            }
            Witem::RegGather(w) => txn::reg_gather::process_response(w, body, j, packet, ctx),
            other => panic!("{} received an unexpected response", other.kind_name()),
        }
    }

    pub fn process_drop(
        &mut self,
        body: &mut KamletBody,
        j: usize,
        packet: &Packet,
        ctx: &mut StepCtx,
    ) {
        match self {
            Witem::LoadJ2J(w) => txn::load_j2j::process_drop(w, body, j, packet, ctx),
            Witem::StoreJ2J(w) => txn::store_j2j::process_drop(w, body, j, packet, ctx),
            Witem::LoadGather(w) => txn::gather::process_drop(w, body, j, packet, ctx),
            Witem::StoreScatter(w) => txn::scatter::process_drop(w, body, j, packet, ctx),
            Witem::LoadIndexedElement(w) | Witem::StoreIndexedElement(w) => {
                txn::indexed_element::process_drop(w, body, j, packet, ctx)
            }
            Witem::RegGather(w) => txn::reg_gather::process_drop(w, body, j, packet, ctx),
            other => panic!("{} received an unexpected drop", other.kind_name()),
        }
    }

    pub fn ready(&self) -> bool {
        match self {
            Witem::LoadJ2J(w) => txn::load_j2j::ready(w),
            Witem::StoreJ2J(w) => txn::store_j2j::ready(w),
            Witem::LoadGather(w) => txn::gather::ready(w),
            Witem::StoreScatter(w) => txn::scatter::ready(w),
            Witem::LoadIndexedElement(w) | Witem::StoreIndexedElement(w) => {
                txn::indexed_element::ready(w)
            }
            Witem::RegGather(w) => txn::reg_gather::ready(w),
            Witem::WriteMemWord(w) => txn::mem_word::ready_write(w),
            Witem::ReadMemWord(w) => txn::mem_word::ready_read(w),
            Witem::WriteImmBytes(w) => w.done,
            Witem::ReadBytes(w) => w.done,
            Witem::ZeroLines(w) => w.done,
            Witem::DiscardLines(w) => w.done,
        }
    }

    pub fn finalize(&mut self, body: &mut KamletBody, ctx: &mut StepCtx) {
        match self {
            Witem::LoadJ2J(w) => txn::load_j2j::finalize(w, body, ctx),
            Witem::StoreJ2J(w) => txn::store_j2j::finalize(w, body, ctx),
            Witem::LoadGather(w) => txn::gather::finalize(w, body, ctx),
            Witem::StoreScatter(w) => txn::scatter::finalize(w, body, ctx),
            Witem::LoadIndexedElement(w) | Witem::StoreIndexedElement(w) => {
                txn::indexed_element::finalize(w, body, ctx)
            }
            Witem::RegGather(w) => txn::reg_gather::finalize(w, body, ctx),
            _ => {}
        }
        // Release any held cache slot.
        let core = self.core_mut();
        if let Some(slot) = core.cache_slot.take() {
            body.cache.release_slot(slot, core.writeset_ident);
        }
    }
}

/// Fixed-capacity table of live waiting items.
pub struct WitemTable {
    slots: Vec<Option<Witem>>,
}

impl WitemTable {
    pub fn new(capacity: usize) -> Self {
        WitemTable { slots: (0..capacity).map(|_| None).collect() }
    }

    pub fn can_add(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    pub fn add(&mut self, witem: Witem) -> usize {
        let index = self.slots.iter().position(|s| s.is_none()).expect("witem table full");
        self.slots[index] = Some(witem);
        index
    }

    /// Find a non-receiver item by instruction ident.
    pub fn find(&mut self, instr_ident: u32) -> Option<&mut Witem> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|w| w.core().instr_ident == instr_ident && w.core().source.is_none())
    }

    /// Find a non-receiver item whose ident matches modulo the response
    /// ring (message idents are narrow; instruction idents are not).
    pub fn find_mod(&mut self, ident_mod: u32, modulus: u32) -> Option<&mut Witem> {
        let mut matches = self
            .slots
            .iter_mut()
            .flatten()
            .filter(|w| w.core().instr_ident % modulus == ident_mod && w.core().source.is_none());
        let found = matches.next();
        assert!(matches.next().is_none(), "ambiguous parent ident {ident_mod}");
        found
    }

    /// Find a receiver-side item by ident and packet source.
    pub fn find_with_source(&mut self, instr_ident: u32, source: (i32, i32)) -> Option<&mut Witem> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|w| w.core().instr_ident == instr_ident && w.core().source == Some(source))
    }

    pub fn indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    pub fn take(&mut self, index: usize) -> Witem {
        self.slots[index].take().expect("take of empty witem slot")
    }

    pub fn put_back(&mut self, index: usize, witem: Witem) {
        assert!(self.slots[index].is_none());
        self.slots[index] = Some(witem);
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Witem> {
        self.slots[index].as_mut()
    }

    pub fn n_live(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}
