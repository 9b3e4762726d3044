use crate::addresses::{GlobalAddress, KMAddr, Ordering, WordOrder};

/// Unit-stride vector load/store against a kamlet-space address.
#[derive(Debug, Clone)]
pub struct LoadInstr {
    pub dst: usize,
    pub k_maddr: KMAddr,
    pub start_index: usize,
    pub n_elements: usize,
    pub dst_ordering: Ordering,
    pub mask_reg: Option<usize>,
    pub instr_ident: u32,
    pub writeset_ident: u32,
}

#[derive(Debug, Clone)]
pub struct StoreInstr {
    pub src: usize,
    pub k_maddr: KMAddr,
    pub start_index: usize,
    pub n_elements: usize,
    pub src_ordering: Ordering,
    pub mask_reg: Option<usize>,
    pub instr_ident: u32,
    pub writeset_ident: u32,
}

/// Strided gather load / scatter store. `reg` is the destination register
/// for loads and the source register for stores.
#[derive(Debug, Clone)]
pub struct StrideInstr {
    pub reg: usize,
    pub g_addr: GlobalAddress,
    pub start_index: usize,
    pub n_elements: usize,
    pub ordering: Ordering,
    pub stride_bytes: i64,
    pub mask_reg: Option<usize>,
    pub instr_ident: u32,
    pub writeset_ident: u32,
}

/// Indexed (unordered) gather load / scatter store.
#[derive(Debug, Clone)]
pub struct IndexedInstr {
    pub reg: usize,
    pub g_addr: GlobalAddress,
    pub start_index: usize,
    pub n_elements: usize,
    pub ordering: Ordering,
    pub index_reg: usize,
    pub index_ew: usize,
    pub mask_reg: Option<usize>,
    pub instr_ident: u32,
    pub writeset_ident: u32,
}

/// One element of an ordered indexed access. The front-end dispatches one
/// of these per element; only the kamlet owning the element acts on it.
#[derive(Debug, Clone)]
pub struct IndexedElementInstr {
    pub reg: usize,
    pub index_reg: usize,
    pub index_ew: usize,
    pub data_ew: usize,
    pub element_index: usize,
    pub base_addr: GlobalAddress,
    pub word_order: WordOrder,
    pub instr_ident: u32,
    /// Barrier ident the remote side serializes ordered accesses on.
    pub parent_ident: u32,
    pub mask_reg: Option<usize>,
}

/// Register gather: `vd[i] = vs1[i] >= vlmax ? 0 : vs2[vs1[i]]`.
#[derive(Debug, Clone)]
pub struct RegGatherInstr {
    pub vd: usize,
    pub vs2: usize,
    pub vs1: usize,
    pub start_index: usize,
    pub n_elements: usize,
    pub index_ew: usize,
    pub data_ew: usize,
    pub word_order: WordOrder,
    pub vlmax: usize,
    pub mask_reg: Option<usize>,
    pub instr_ident: u32,
}

/// Write immediate bytes into VPU memory; no response. Bytes land at
/// consecutive kamlet-space addresses and must stay within one cache line.
#[derive(Debug, Clone)]
pub struct WriteImmBytesInstr {
    pub k_maddr: KMAddr,
    pub imm: Vec<u8>,
}

/// Read bytes from VPU memory; the front-end receives a response packet.
#[derive(Debug, Clone)]
pub struct ReadBytesInstr {
    pub k_maddr: KMAddr,
    pub size: usize,
    pub instr_ident: u32,
}

/// Zero or discard whole cache lines without touching DRAM.
#[derive(Debug, Clone)]
pub struct LinesInstr {
    pub k_maddr: KMAddr,
    pub n_cache_lines: usize,
}

/// A kernel instruction as carried by an `INSTRUCTIONS` packet.
#[derive(Debug, Clone)]
pub enum KInstr {
    Load(LoadInstr),
    Store(StoreInstr),
    LoadStride(StrideInstr),
    StoreStride(StrideInstr),
    LoadIndexed(IndexedInstr),
    StoreIndexed(IndexedInstr),
    LoadIndexedElement(IndexedElementInstr),
    StoreIndexedElement(IndexedElementInstr),
    RegGather(RegGatherInstr),
    WriteImmBytes(WriteImmBytesInstr),
    ReadBytes(ReadBytesInstr),
    ZeroLines(LinesInstr),
    DiscardLines(LinesInstr),
}

impl KInstr {
    pub fn name(&self) -> &'static str {
        match self {
            KInstr::Load(_) => "Load",
            KInstr::Store(_) => "Store",
            KInstr::LoadStride(_) => "LoadStride",
            KInstr::StoreStride(_) => "StoreStride",
            KInstr::LoadIndexed(_) => "LoadIndexed",
            KInstr::StoreIndexed(_) => "StoreIndexed",
            KInstr::LoadIndexedElement(_) => "LoadIndexedElement",
            KInstr::StoreIndexedElement(_) => "StoreIndexedElement",
            KInstr::RegGather(_) => "RegGather",
            KInstr::WriteImmBytes(_) => "WriteImmBytes",
            KInstr::ReadBytes(_) => "ReadBytes",
            KInstr::ZeroLines(_) => "ZeroLines",
            KInstr::DiscardLines(_) => "DiscardLines",
        }
    }
}
