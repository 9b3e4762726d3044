use std::collections::HashMap;

use crate::params::LamletParams;

/// Permutation fixing which jamlet word-slot owns which vector element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordOrder {
    /// `vw = k_index * j_in_k + j_in_k_index`.
    Standard,
    /// Mirrored slot order.
    Reversed,
}

impl WordOrder {
    pub fn vw_to_k(&self, params: &LamletParams, vw: usize) -> (usize, usize) {
        let j_in_l = params.j_in_l();
        assert!(vw < j_in_l);
        let slot = match self {
            WordOrder::Standard => vw,
            WordOrder::Reversed => j_in_l - 1 - vw,
        };
        (slot / params.j_in_k(), slot % params.j_in_k())
    }

    pub fn k_to_vw(&self, params: &LamletParams, k_index: usize, j_in_k_index: usize) -> usize {
        let slot = k_index * params.j_in_k() + j_in_k_index;
        match self {
            WordOrder::Standard => slot,
            WordOrder::Reversed => params.j_in_l() - 1 - slot,
        }
    }
}

/// Word order plus element width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ordering {
    pub word_order: WordOrder,
    pub ew: usize,
}

impl Ordering {
    pub fn new(word_order: WordOrder, ew: usize) -> Self {
        assert!(ew % 8 == 0, "element widths are byte multiples");
        Ordering { word_order, ew }
    }

    pub fn eb(&self) -> usize {
        self.ew / 8
    }
}

/// A bit in the lamlet-global memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalAddress {
    pub bit_addr: u64,
}

impl GlobalAddress {
    pub fn from_byte(byte_addr: u64) -> Self {
        GlobalAddress { bit_addr: byte_addr * 8 }
    }

    pub fn byte_addr(&self) -> u64 {
        self.bit_addr / 8
    }

    pub fn bit_offset(&self, bits: i64) -> Self {
        GlobalAddress { bit_addr: self.bit_addr.checked_add_signed(bits).unwrap() }
    }

    pub fn page(&self, params: &LamletParams) -> u64 {
        self.byte_addr() / params.page_bytes as u64
    }

    pub fn byte_in_page(&self, params: &LamletParams) -> u64 {
        self.byte_addr() % params.page_bytes as u64
    }
}

/// A byte in a specific kamlet's interleaved address space.
///
/// `addr` is laid out `[vline][j_in_k][byte_in_word]`, so
/// `addr % word_bytes` is the byte within the owning jamlet's word and
/// `addr / kamlet_vline_bytes` is the vline index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMAddr {
    pub addr: u64,
    pub k_index: usize,
    pub j_in_k_index: usize,
    pub ordering: Ordering,
}

impl KMAddr {
    pub fn byte_in_word(&self, params: &LamletParams) -> usize {
        (self.addr % params.word_bytes as u64) as usize
    }

    pub fn vline(&self, params: &LamletParams) -> u64 {
        self.addr / params.kamlet_vline_bytes() as u64
    }

    pub fn line_addr(&self, params: &LamletParams) -> u64 {
        self.addr / params.cache_line_bytes as u64 * params.cache_line_bytes as u64
    }

    /// The same location with the byte-in-word cleared.
    pub fn word_aligned(&self, params: &LamletParams) -> KMAddr {
        KMAddr {
            addr: self.addr - self.byte_in_word(params) as u64,
            ..*self
        }
    }
}

/// A byte inside one jamlet's SRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JSAddr {
    pub addr: u64,
    pub k_index: usize,
    pub j_in_k_index: usize,
}

/// A byte in the scalar memory space.
pub type ScalarAddr = u64;

/// Decomposition of a byte position within the VPU vline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlinePos {
    pub vline: u64,
    /// Element index within the vline.
    pub ve: usize,
    /// Word slot within the vline.
    pub vw: usize,
    /// Element index within the word.
    pub we: usize,
    pub byte_in_element: usize,
    pub byte_in_word: usize,
    pub k_index: usize,
    pub j_in_k_index: usize,
}

/// Decompose a linear byte position (vline-major) under an ordering.
pub fn linear_to_pos(params: &LamletParams, ordering: Ordering, lin: u64) -> VlinePos {
    let vline = lin / params.vline_bytes as u64;
    let r = (lin % params.vline_bytes as u64) as usize;
    let eb = ordering.eb();
    let ve = r / eb;
    let byte_in_element = r % eb;
    let vw = ve % params.j_in_l();
    let we = ve / params.j_in_l();
    let byte_in_word = we * eb + byte_in_element;
    let (k_index, j_in_k_index) = ordering.word_order.vw_to_k(params, vw);
    VlinePos { vline, ve, vw, we, byte_in_element, byte_in_word, k_index, j_in_k_index }
}

/// The linear byte position of a kamlet-space address.
pub fn km_to_linear(params: &LamletParams, km: &KMAddr) -> u64 {
    let vw = km.ordering.word_order.k_to_vw(params, km.k_index, km.j_in_k_index);
    let eb = km.ordering.eb();
    let byte_in_word = km.byte_in_word(params);
    let we = byte_in_word / eb;
    let byte_in_element = byte_in_word % eb;
    let ve = we * params.j_in_l() + vw;
    km.vline(params) * params.vline_bytes as u64 + (ve * eb + byte_in_element) as u64
}

/// Compose a kamlet-space address from a linear byte position.
pub fn linear_to_km(params: &LamletParams, ordering: Ordering, lin: u64) -> KMAddr {
    let pos = linear_to_pos(params, ordering, lin);
    let addr = pos.vline * params.kamlet_vline_bytes() as u64
        + (pos.j_in_k_index * params.word_bytes + pos.byte_in_word) as u64;
    KMAddr { addr, k_index: pos.k_index, j_in_k_index: pos.j_in_k_index, ordering }
}

/// Router coordinates of a jamlet identified by kamlet and in-kamlet index.
pub fn k_indices_to_j_coords(
    params: &LamletParams,
    k_index: usize,
    j_in_k_index: usize,
) -> (i32, i32) {
    let k_x = k_index % params.k_cols;
    let k_y = k_index / params.k_cols;
    let j_x = k_x * params.j_cols + j_in_k_index % params.j_cols;
    let j_y = k_y * params.j_rows + j_in_k_index / params.j_cols;
    (j_x as i32, j_y as i32)
}

/// Kamlet and in-kamlet index of a jamlet at router coordinates.
pub fn j_coords_to_k_indices(params: &LamletParams, x: i32, y: i32) -> (usize, usize) {
    let (x, y) = (x as usize, y as usize);
    let k_x = x / params.j_cols;
    let k_y = y / params.j_rows;
    let k_index = k_y * params.k_cols + k_x;
    let j_in_k_index = (y % params.j_rows) * params.j_cols + x % params.j_cols;
    (k_index, j_in_k_index)
}

pub fn vw_index_to_j_coords(params: &LamletParams, word_order: WordOrder, vw: usize) -> (i32, i32) {
    let (k_index, j_in_k_index) = word_order.vw_to_k(params, vw);
    k_indices_to_j_coords(params, k_index, j_in_k_index)
}

pub fn j_coords_to_vw_index(params: &LamletParams, word_order: WordOrder, x: i32, y: i32) -> usize {
    let (k_index, j_in_k_index) = j_coords_to_k_indices(params, x, y);
    word_order.k_to_vw(params, k_index, j_in_k_index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Vpu,
    ScalarIdempotent,
    ScalarNonIdempotent,
    Unallocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFault {
    None,
    Unallocated,
}

/// Attributes of one allocated page.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub memory_type: MemoryType,
    /// VPU: per-kamlet byte base; scalar: scalar-space byte base.
    pub local_base: u64,
    pub ordering: Option<Ordering>,
}

impl PageInfo {
    pub fn is_vpu(&self) -> bool {
        self.memory_type == MemoryType::Vpu
    }

    pub fn idempotent(&self) -> bool {
        self.memory_type != MemoryType::ScalarNonIdempotent
    }
}

/// Page table mapping global pages to VPU or scalar backing.
pub struct Tlb {
    params: LamletParams,
    pages: HashMap<u64, PageInfo>,
    next_vpu_local: u64,
    next_scalar_base: u64,
}

impl Tlb {
    pub fn new(params: &LamletParams) -> Self {
        Tlb {
            params: params.clone(),
            pages: HashMap::new(),
            next_vpu_local: 0,
            next_scalar_base: 0,
        }
    }

    /// Back `size` bytes of global space starting at `g_addr` (page-aligned)
    /// with the given memory type.
    pub fn allocate_memory(
        &mut self,
        g_addr: GlobalAddress,
        size: usize,
        memory_type: MemoryType,
        ordering: Option<Ordering>,
    ) {
        let pb = self.params.page_bytes as u64;
        assert_eq!(g_addr.byte_addr() % pb, 0, "allocations are page-aligned");
        assert_eq!(size as u64 % pb, 0, "allocations are whole pages");
        let first_page = g_addr.page(&self.params);
        let n_pages = size as u64 / pb;
        for page in first_page..first_page + n_pages {
            assert!(!self.pages.contains_key(&page), "page {page:#x} already allocated");
            let info = match memory_type {
                MemoryType::Vpu => {
                    let ordering = ordering.expect("VPU pages carry an ordering");
                    let local_base = self.next_vpu_local;
                    // Each kamlet holds its interleaved share of the page.
                    self.next_vpu_local += pb / self.params.k_in_l() as u64;
                    PageInfo { memory_type, local_base, ordering: Some(ordering) }
                }
                MemoryType::ScalarIdempotent | MemoryType::ScalarNonIdempotent => {
                    let local_base = self.next_scalar_base;
                    self.next_scalar_base += pb;
                    PageInfo { memory_type, local_base, ordering: None }
                }
                MemoryType::Unallocated => panic!("cannot allocate an unallocated page"),
            };
            self.pages.insert(page, info);
        }
    }

    pub fn page_info(&self, page: u64) -> PageInfo {
        self.pages.get(&page).copied().unwrap_or(PageInfo {
            memory_type: MemoryType::Unallocated,
            local_base: 0,
            ordering: None,
        })
    }

    pub fn page_info_for(&self, g_addr: GlobalAddress) -> PageInfo {
        self.page_info(g_addr.page(&self.params))
    }

    pub fn check_access(&self, g_addr: GlobalAddress, _is_write: bool) -> TlbFault {
        match self.page_info_for(g_addr).memory_type {
            MemoryType::Unallocated => TlbFault::Unallocated,
            _ => TlbFault::None,
        }
    }

    /// Translate a global address within a VPU page.
    pub fn to_km_addr(&self, g_addr: GlobalAddress) -> KMAddr {
        let info = self.page_info_for(g_addr);
        assert!(info.is_vpu(), "to_km_addr on non-VPU page");
        let ordering = info.ordering.unwrap();
        let offset = g_addr.byte_in_page(&self.params);
        let mut km = linear_to_km(&self.params, ordering, offset);
        km.addr += info.local_base;
        km
    }

    /// Translate a global address within a scalar page.
    pub fn to_scalar_addr(&self, g_addr: GlobalAddress) -> ScalarAddr {
        let info = self.page_info_for(g_addr);
        assert!(!info.is_vpu() && info.memory_type != MemoryType::Unallocated);
        info.local_base + g_addr.byte_in_page(&self.params)
    }

    /// Bit offset of this address within its memory element.
    pub fn bit_in_element(&self, g_addr: GlobalAddress, ordering: Ordering) -> usize {
        let byte_in_e = (g_addr.byte_in_page(&self.params) as usize) % ordering.eb();
        byte_in_e * 8 + (g_addr.bit_addr % 8) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order_round_trip() {
        let p = LamletParams::square();
        for wo in [WordOrder::Standard, WordOrder::Reversed] {
            for vw in 0..p.j_in_l() {
                let (k, j) = wo.vw_to_k(&p, vw);
                assert_eq!(wo.k_to_vw(&p, k, j), vw);
            }
        }
    }

    #[test]
    fn test_coords_round_trip() {
        let p = LamletParams::square();
        for k in 0..p.k_in_l() {
            for j in 0..p.j_in_k() {
                let (x, y) = k_indices_to_j_coords(&p, k, j);
                assert_eq!(j_coords_to_k_indices(&p, x, y), (k, j));
            }
        }
    }

    #[test]
    fn test_linear_km_round_trip() {
        let p = LamletParams::small();
        let ordering = Ordering::new(WordOrder::Standard, 32);
        for lin in 0..256u64 {
            let km = linear_to_km(&p, ordering, lin);
            assert_eq!(km_to_linear(&p, &km), lin);
        }
    }

    #[test]
    fn test_linear_pos_interleaves_elements() {
        // Two kamlets, ew=32: elements alternate between kamlets, two
        // elements per word.
        let p = LamletParams::small();
        let ordering = Ordering::new(WordOrder::Standard, 32);
        let e0 = linear_to_pos(&p, ordering, 0);
        let e1 = linear_to_pos(&p, ordering, 4);
        let e2 = linear_to_pos(&p, ordering, 8);
        assert_eq!((e0.k_index, e0.byte_in_word), (0, 0));
        assert_eq!((e1.k_index, e1.byte_in_word), (1, 0));
        assert_eq!((e2.k_index, e2.byte_in_word), (0, 4));
        let v1 = linear_to_pos(&p, ordering, 16);
        assert_eq!(v1.vline, 1);
    }

    #[test]
    fn test_tlb_alloc_and_translate() {
        let p = LamletParams::small();
        let mut tlb = Tlb::new(&p);
        let ordering = Ordering::new(WordOrder::Standard, 32);
        tlb.allocate_memory(
            GlobalAddress::from_byte(0),
            2 * p.page_bytes,
            MemoryType::Vpu,
            Some(ordering),
        );
        tlb.allocate_memory(
            GlobalAddress::from_byte(2 * p.page_bytes as u64),
            p.page_bytes,
            MemoryType::ScalarNonIdempotent,
            None,
        );
        assert_eq!(tlb.check_access(GlobalAddress::from_byte(0), false), TlbFault::None);
        assert_eq!(
            tlb.check_access(GlobalAddress::from_byte(4 * p.page_bytes as u64), true),
            TlbFault::Unallocated
        );
        let km = tlb.to_km_addr(GlobalAddress::from_byte(4));
        assert_eq!(km.k_index, 1);
        assert_eq!(km.byte_in_word(&p), 0);
        // Second VPU page lands after the first page's per-kamlet share.
        let km2 = tlb.to_km_addr(GlobalAddress::from_byte(p.page_bytes as u64));
        assert_eq!(km2.addr, (p.page_bytes / p.k_in_l()) as u64);
        let s = tlb.to_scalar_addr(GlobalAddress::from_byte(2 * p.page_bytes as u64 + 7));
        assert_eq!(s, 7);
    }
}
