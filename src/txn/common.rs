use crate::addresses::{self, GlobalAddress, Ordering, Tlb, TlbFault};
use crate::jamlet::Jamlet;
use crate::kinstr::{IndexedInstr, StrideInstr};
use crate::message::MemAddr;
use crate::params::LamletParams;
use crate::utils;

/// Element a (jamlet, tag) pair is responsible for.
#[derive(Debug, Clone, Copy)]
pub struct ElementPos {
    /// Element index within the vline.
    pub ve: usize,
    /// Vector element index.
    pub e: usize,
    /// Bit offset of the tag byte within the element.
    pub bit_in_element: usize,
    /// Vline index, i.e. register offset from the base register.
    pub v: usize,
}

/// Which register element a byte tag of a jamlet's word belongs to, given
/// the operation's ordering and start index.
pub fn compute_element(
    params: &LamletParams,
    ordering: Ordering,
    start_index: usize,
    tag: usize,
    x: i32,
    y: i32,
) -> ElementPos {
    let vw = addresses::j_coords_to_vw_index(params, ordering.word_order, x, y);
    let ew = ordering.ew;
    let wb_bits = tag * 8;
    let bit_in_element = wb_bits % ew;
    let we = wb_bits / ew;
    let ve = we * params.j_in_l() + vw;
    let epv = params.elements_in_vline(ew);
    let v = if ve < start_index % epv {
        start_index / epv + 1
    } else {
        start_index / epv
    };
    ElementPos { ve, e: v * epv + ve, bit_in_element, v }
}

/// How a gather/scatter element finds its memory byte offset.
#[derive(Debug, Clone)]
pub enum AddressMode {
    Strided { stride_bytes: i64 },
    Indexed { index_reg: usize, index_ew: usize },
}

impl AddressMode {
    pub fn element_byte_offset(
        &self,
        params: &LamletParams,
        jamlet: &Jamlet,
        start_index: usize,
        element: usize,
    ) -> i64 {
        match self {
            AddressMode::Strided { stride_bytes } => {
                (element as i64 - start_index as i64) * stride_bytes
            }
            AddressMode::Indexed { index_reg, index_ew } => {
                let bytes = jamlet.read_rf_element(params, *index_reg, element, *index_ew);
                utils::word_to_u64(&bytes) as i64
            }
        }
    }

}

/// The common shape of strided and indexed gather/scatter operations.
#[derive(Debug, Clone)]
pub struct GatherOp {
    pub reg: usize,
    pub g_addr: GlobalAddress,
    pub start_index: usize,
    pub n_elements: usize,
    pub ordering: Ordering,
    pub mode: AddressMode,
    pub mask_reg: Option<usize>,
    pub instr_ident: u32,
    pub writeset_ident: u32,
}

impl GatherOp {
    pub fn from_stride(instr: &StrideInstr) -> Self {
        GatherOp {
            reg: instr.reg,
            g_addr: instr.g_addr,
            start_index: instr.start_index,
            n_elements: instr.n_elements,
            ordering: instr.ordering,
            mode: AddressMode::Strided { stride_bytes: instr.stride_bytes },
            mask_reg: instr.mask_reg,
            instr_ident: instr.instr_ident,
            writeset_ident: instr.writeset_ident,
        }
    }

    pub fn from_indexed(instr: &IndexedInstr) -> Self {
        GatherOp {
            reg: instr.reg,
            g_addr: instr.g_addr,
            start_index: instr.start_index,
            n_elements: instr.n_elements,
            ordering: instr.ordering,
            mode: AddressMode::Indexed { index_reg: instr.index_reg, index_ew: instr.index_ew },
            mask_reg: instr.mask_reg,
            instr_ident: instr.instr_ident,
            writeset_ident: instr.writeset_ident,
        }
    }
}

/// Bytes one tag must move, or the fault discovered while working that out.
#[derive(Debug, Clone, Copy)]
pub struct RequiredBytes {
    pub is_vpu: bool,
    /// `None` marks a TLB fault at this element.
    pub g_addr: Option<GlobalAddress>,
    pub n_bytes: usize,
    pub tag: usize,
}

/// Work out what a (jamlet, tag) pair must transfer for a gather/scatter.
///
/// Runs tile each element: a tag sends only when it starts a run (element
/// start, memory-element start, or page start) and the run extends to the
/// nearest of the three boundaries.
pub fn mem_request(
    params: &LamletParams,
    tlb: &Tlb,
    op: &GatherOp,
    jamlet: &Jamlet,
    pos: ElementPos,
    tag: usize,
    is_write: bool,
) -> Option<RequiredBytes> {
    if pos.e < op.start_index || pos.e >= op.start_index + op.n_elements {
        return None;
    }
    if let Some(mask_reg) = op.mask_reg {
        if !jamlet.mask_bit(params, mask_reg, pos.e) {
            return None;
        }
    }
    let eb_bits = pos.bit_in_element;
    let offset = op.mode.element_byte_offset(params, jamlet, op.start_index, pos.e);
    let g_addr = op.g_addr.bit_offset(offset * 8 + eb_bits as i64);
    if tlb.check_access(g_addr, is_write) != TlbFault::None {
        return Some(RequiredBytes { is_vpu: false, g_addr: None, n_bytes: 0, tag });
    }
    let page_info = tlb.page_info_for(g_addr);
    let page_byte_offset = g_addr.byte_in_page(params) as usize;
    let remaining_page_bytes = params.page_bytes - page_byte_offset;
    let reg_bytes_left = (op.ordering.ew - eb_bits) / 8;

    if !page_info.is_vpu() {
        if eb_bits == 0 || page_byte_offset == 0 {
            let n_bytes = remaining_page_bytes.min(reg_bytes_left);
            Some(RequiredBytes { is_vpu: false, g_addr: Some(g_addr), n_bytes, tag })
        } else {
            None
        }
    } else {
        let mem_ordering = page_info.ordering.unwrap();
        let mem_bie = tlb.bit_in_element(g_addr, mem_ordering);
        if mem_bie == 0 || eb_bits == 0 || page_byte_offset == 0 {
            let n_bytes = ((mem_ordering.ew - mem_bie) / 8)
                .min(reg_bytes_left)
                .min(remaining_page_bytes);
            Some(RequiredBytes { is_vpu: true, g_addr: Some(g_addr), n_bytes, tag })
        } else {
            None
        }
    }
}

/// Where a memory-word request goes, its address payload, and the byte
/// offset of the requested data within the responder's word.
pub fn mem_word_target(
    params: &LamletParams,
    tlb: &Tlb,
    g_addr: GlobalAddress,
    is_vpu: bool,
) -> ((i32, i32), MemAddr, usize) {
    if is_vpu {
        let km = tlb.to_km_addr(g_addr);
        let byte_in_word = km.byte_in_word(params);
        let coords = addresses::k_indices_to_j_coords(params, km.k_index, km.j_in_k_index);
        (coords, MemAddr::Vpu(km.word_aligned(params)), byte_in_word)
    } else {
        let scalar = tlb.to_scalar_addr(g_addr);
        ((0, -1), MemAddr::Scalar(scalar), 0)
    }
}
