use crate::addresses::{
    self, km_to_linear, linear_to_pos, KMAddr, Ordering,
};
use crate::params::LamletParams;

/// One byte's worth of agreement between the two sides of a J2J transfer:
/// copy `n_bits` bits from (memory vline `mem_v`, bit `mem_wb` of the owning
/// jamlet's word) to (register vline `reg_v`, bit `reg_wb`).
///
/// All entries produced for one (jamlet, tag) pair share `reg_vw` and
/// `reg_wb` (from the memory perspective) or `mem_vw` and `mem_wb` (from the
/// register perspective); only the vline pair varies. Both ends enumerate
/// the same entries in the same order, which is what lets a request carry
/// bare words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegMemMapping {
    /// Register vline index, i.e. offset from the instruction's base reg.
    pub reg_v: u64,
    pub reg_wb: usize,
    /// Absolute memory vline index within the kamlet space.
    pub mem_v: u64,
    pub mem_wb: usize,
    pub n_bits: usize,
    pub reg_vw: usize,
    pub mem_vw: usize,
}

struct MappingEntry {
    mapping: RegMemMapping,
    reg_coords: (i32, i32),
    mem_coords: (i32, i32),
}

fn enumerate_mappings(
    params: &LamletParams,
    k_maddr: &KMAddr,
    reg_ordering: Ordering,
    start_index: usize,
    n_elements: usize,
) -> Vec<MappingEntry> {
    let reg_eb = reg_ordering.eb();
    let epv_reg = params.elements_in_vline(reg_ordering.ew);
    let mem_ordering = k_maddr.ordering;
    let base_lin = km_to_linear(params, k_maddr);
    let mut out = Vec::with_capacity(n_elements * reg_eb);
    for e in start_index..start_index + n_elements {
        let reg_v = (e / epv_reg) as u64;
        let reg_ve = e % epv_reg;
        let reg_vw = reg_ve % params.j_in_l();
        let reg_we = reg_ve / params.j_in_l();
        for b in 0..reg_eb {
            let reg_wb = (reg_we * reg_eb + b) * 8;
            let mem_lin = base_lin + ((e - start_index) * reg_eb + b) as u64;
            let pos = linear_to_pos(params, mem_ordering, mem_lin);
            let mapping = RegMemMapping {
                reg_v,
                reg_wb,
                mem_v: pos.vline,
                mem_wb: pos.byte_in_word * 8,
                n_bits: 8,
                reg_vw,
                mem_vw: pos.vw,
            };
            out.push(MappingEntry {
                mapping,
                reg_coords: addresses::vw_index_to_j_coords(
                    params,
                    reg_ordering.word_order,
                    reg_vw,
                ),
                mem_coords: addresses::k_indices_to_j_coords(
                    params,
                    pos.k_index,
                    pos.j_in_k_index,
                ),
            });
        }
    }
    out
}

/// Mappings whose memory byte lives on the jamlet at `(mem_x, mem_y)` at
/// bit `mem_wb` of its word. `mem_wb` is `tag * 8`.
pub fn mappings_from_mem(
    params: &LamletParams,
    k_maddr: &KMAddr,
    reg_ordering: Ordering,
    start_index: usize,
    n_elements: usize,
    mem_wb: usize,
    mem_x: i32,
    mem_y: i32,
) -> Vec<RegMemMapping> {
    let entries = enumerate_mappings(params, k_maddr, reg_ordering, start_index, n_elements);
    let selected: Vec<RegMemMapping> = entries
        .into_iter()
        .filter(|e| e.mem_coords == (mem_x, mem_y) && e.mapping.mem_wb == mem_wb)
        .map(|e| e.mapping)
        .collect();
    if let Some(first) = selected.first() {
        debug_assert!(selected.iter().all(|m| m.reg_vw == first.reg_vw));
        debug_assert!(selected.iter().all(|m| m.reg_wb == first.reg_wb));
    }
    selected
}

/// Mappings whose register byte lives on the jamlet at `(reg_x, reg_y)` at
/// bit `reg_wb` of its word. `reg_wb` is `tag * 8`.
pub fn mappings_from_reg(
    params: &LamletParams,
    k_maddr: &KMAddr,
    reg_ordering: Ordering,
    start_index: usize,
    n_elements: usize,
    reg_wb: usize,
    reg_x: i32,
    reg_y: i32,
) -> Vec<RegMemMapping> {
    let entries = enumerate_mappings(params, k_maddr, reg_ordering, start_index, n_elements);
    let selected: Vec<RegMemMapping> = entries
        .into_iter()
        .filter(|e| e.reg_coords == (reg_x, reg_y) && e.mapping.reg_wb == reg_wb)
        .map(|e| e.mapping)
        .collect();
    if let Some(first) = selected.first() {
        debug_assert!(selected.iter().all(|m| m.mem_vw == first.mem_vw));
        debug_assert!(selected.iter().all(|m| m.mem_wb == first.mem_wb));
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::WordOrder;

    fn base_km(params: &LamletParams, addr: u64, ew: usize) -> KMAddr {
        let ordering = Ordering::new(WordOrder::Standard, ew);
        KMAddr { addr, k_index: 0, j_in_k_index: 0, ordering }
    }

    #[test]
    fn test_every_byte_mapped_exactly_once() {
        let params = LamletParams::small();
        let reg_ordering = Ordering::new(WordOrder::Standard, 32);
        let k_maddr = base_km(&params, 0, 32);
        let (n_elements, eb) = (8, 4);
        let mut total = 0;
        for y in 0..params.grid_rows() as i32 {
            for x in 0..params.grid_cols() as i32 {
                for tag in 0..params.word_bytes {
                    total += mappings_from_mem(
                        &params, &k_maddr, reg_ordering, 0, n_elements, tag * 8, x, y,
                    )
                    .len();
                }
            }
        }
        assert_eq!(total, n_elements * eb);
    }

    #[test]
    fn test_aligned_same_width_is_identity() {
        // Same ordering both sides, vline-aligned base: memory byte (vw, wb)
        // maps to register byte (vw, wb).
        let params = LamletParams::small();
        let reg_ordering = Ordering::new(WordOrder::Standard, 32);
        let k_maddr = base_km(&params, 0, 32);
        for tag in 0..params.word_bytes {
            let mappings =
                mappings_from_mem(&params, &k_maddr, reg_ordering, 0, 8, tag * 8, 0, 0);
            for m in mappings {
                assert_eq!(m.reg_wb, m.mem_wb);
                assert_eq!(m.reg_vw, m.mem_vw);
                assert_eq!(m.reg_v, m.mem_v);
            }
        }
    }

    #[test]
    fn test_perspectives_agree() {
        // From-reg must select exactly the entries from-mem attributes to
        // the corresponding jamlet, for an unaligned base.
        let params = LamletParams::small();
        let reg_ordering = Ordering::new(WordOrder::Standard, 32);
        let k_maddr = base_km(&params, 4, 32);
        let mut from_mem_all = Vec::new();
        for y in 0..params.grid_rows() as i32 {
            for x in 0..params.grid_cols() as i32 {
                for tag in 0..params.word_bytes {
                    from_mem_all.extend(mappings_from_mem(
                        &params, &k_maddr, reg_ordering, 0, 6, tag * 8, x, y,
                    ));
                }
            }
        }
        let mut from_reg_all = Vec::new();
        for y in 0..params.grid_rows() as i32 {
            for x in 0..params.grid_cols() as i32 {
                for tag in 0..params.word_bytes {
                    from_reg_all.extend(mappings_from_reg(
                        &params, &k_maddr, reg_ordering, 0, 6, tag * 8, x, y,
                    ));
                }
            }
        }
        let key = |m: &RegMemMapping| (m.mem_v, m.mem_wb, m.reg_v, m.reg_wb);
        let mut a: Vec<_> = from_mem_all.iter().map(key).collect();
        let mut b: Vec<_> = from_reg_all.iter().map(key).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unaligned_base_shifts_bytes() {
        // Base one element in: element 0 of the register grid reads from
        // element 1's memory slot, which lives on the second kamlet.
        let params = LamletParams::small();
        let reg_ordering = Ordering::new(WordOrder::Standard, 32);
        let ordering = Ordering::new(WordOrder::Standard, 32);
        let k_maddr = KMAddr { addr: 0, k_index: 1, j_in_k_index: 0, ordering };
        // Register element 0 sits on jamlet (0,0), byte 0 of its word.
        let mappings = mappings_from_reg(&params, &k_maddr, reg_ordering, 0, 2, 0, 0, 0);
        assert!(!mappings.is_empty());
        for m in &mappings {
            assert_eq!(m.mem_vw, 1, "element 1 slot is on the second kamlet");
        }
    }
}
