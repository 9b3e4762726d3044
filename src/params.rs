/// Geometry and sizing for a simulated lamlet.
///
/// All other modules derive their dimensions from this bundle. The grid is
/// `k_cols x k_rows` kamlets, each `j_cols x j_rows` jamlets, with one
/// memlet per kamlet on the west/east edges and the scalar front-end at
/// router coordinates (0, -1).
#[derive(Debug, Clone)]
pub struct LamletParams {
    pub k_cols: usize,
    pub k_rows: usize,
    pub j_cols: usize,
    pub j_rows: usize,

    /// Bytes in one bus word (and in one register-file word per jamlet).
    pub word_bytes: usize,
    /// Bytes in one vector line: one word per jamlet in the lamlet.
    pub vline_bytes: usize,
    /// Maximum vector-register-group size in bytes.
    pub maxvl_bytes: usize,

    pub page_bytes: usize,
    /// Bytes of one cache line of a kamlet's cache (striped over its jamlets).
    pub cache_line_bytes: usize,
    pub jamlet_sram_bytes: usize,
    pub kamlet_memory_bytes: usize,

    /// Virtual channels; channel 0 is reserved for always-consumable
    /// responses.
    pub n_channels: usize,
    pub router_input_buffer_length: usize,
    pub router_output_buffer_length: usize,
    /// Outstanding ordered per-element instructions at the front-end.
    pub receive_buffer_depth: usize,

    pub n_response_idents: usize,
    pub max_response_tags: usize,
    pub n_vregs: usize,
}

impl LamletParams {
    /// Jamlets per kamlet.
    pub fn j_in_k(&self) -> usize {
        self.j_cols * self.j_rows
    }

    /// Kamlets per lamlet.
    pub fn k_in_l(&self) -> usize {
        self.k_cols * self.k_rows
    }

    /// Jamlets per lamlet; one vline carries one word per jamlet.
    pub fn j_in_l(&self) -> usize {
        self.j_in_k() * self.k_in_l()
    }

    /// One kamlet's share of a vline.
    pub fn kamlet_vline_bytes(&self) -> usize {
        self.vline_bytes / self.k_in_l()
    }

    /// Vlines held by one cache line.
    pub fn vlines_in_cache_line(&self) -> usize {
        self.cache_line_bytes / self.kamlet_vline_bytes()
    }

    /// One jamlet's share of a cache line.
    pub fn line_bytes_per_jamlet(&self) -> usize {
        self.cache_line_bytes / self.j_in_k()
    }

    /// Cache slots per jamlet.
    pub fn n_cache_slots(&self) -> usize {
        self.jamlet_sram_bytes / self.line_bytes_per_jamlet()
    }

    pub fn rf_slice_bytes(&self) -> usize {
        self.n_vregs * self.word_bytes
    }

    /// Router grid width in jamlet columns (memlets sit at x = -1 and
    /// x = grid_cols).
    pub fn grid_cols(&self) -> usize {
        self.j_cols * self.k_cols
    }

    pub fn grid_rows(&self) -> usize {
        self.j_rows * self.k_rows
    }

    pub fn elements_in_vline(&self, ew: usize) -> usize {
        self.vline_bytes * 8 / ew
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.n_channels >= 2, "need a response channel and a request channel");
        anyhow::ensure!(self.vline_bytes == self.word_bytes * self.j_in_l(),
            "vline must be one word per jamlet in the lamlet");
        anyhow::ensure!(self.vline_bytes % self.word_bytes == 0);
        anyhow::ensure!(self.cache_line_bytes % self.j_in_k() == 0,
            "cache lines stripe byte-wise over a kamlet's jamlets");
        anyhow::ensure!(self.cache_line_bytes % self.kamlet_vline_bytes() == 0,
            "cache lines hold whole vlines");
        anyhow::ensure!(self.jamlet_sram_bytes % self.line_bytes_per_jamlet() == 0);
        anyhow::ensure!(self.page_bytes % self.vline_bytes == 0,
            "pages hold whole vlines");
        anyhow::ensure!((self.page_bytes / self.k_in_l()) % self.cache_line_bytes == 0,
            "a page's per-kamlet footprint is whole cache lines");
        anyhow::ensure!(self.kamlet_memory_bytes % self.cache_line_bytes == 0);
        anyhow::ensure!(self.max_response_tags <= self.n_response_idents);
        Ok(())
    }

    /// The two-kamlet column used by most tests: one jamlet per kamlet,
    /// two kamlets stacked vertically.
    pub fn small() -> Self {
        LamletParams {
            k_cols: 1,
            k_rows: 2,
            j_cols: 1,
            j_rows: 1,
            word_bytes: 8,
            vline_bytes: 16,
            maxvl_bytes: 128,
            page_bytes: 4096,
            cache_line_bytes: 64,
            jamlet_sram_bytes: 512,
            kamlet_memory_bytes: 1 << 20,
            n_channels: 2,
            router_input_buffer_length: 2,
            router_output_buffer_length: 2,
            receive_buffer_depth: 2,
            n_response_idents: 64,
            max_response_tags: 64,
            n_vregs: 32,
        }
    }

    /// A 2x2 kamlet grid with 2x1 jamlets per kamlet.
    pub fn square() -> Self {
        LamletParams {
            k_cols: 2,
            k_rows: 2,
            j_cols: 2,
            j_rows: 1,
            word_bytes: 8,
            vline_bytes: 64,
            maxvl_bytes: 512,
            page_bytes: 4096,
            cache_line_bytes: 128,
            jamlet_sram_bytes: 512,
            kamlet_memory_bytes: 1 << 20,
            n_channels: 2,
            router_input_buffer_length: 2,
            router_output_buffer_length: 2,
            receive_buffer_depth: 2,
            n_response_idents: 64,
            max_response_tags: 64,
            n_vregs: 32,
        }
    }
}

impl Default for LamletParams {
    fn default() -> Self {
        LamletParams::small()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_params_validate() {
        let p = LamletParams::small();
        p.validate().unwrap();
        assert_eq!(p.j_in_l(), 2);
        assert_eq!(p.kamlet_vline_bytes(), 8);
        assert_eq!(p.vlines_in_cache_line(), 8);
        assert_eq!(p.line_bytes_per_jamlet(), 64);
        assert_eq!(p.n_cache_slots(), 8);
    }

    #[test]
    fn test_square_params_validate() {
        let p = LamletParams::square();
        p.validate().unwrap();
        assert_eq!(p.j_in_l(), 8);
        assert_eq!(p.j_in_k(), 2);
        assert_eq!(p.kamlet_vline_bytes(), 16);
        assert_eq!(p.vlines_in_cache_line(), 8);
    }
}
