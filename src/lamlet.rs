use std::collections::VecDeque;

use anyhow::{ensure, Result};

use crate::addresses::{
    j_coords_to_k_indices, GlobalAddress, MemoryType, Ordering, Tlb, WordOrder,
};
use crate::clock::{Clock, Promise};
use crate::kamlet::{Kamlet, StepCtx};
use crate::kinstr::{
    IndexedElementInstr, IndexedInstr, KInstr, LinesInstr, LoadInstr, ReadBytesInstr,
    RegGatherInstr, StoreInstr, StrideInstr, WriteImmBytesInstr,
};
use crate::memlet::Memlet;
use crate::message::{Direction, Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::monitor::Monitor;
use crate::params::LamletParams;
use crate::router::Router;
use crate::scalar::ScalarFrontend;
use crate::sync::{Synchronizer, SYNC_DIRECTIONS};
use crate::txn::completion_ident;

/// Outcome of a driver-level vector memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorOpResult {
    pub success: bool,
    /// First faulting element when `success` is false.
    pub element_index: Option<usize>,
}

impl VectorOpResult {
    fn ok() -> Self {
        VectorOpResult { success: true, element_index: None }
    }

    fn fault(element: usize) -> Self {
        VectorOpResult { success: false, element_index: Some(element) }
    }

    fn from_min_fault(min: Option<u64>) -> Self {
        match min {
            None => VectorOpResult::ok(),
            Some(e) => VectorOpResult::fault(e as usize),
        }
    }
}

/// Instruction idents step by this much so per-tag child idents and the
/// completion-barrier ident of one operation never collide with another's.
const IDENT_STRIDE: u32 = 16;

/// The whole simulated chip: the kamlet grid, its memlets, the scalar
/// front-end, and the wiring between their routers and synchronizers.
pub struct Lamlet {
    pub params: LamletParams,
    pub clock: Clock,
    pub tlb: Tlb,
    pub monitor: Monitor,
    pub kamlets: Vec<Kamlet>,
    pub memlets: Vec<Memlet>,
    pub frontend: ScalarFrontend,
    host_sync: Synchronizer,
    router_positions: Vec<(i32, i32)>,
    sync_positions: Vec<(i32, i32)>,
    next_ident: u32,
}

fn dir_delta(direction: Direction) -> (i32, i32) {
    match direction {
        Direction::N => (0, -1),
        Direction::S => (0, 1),
        Direction::E => (1, 0),
        Direction::W => (-1, 0),
        Direction::H => (0, 0),
    }
}

fn dir_opposite(direction: Direction) -> Direction {
    match direction {
        Direction::N => Direction::S,
        Direction::S => Direction::N,
        Direction::E => Direction::W,
        Direction::W => Direction::E,
        Direction::H => Direction::H,
    }
}

impl Lamlet {
    pub fn new(params: &LamletParams, max_cycles: u64) -> Result<Self> {
        params.validate()?;
        let kamlets: Vec<Kamlet> = (0..params.k_in_l()).map(|k| Kamlet::new(params, k)).collect();
        let memlets: Vec<Memlet> = (0..params.k_in_l()).map(|k| Memlet::new(params, k)).collect();
        let mut router_positions = vec![(0, -1)];
        for y in 0..params.grid_rows() as i32 {
            for x in 0..params.grid_cols() as i32 {
                router_positions.push((x, y));
            }
        }
        for memlet in &memlets {
            router_positions.extend(memlet.coords.iter().copied());
        }
        let mut sync_positions = vec![(0, -1)];
        for y in 0..params.k_rows as i32 {
            for x in 0..params.k_cols as i32 {
                sync_positions.push((x, y));
            }
        }
        Ok(Lamlet {
            params: params.clone(),
            clock: Clock::new(max_cycles),
            tlb: Tlb::new(params),
            monitor: Monitor::new(),
            kamlets,
            memlets,
            frontend: ScalarFrontend::new(params),
            host_sync: Synchronizer::new(params.k_cols, params.k_rows, 0, -1),
            router_positions,
            sync_positions,
            next_ident: IDENT_STRIDE,
        })
    }

    fn next_instr_ident(&mut self) -> u32 {
        let ident = self.next_ident;
        self.next_ident += IDENT_STRIDE;
        ident
    }

    // --- one simulated cycle ---

    pub fn step(&mut self) -> Result<()> {
        let cycle = self.clock.cycle;
        {
            let Lamlet { frontend, kamlets, memlets, tlb, monitor, .. } = self;
            let mut ctx = StepCtx { cycle, tlb, monitor };
            frontend.step(&mut ctx);
            for kamlet in kamlets.iter_mut() {
                kamlet.step(&mut ctx);
            }
            for memlet in memlets.iter_mut() {
                memlet.step(&mut ctx);
            }
            frontend.step_routers(cycle);
            for kamlet in kamlets.iter_mut() {
                kamlet.step_routers(cycle);
            }
            for memlet in memlets.iter_mut() {
                memlet.step_routers(cycle);
            }
        }
        self.transfer_links();
        self.transfer_sync();
        {
            let Lamlet { frontend, kamlets, memlets, host_sync, .. } = self;
            frontend.update();
            for kamlet in kamlets.iter_mut() {
                kamlet.update();
            }
            for memlet in memlets.iter_mut() {
                memlet.update();
            }
            host_sync.update();
        }
        self.clock.advance()
    }

    fn has_router(&self, coords: (i32, i32)) -> bool {
        self.router_positions.contains(&coords)
    }

    fn router_mut(&mut self, coords: (i32, i32), channel: usize) -> &mut Router {
        if coords == (0, -1) {
            return &mut self.frontend.routers[channel];
        }
        let (x, _) = coords;
        if x < 0 || x >= self.params.grid_cols() as i32 {
            for memlet in &mut self.memlets {
                if let Some(r) = memlet.coords.iter().position(|&c| c == coords) {
                    return &mut memlet.routers[r][channel];
                }
            }
            panic!("no memlet router at {coords:?}");
        }
        let (k, j) = j_coords_to_k_indices(&self.params, coords.0, coords.1);
        &mut self.kamlets[k].body.jamlets[j].routers[channel]
    }

    /// Move one word per channel along every directed link.
    fn transfer_links(&mut self) {
        let positions = self.router_positions.clone();
        for &from in &positions {
            for direction in [Direction::N, Direction::S, Direction::E, Direction::W] {
                let (dx, dy) = dir_delta(direction);
                let to = (from.0 + dx, from.1 + dy);
                if !self.has_router(to) {
                    continue;
                }
                let opposite = dir_opposite(direction);
                for channel in 0..self.params.n_channels {
                    let ready = {
                        let src = self.router_mut(from, channel);
                        src.has_output(direction)
                    };
                    if !ready {
                        continue;
                    }
                    let room = {
                        let dst = self.router_mut(to, channel);
                        dst.has_input_room(opposite)
                    };
                    if !room {
                        continue;
                    }
                    let word = self.router_mut(from, channel).pop_output(direction);
                    self.router_mut(to, channel).receive(opposite, word);
                }
            }
        }
    }

    fn sync_mut(&mut self, coords: (i32, i32)) -> &mut Synchronizer {
        if coords.1 < 0 {
            return &mut self.host_sync;
        }
        let k = coords.1 as usize * self.params.k_cols + coords.0 as usize;
        &mut self.kamlets[k].body.synchronizer
    }

    /// Move one message per direction between synchronizer neighbors, then
    /// step the host node (the kamlet nodes step inside their kamlets).
    fn transfer_sync(&mut self) {
        let positions = self.sync_positions.clone();
        for &from in &positions {
            for direction in SYNC_DIRECTIONS {
                let (dx, dy) = direction.delta();
                let to = (from.0 + dx, from.1 + dy);
                if !positions.contains(&to) {
                    continue;
                }
                let opposite = direction.opposite();
                if !self.sync_mut(to).can_receive(opposite) {
                    continue;
                }
                if let Some(msg) = self.sync_mut(from).get_output(direction) {
                    self.sync_mut(to).receive(opposite, msg);
                }
            }
        }
        let cycle = self.clock.cycle;
        let Lamlet { host_sync, monitor, .. } = self;
        host_sync.step(cycle, monitor);
    }

    // --- running ---

    pub fn run_until<F>(&mut self, mut pred: F) -> Result<()>
    where
        F: FnMut(&Lamlet) -> bool,
    {
        while !pred(self) {
            self.step()?;
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.frontend.is_quiet() && self.kamlets.iter().all(|k| k.is_idle())
    }

    /// Run until every kamlet has drained its work and the front-end has
    /// nothing left to send.
    pub fn run_until_idle(&mut self) -> Result<()> {
        self.run_until(|l| l.is_idle())
    }

    // --- memory setup and probing ---

    pub fn allocate_memory(
        &mut self,
        addr: u64,
        size: usize,
        memory_type: MemoryType,
        ordering: Option<Ordering>,
    ) {
        let g = GlobalAddress::from_byte(addr);
        self.tlb.allocate_memory(g, size, memory_type, ordering);
        if memory_type != MemoryType::Vpu {
            let pb = self.params.page_bytes as u64;
            for page_offset in (0..size as u64).step_by(self.params.page_bytes) {
                let info = self.tlb.page_info_for(GlobalAddress::from_byte(addr + page_offset));
                self.frontend.register_page(
                    info.local_base,
                    pb,
                    memory_type == MemoryType::ScalarNonIdempotent,
                );
            }
        }
    }

    fn send_instruction_to_kamlet(&mut self, k: usize, instr: KInstr) {
        let target = (self.kamlets[k].body.min_x, self.kamlets[k].body.min_y);
        let header = Header {
            message_type: MessageType::Instructions,
            send_type: SendType::Single,
            length: 2,
            source_x: 0,
            source_y: -1,
            target_x: target.0,
            target_y: target.1,
            ident: 0,
            ext: HeaderExt::Plain,
        };
        self.frontend.queue_packet(Packet::new(header, vec![Flit::Instr(instr)]));
    }

    fn send_instruction(&mut self, instr: KInstr) {
        for k in 0..self.kamlets.len() {
            self.send_instruction_to_kamlet(k, instr.clone());
        }
    }

    /// Seed memory through the coherent paths: scalar pages directly,
    /// VPU pages via cache-through probe instructions.
    pub fn set_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let mut issued_probe = false;
        let mut i = 0usize;
        while i < bytes.len() {
            let g = GlobalAddress::from_byte(addr + i as u64);
            let info = self.tlb.page_info_for(g);
            match info.memory_type {
                MemoryType::Unallocated => {
                    anyhow::bail!("set_memory touches unallocated page at {:#x}", addr + i as u64)
                }
                MemoryType::ScalarIdempotent | MemoryType::ScalarNonIdempotent => {
                    let in_page = g.byte_in_page(&self.params) as usize;
                    let n = (self.params.page_bytes - in_page).min(bytes.len() - i);
                    let scalar = self.tlb.to_scalar_addr(g);
                    self.frontend.write_scalar(scalar, &bytes[i..i + n]);
                    i += n;
                }
                MemoryType::Vpu => {
                    // Grow a run of kamlet-space-consecutive bytes within
                    // one cache line.
                    let km = self.tlb.to_km_addr(g);
                    let line = km.line_addr(&self.params);
                    let line_end = line + self.params.cache_line_bytes as u64;
                    let mut n = 1usize;
                    while i + n < bytes.len() {
                        let g2 = GlobalAddress::from_byte(addr + (i + n) as u64);
                        if self.tlb.page_info_for(g2).memory_type != MemoryType::Vpu {
                            break;
                        }
                        let km2 = self.tlb.to_km_addr(g2);
                        if km2.k_index != km.k_index
                            || km2.addr != km.addr + n as u64
                            || km2.addr >= line_end
                        {
                            break;
                        }
                        n += 1;
                    }
                    let instr = KInstr::WriteImmBytes(WriteImmBytesInstr {
                        k_maddr: km,
                        imm: bytes[i..i + n].to_vec(),
                    });
                    self.send_instruction_to_kamlet(km.k_index, instr);
                    issued_probe = true;
                    i += n;
                }
            }
        }
        if issued_probe {
            self.run_until_idle()?;
        }
        Ok(())
    }

    /// Read memory back through the same coherent paths.
    pub fn get_memory(&mut self, addr: u64, n_bytes: usize) -> Result<Vec<u8>> {
        let mut plan: Vec<(usize, usize, Option<Promise<Vec<u8>>>)> = Vec::new();
        let mut i = 0usize;
        while i < n_bytes {
            let g = GlobalAddress::from_byte(addr + i as u64);
            let info = self.tlb.page_info_for(g);
            match info.memory_type {
                MemoryType::Unallocated => {
                    anyhow::bail!("get_memory touches unallocated page at {:#x}", addr + i as u64)
                }
                MemoryType::ScalarIdempotent | MemoryType::ScalarNonIdempotent => {
                    let in_page = g.byte_in_page(&self.params) as usize;
                    let n = (self.params.page_bytes - in_page).min(n_bytes - i);
                    plan.push((i, n, None));
                    i += n;
                }
                MemoryType::Vpu => {
                    let km = self.tlb.to_km_addr(g);
                    let line = km.line_addr(&self.params);
                    let line_end = line + self.params.cache_line_bytes as u64;
                    let mut n = 1usize;
                    while i + n < n_bytes {
                        let g2 = GlobalAddress::from_byte(addr + (i + n) as u64);
                        if self.tlb.page_info_for(g2).memory_type != MemoryType::Vpu {
                            break;
                        }
                        let km2 = self.tlb.to_km_addr(g2);
                        if km2.k_index != km.k_index
                            || km2.addr != km.addr + n as u64
                            || km2.addr >= line_end
                        {
                            break;
                        }
                        n += 1;
                    }
                    let ident = self.next_instr_ident();
                    let promise = self.frontend.expect_read_bytes(ident);
                    let instr = KInstr::ReadBytes(ReadBytesInstr {
                        k_maddr: km,
                        size: n,
                        instr_ident: ident,
                    });
                    self.send_instruction_to_kamlet(km.k_index, instr);
                    plan.push((i, n, Some(promise)));
                    i += n;
                }
            }
        }
        let promises: Vec<Promise<Vec<u8>>> =
            plan.iter().filter_map(|(_, _, p)| p.clone()).collect();
        self.run_until(|_| promises.iter().all(|p| p.is_set()))?;
        let mut out = vec![0u8; n_bytes];
        for (offset, n, promise) in plan {
            match promise {
                Some(promise) => {
                    let bytes = promise.take().unwrap();
                    out[offset..offset + n].copy_from_slice(&bytes[..n]);
                }
                None => {
                    let g = GlobalAddress::from_byte(addr + offset as u64);
                    let scalar = self.tlb.to_scalar_addr(g);
                    out[offset..offset + n]
                        .copy_from_slice(&self.frontend.read_scalar(scalar, n));
                }
            }
        }
        Ok(out)
    }

    // --- register probes (test-harness seams) ---

    pub fn write_vreg_element(
        &mut self,
        base_reg: usize,
        element: usize,
        ordering: Ordering,
        bytes: &[u8],
    ) {
        let eb = ordering.eb();
        assert_eq!(bytes.len(), eb);
        let epv = self.params.elements_in_vline(ordering.ew);
        let v = element / epv;
        let ve = element % epv;
        let vw = ve % self.params.j_in_l();
        let we = ve / self.params.j_in_l();
        let (k, j) = ordering.word_order.vw_to_k(&self.params, vw);
        let wb = self.params.word_bytes;
        let offset = (base_reg + v) * wb + we * eb;
        self.kamlets[k].body.jamlets[j].rf_slice[offset..offset + eb].copy_from_slice(bytes);
    }

    pub fn read_vreg_element(
        &mut self,
        base_reg: usize,
        element: usize,
        ordering: Ordering,
    ) -> Vec<u8> {
        let eb = ordering.eb();
        let epv = self.params.elements_in_vline(ordering.ew);
        let v = element / epv;
        let ve = element % epv;
        let vw = ve % self.params.j_in_l();
        let we = ve / self.params.j_in_l();
        let (k, j) = ordering.word_order.vw_to_k(&self.params, vw);
        let wb = self.params.word_bytes;
        let offset = (base_reg + v) * wb + we * eb;
        self.kamlets[k].body.jamlets[j].rf_slice[offset..offset + eb].to_vec()
    }

    /// Distribute mask bits: the bit for element `e` lives on the jamlet
    /// owning `e` under the given word order, at bit `e / j_in_l` of its
    /// mask-register word.
    pub fn write_mask_register(&mut self, mask_reg: usize, word_order: WordOrder, bits: &[bool]) {
        let wb = self.params.word_bytes;
        for kamlet in &mut self.kamlets {
            for jamlet in &mut kamlet.body.jamlets {
                jamlet.rf_slice[mask_reg * wb..(mask_reg + 1) * wb].fill(0);
            }
        }
        for (e, bit) in bits.iter().enumerate() {
            if !bit {
                continue;
            }
            let vw = e % self.params.j_in_l();
            let (k, j) = word_order.vw_to_k(&self.params, vw);
            let bit_index = e / self.params.j_in_l();
            let byte = mask_reg * wb + bit_index / 8;
            self.kamlets[k].body.jamlets[j].rf_slice[byte] |= 1 << (bit_index % 8);
        }
    }

    pub fn zero_vreg(&mut self, reg: usize, n_regs: usize) {
        let wb = self.params.word_bytes;
        for kamlet in &mut self.kamlets {
            for jamlet in &mut kamlet.body.jamlets {
                jamlet.rf_slice[reg * wb..(reg + n_regs) * wb].fill(0);
            }
        }
    }

    /// Zero whole cache lines of a VPU region without fetching from DRAM.
    pub fn zero_lines(&mut self, addr: u64, n_lines: usize) -> Result<()> {
        let g = GlobalAddress::from_byte(addr);
        ensure!(self.tlb.page_info_for(g).is_vpu(), "line management outside VPU memory");
        let km = self.tlb.to_km_addr(g);
        ensure!(km.addr % self.params.cache_line_bytes as u64 == 0, "line-aligned address");
        for k in 0..self.params.k_in_l() {
            let k_maddr = crate::addresses::KMAddr { k_index: k, ..km };
            self.send_instruction_to_kamlet(
                k,
                KInstr::ZeroLines(LinesInstr { k_maddr, n_cache_lines: n_lines }),
            );
        }
        self.run_until_idle()
    }

    /// Drop resident cache lines of a VPU region without writing back.
    pub fn discard_lines(&mut self, addr: u64, n_lines: usize) -> Result<()> {
        let g = GlobalAddress::from_byte(addr);
        ensure!(self.tlb.page_info_for(g).is_vpu(), "line management outside VPU memory");
        let km = self.tlb.to_km_addr(g);
        ensure!(km.addr % self.params.cache_line_bytes as u64 == 0, "line-aligned address");
        for k in 0..self.params.k_in_l() {
            let k_maddr = crate::addresses::KMAddr { k_index: k, ..km };
            self.send_instruction_to_kamlet(
                k,
                KInstr::DiscardLines(LinesInstr { k_maddr, n_cache_lines: n_lines }),
            );
        }
        self.run_until_idle()
    }

    // --- barrier participation ---

    fn host_event(&mut self, ident: u32) {
        let cycle = self.clock.cycle;
        let Lamlet { host_sync, monitor, .. } = self;
        host_sync.local_event(cycle, ident, None, monitor);
    }

    /// Join the fault and completion barriers of a two-barrier operation
    /// and collect the aggregated minimum fault.
    fn await_two_barriers(&mut self, ident: u32) -> Result<VectorOpResult> {
        let comp = completion_ident(&self.params, ident);
        self.host_event(ident);
        self.host_event(comp);
        self.run_until(|l| l.host_sync.is_complete(ident) && l.host_sync.is_complete(comp))?;
        let min = self.host_sync.get_min_value(ident);
        self.run_until_idle()?;
        Ok(VectorOpResult::from_min_fault(min))
    }

    // --- vector memory operations ---

    /// Unit-stride load through the jamlet-to-jamlet path. The range must
    /// be VPU-resident and within one cache line per kamlet.
    pub fn vload_unit(
        &mut self,
        vd: usize,
        addr: u64,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        let g = GlobalAddress::from_byte(addr);
        ensure!(self.tlb.page_info_for(g).is_vpu(), "unit-stride access outside VPU memory");
        let k_maddr = self.tlb.to_km_addr(g);
        let ident = self.next_instr_ident();
        self.send_instruction(KInstr::Load(LoadInstr {
            dst: vd,
            k_maddr,
            start_index,
            n_elements,
            dst_ordering: ordering,
            mask_reg,
            instr_ident: ident,
            writeset_ident: ident,
        }));
        self.run_until_idle()?;
        Ok(VectorOpResult::ok())
    }

    pub fn vstore_unit(
        &mut self,
        vs: usize,
        addr: u64,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        let g = GlobalAddress::from_byte(addr);
        ensure!(self.tlb.page_info_for(g).is_vpu(), "unit-stride access outside VPU memory");
        let k_maddr = self.tlb.to_km_addr(g);
        let ident = self.next_instr_ident();
        self.send_instruction(KInstr::Store(StoreInstr {
            src: vs,
            k_maddr,
            start_index,
            n_elements,
            src_ordering: ordering,
            mask_reg,
            instr_ident: ident,
            writeset_ident: ident,
        }));
        self.run_until_idle()?;
        Ok(VectorOpResult::ok())
    }

    /// The per-tag gather/scatter machinery covers one vline of elements
    /// per instruction; longer vectors run as a sequence of per-vline
    /// instructions, stopping at the first faulting chunk so nothing is
    /// issued past a fault.
    fn vline_chunks(&self, start_index: usize, n_elements: usize, ew: usize) -> Vec<(usize, usize)> {
        let epv = self.params.elements_in_vline(ew);
        let mut chunks = Vec::new();
        let mut s = start_index;
        while s < start_index + n_elements {
            let end = ((s / epv) + 1) * epv;
            let end = end.min(start_index + n_elements);
            chunks.push((s, end - s));
            s = end;
        }
        chunks
    }

    fn run_strided(
        &mut self,
        is_store: bool,
        reg: usize,
        addr: u64,
        stride_bytes: i64,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        for (chunk_start, chunk_n) in self.vline_chunks(start_index, n_elements, ordering.ew) {
            let ident = self.next_instr_ident();
            let base = addr.checked_add_signed((chunk_start - start_index) as i64 * stride_bytes)
                .unwrap();
            let instr = StrideInstr {
                reg,
                g_addr: GlobalAddress::from_byte(base),
                start_index: chunk_start,
                n_elements: chunk_n,
                ordering,
                stride_bytes,
                mask_reg,
                instr_ident: ident,
                writeset_ident: ident,
            };
            self.send_instruction(if is_store {
                KInstr::StoreStride(instr)
            } else {
                KInstr::LoadStride(instr)
            });
            let result = self.await_two_barriers(ident)?;
            if !result.success {
                return Ok(result);
            }
        }
        Ok(VectorOpResult::ok())
    }

    pub fn vload_strided(
        &mut self,
        vd: usize,
        addr: u64,
        stride_bytes: i64,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        self.run_strided(false, vd, addr, stride_bytes, ordering, n_elements, start_index, mask_reg)
    }

    pub fn vstore_strided(
        &mut self,
        vs: usize,
        addr: u64,
        stride_bytes: i64,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        self.run_strided(true, vs, addr, stride_bytes, ordering, n_elements, start_index, mask_reg)
    }

    fn run_indexed_unordered(
        &mut self,
        is_store: bool,
        reg: usize,
        addr: u64,
        index_reg: usize,
        index_ew: usize,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        for (chunk_start, chunk_n) in self.vline_chunks(start_index, n_elements, ordering.ew) {
            let ident = self.next_instr_ident();
            let instr = IndexedInstr {
                reg,
                g_addr: GlobalAddress::from_byte(addr),
                start_index: chunk_start,
                n_elements: chunk_n,
                ordering,
                index_reg,
                index_ew,
                mask_reg,
                instr_ident: ident,
                writeset_ident: ident,
            };
            self.send_instruction(if is_store {
                KInstr::StoreIndexed(instr)
            } else {
                KInstr::LoadIndexed(instr)
            });
            let result = self.await_two_barriers(ident)?;
            if !result.success {
                return Ok(result);
            }
        }
        Ok(VectorOpResult::ok())
    }

    pub fn vload_indexed(
        &mut self,
        vd: usize,
        addr: u64,
        index_reg: usize,
        index_ew: usize,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        self.run_indexed_unordered(
            false, vd, addr, index_reg, index_ew, ordering, n_elements, start_index, mask_reg,
        )
    }

    pub fn vstore_indexed(
        &mut self,
        vs: usize,
        addr: u64,
        index_reg: usize,
        index_ew: usize,
        ordering: Ordering,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        self.run_indexed_unordered(
            true, vs, addr, index_reg, index_ew, ordering, n_elements, start_index, mask_reg,
        )
    }

    /// Ordered element ops run with a dispatch window of
    /// `receive_buffer_depth` elements in flight. Later elements' memory
    /// requests queue at the front-end's ordered gate until every earlier
    /// element has responded; elements retire strictly in index order, and
    /// a fault stops further dispatch while the in-flight tail drains
    /// against the aborted gate.
    fn run_ordered(
        &mut self,
        is_store: bool,
        reg: usize,
        addr: u64,
        index_reg: usize,
        index_ew: usize,
        data_ew: usize,
        word_order: WordOrder,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        let op_ident = self.next_instr_ident();
        self.frontend.gate_open(op_ident, start_index);
        let window = self.params.receive_buffer_depth.max(1);
        let end = start_index + n_elements;
        let mut in_flight: VecDeque<(usize, u32)> = VecDeque::new();
        let mut next_dispatch = start_index;
        let mut result = VectorOpResult::ok();
        loop {
            while result.success && next_dispatch < end && in_flight.len() < window {
                let element_index = next_dispatch;
                let el_ident = self.next_instr_ident();
                let instr = IndexedElementInstr {
                    reg,
                    index_reg,
                    index_ew,
                    data_ew,
                    element_index,
                    base_addr: GlobalAddress::from_byte(addr),
                    word_order,
                    instr_ident: el_ident,
                    parent_ident: op_ident,
                    mask_reg,
                };
                let vw = element_index % self.params.j_in_l();
                let (k, _) = word_order.vw_to_k(&self.params, vw);
                let instr = if is_store {
                    KInstr::StoreIndexedElement(instr)
                } else {
                    KInstr::LoadIndexedElement(instr)
                };
                self.send_instruction_to_kamlet(k, instr);
                in_flight.push_back((element_index, el_ident));
                next_dispatch += 1;
            }
            let Some(&(element_index, el_ident)) = in_flight.front() else { break };
            self.run_until(|l| l.frontend.has_element_resp(el_ident))?;
            let resp = self.frontend.take_element_resp(el_ident).unwrap();
            assert_eq!(resp.element_index, element_index);
            in_flight.pop_front();
            let cycle = self.clock.cycle;
            if !result.success {
                // Draining elements dispatched before the fault was seen;
                // the aborted gate answers their queued requests.
                continue;
            }
            if resp.fault {
                self.frontend.gate_abort(op_ident, cycle);
                result = VectorOpResult::fault(element_index);
            } else {
                self.frontend.gate_advance(op_ident, element_index + 1, cycle);
            }
        }
        self.run_until_idle()?;
        self.frontend.gate_close(op_ident);
        Ok(result)
    }

    pub fn vload_indexed_ordered(
        &mut self,
        vd: usize,
        addr: u64,
        index_reg: usize,
        index_ew: usize,
        data_ew: usize,
        word_order: WordOrder,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        self.run_ordered(
            false, vd, addr, index_reg, index_ew, data_ew, word_order,
            n_elements, start_index, mask_reg,
        )
    }

    pub fn vstore_indexed_ordered(
        &mut self,
        vs: usize,
        addr: u64,
        index_reg: usize,
        index_ew: usize,
        data_ew: usize,
        word_order: WordOrder,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<VectorOpResult> {
        self.run_ordered(
            true, vs, addr, index_reg, index_ew, data_ew, word_order,
            n_elements, start_index, mask_reg,
        )
    }

    pub fn vrgather(
        &mut self,
        vd: usize,
        vs2: usize,
        vs1: usize,
        vlmax: usize,
        index_ew: usize,
        data_ew: usize,
        word_order: WordOrder,
        n_elements: usize,
        start_index: usize,
        mask_reg: Option<usize>,
    ) -> Result<()> {
        for (chunk_start, chunk_n) in self.vline_chunks(start_index, n_elements, data_ew) {
            let ident = self.next_instr_ident();
            self.send_instruction(KInstr::RegGather(RegGatherInstr {
                vd,
                vs2,
                vs1,
                start_index: chunk_start,
                n_elements: chunk_n,
                index_ew,
                data_ew,
                word_order,
                vlmax,
                mask_reg,
                instr_ident: ident,
            }));
            self.host_event(ident);
            self.run_until(|l| l.host_sync.is_complete(ident))?;
            self.run_until_idle()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn setup() -> Lamlet {
        Lamlet::new(&LamletParams::small(), 500_000).unwrap()
    }

    fn ordering32() -> Ordering {
        Ordering::new(WordOrder::Standard, 32)
    }

    fn word32(value: u32) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    fn alloc_vpu(l: &mut Lamlet, addr: u64, n_pages: usize) {
        l.allocate_memory(addr, n_pages * PAGE as usize, MemoryType::Vpu, Some(ordering32()));
    }

    fn alloc_non_idempotent(l: &mut Lamlet, addr: u64, n_pages: usize) {
        l.allocate_memory(addr, n_pages * PAGE as usize, MemoryType::ScalarNonIdempotent, None);
    }

    #[test]
    fn test_strided_load_vpu() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 4);
        let values = [0x11u32, 0x22, 0x33, 0x44];
        for (i, v) in values.iter().enumerate() {
            l.set_memory(i as u64 * 16, &word32(*v)).unwrap();
        }
        let result = l.vload_strided(0, 0, 16, ordering32(), 8, 0, None).unwrap();
        assert!(result.success);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(l.read_vreg_element(0, i, ordering32()), word32(*v), "element {i}");
        }
        // Uninitialized strided slots read back as zero DRAM.
        for i in 4..8 {
            assert_eq!(l.read_vreg_element(0, i, ordering32()), word32(0), "element {i}");
        }
    }

    #[test]
    fn test_strided_store_fault_atomicity() {
        // Elements 0..3 target a non-idempotent scalar page; elements 4..7
        // land on an unallocated page and fault. The store must report the
        // first faulting element, write the pre-fault elements exactly
        // once, and leave everything past the fault untouched.
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        let values = [0xa1u32, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8];
        for (i, v) in values.iter().enumerate() {
            l.write_vreg_element(0, i, ordering32(), &word32(*v));
        }
        let result = l.vstore_strided(0, 0, 1024, ordering32(), 8, 0, None).unwrap();
        assert!(!result.success);
        assert_eq!(result.element_index, Some(4));
        for i in 0..4u64 {
            assert_eq!(l.get_memory(i * 1024, 4).unwrap(), word32(values[i as usize]));
        }
        let log = &l.frontend.non_idempotent_access_log;
        assert_eq!(log.len(), 4, "each pre-fault element written exactly once: {log:?}");
        let mut addrs: Vec<u64> = log.iter().map(|a| a.addr).collect();
        addrs.sort();
        assert_eq!(addrs, vec![0, 1024, 2048, 3072]);
        assert!(log.iter().all(|a| a.is_write));
    }

    #[test]
    fn test_indexed_gather_repeated_index() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        let (w0, w1, w2) = (0xd00d_0001u32, 0xd00d_0002, 0xd00d_0003);
        l.set_memory(64, &word32(w0)).unwrap();
        l.set_memory(8, &word32(w1)).unwrap();
        l.set_memory(200, &word32(w2)).unwrap();
        for (i, index) in [64u32, 8, 200, 64].iter().enumerate() {
            l.write_vreg_element(4, i, ordering32(), &word32(*index));
        }
        let result = l.vload_indexed(0, 0, 4, 32, ordering32(), 4, 0, None).unwrap();
        assert!(result.success);
        let expect = [w0, w1, w2, w0];
        for (i, v) in expect.iter().enumerate() {
            assert_eq!(l.read_vreg_element(0, i, ordering32()), word32(*v), "element {i}");
        }
    }

    #[test]
    fn test_ordered_scatter_access_order() {
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        let values = [0xaa11_0000u32, 0xbb22_0000, 0xcc33_0000];
        let indices = [0u32, 8, 16];
        for i in 0..3 {
            l.write_vreg_element(0, i, ordering32(), &word32(values[i]));
            l.write_vreg_element(4, i, ordering32(), &word32(indices[i]));
        }
        let result = l
            .vstore_indexed_ordered(0, 0, 4, 32, 32, WordOrder::Standard, 3, 0, None)
            .unwrap();
        assert!(result.success);
        let log = &l.frontend.non_idempotent_access_log;
        let writes: Vec<(u64, usize)> = log.iter().map(|a| (a.addr, a.n_bytes)).collect();
        assert_eq!(writes, vec![(0, 4), (8, 4), (16, 4)], "writes in element order");
        for i in 0..3u64 {
            assert_eq!(l.get_memory(indices[i as usize] as u64, 4).unwrap(), word32(values[i as usize]));
        }
    }

    #[test]
    fn test_ordered_gather_access_order() {
        // Reads from a non-idempotent page must follow element-index
        // order even when the indexed addresses are not ascending.
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        let seed = [0x71u32, 0x72, 0x73, 0x74];
        for (i, v) in seed.iter().enumerate() {
            l.set_memory(i as u64 * 8, &word32(*v)).unwrap();
        }
        let indices = [24u32, 0, 8];
        for (i, index) in indices.iter().enumerate() {
            l.write_vreg_element(4, i, ordering32(), &word32(*index));
        }
        let result = l
            .vload_indexed_ordered(0, 0, 4, 32, 32, WordOrder::Standard, 3, 0, None)
            .unwrap();
        assert!(result.success);
        let reads: Vec<u64> = l
            .frontend
            .non_idempotent_access_log
            .iter()
            .filter(|a| !a.is_write)
            .map(|a| a.addr)
            .collect();
        assert_eq!(reads, vec![24, 0, 8], "reads in element order");
        assert_eq!(l.read_vreg_element(0, 0, ordering32()), word32(seed[3]));
        assert_eq!(l.read_vreg_element(0, 1, ordering32()), word32(seed[0]));
        assert_eq!(l.read_vreg_element(0, 2, ordering32()), word32(seed[1]));
    }

    #[test]
    fn test_ordered_gate_holds_younger_elements() {
        // With the dispatch window open, the second element's request
        // reaches the front-end while the first is still outstanding and
        // must wait at the gate; the access order stays element order even
        // though element 1 lives on the farther kamlet.
        let mut l = setup();
        assert!(l.params.receive_buffer_depth >= 2);
        alloc_non_idempotent(&mut l, 0, 1);
        let seed = [0x31u32, 0x32, 0x33, 0x34];
        for (i, v) in seed.iter().enumerate() {
            l.set_memory(i as u64 * 8, &word32(*v)).unwrap();
        }
        // Back-to-back dispatch puts element 1's request at the front-end
        // before element 0's response has retired it.
        let indices = [16u32, 8, 0, 24];
        for (i, index) in indices.iter().enumerate() {
            l.write_vreg_element(4, i, ordering32(), &word32(*index));
        }
        let result = l
            .vload_indexed_ordered(0, 0, 4, 32, 32, WordOrder::Standard, 4, 0, None)
            .unwrap();
        assert!(result.success);
        let reads: Vec<u64> = l
            .frontend
            .non_idempotent_access_log
            .iter()
            .filter(|a| !a.is_write)
            .map(|a| a.addr)
            .collect();
        assert_eq!(reads, vec![16, 8, 0, 24], "reads retire in element order");
        for (i, index) in indices.iter().enumerate() {
            assert_eq!(
                l.read_vreg_element(0, i, ordering32()),
                word32(seed[(*index / 8) as usize]),
                "element {i}"
            );
        }
    }

    #[test]
    fn test_masked_gather() {
        // Odd elements are masked off: no memory access, no fault, and the
        // destination lanes keep their prior (zero) value.
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        let values = [0x10u32, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];
        for (i, v) in values.iter().enumerate() {
            l.set_memory(i as u64 * 16, &word32(*v)).unwrap();
        }
        let bits: Vec<bool> = (0..8).map(|i| i % 2 == 0).collect();
        l.write_mask_register(8, WordOrder::Standard, &bits);
        l.zero_vreg(0, 2);
        let result = l.vload_strided(0, 0, 16, ordering32(), 8, 0, Some(8)).unwrap();
        assert!(result.success);
        for i in 0..8 {
            let expect = if i % 2 == 0 { values[i] } else { 0 };
            assert_eq!(l.read_vreg_element(0, i, ordering32()), word32(expect), "element {i}");
        }
        let mut reads: Vec<u64> =
            l.frontend.non_idempotent_access_log.iter().map(|a| a.addr).collect();
        reads.sort();
        assert_eq!(reads, vec![0, 32, 64, 96], "only active elements touch memory");
    }

    #[test]
    fn test_masked_fault_not_taken() {
        // A masked element aimed at an unallocated page must not fault.
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        for (i, v) in [0x1u32, 0x2, 0x3, 0x4].iter().enumerate() {
            l.write_vreg_element(0, i, ordering32(), &word32(*v));
        }
        // Element 2 would land at 2 * 4096 (unallocated) but is masked.
        let bits = vec![true, true, false, true];
        l.write_mask_register(8, WordOrder::Standard, &bits);
        let result = l.vstore_strided(0, 0, 2048, ordering32(), 4, 0, Some(8)).unwrap();
        assert!(!result.success, "element 3 still faults at 3 * 2048 in page 1");
        assert_eq!(result.element_index, Some(3));
        let log = &l.frontend.non_idempotent_access_log;
        let mut addrs: Vec<u64> = log.iter().map(|a| a.addr).collect();
        addrs.sort();
        assert_eq!(addrs, vec![0, 2048]);
    }

    #[test]
    fn test_unit_stride_round_trip() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        alloc_vpu(&mut l, PAGE, 1);
        let src: Vec<u8> = (0u8..32).collect();
        l.set_memory(0, &src).unwrap();
        let result = l.vload_unit(0, 0, ordering32(), 8, 0, None).unwrap();
        assert!(result.success);
        for i in 0..8 {
            assert_eq!(
                l.read_vreg_element(0, i, ordering32()),
                src[i * 4..(i + 1) * 4],
                "element {i}"
            );
        }
        let result = l.vstore_unit(0, PAGE, ordering32(), 8, 0, None).unwrap();
        assert!(result.success);
        assert_eq!(l.get_memory(PAGE, 32).unwrap(), src);
    }

    #[test]
    fn test_unit_stride_unaligned_base() {
        // A base halfway into a vline exercises the cross-jamlet word
        // transfers in both directions.
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        alloc_vpu(&mut l, PAGE, 1);
        let src: Vec<u8> = (0x40u8..0x60).collect();
        l.set_memory(0, &src).unwrap();
        let result = l.vload_unit(0, 8, ordering32(), 4, 0, None).unwrap();
        assert!(result.success);
        for i in 0..4 {
            assert_eq!(
                l.read_vreg_element(0, i, ordering32()),
                src[8 + i * 4..8 + (i + 1) * 4],
                "element {i}"
            );
        }
        let result = l.vstore_unit(0, PAGE + 8, ordering32(), 4, 0, None).unwrap();
        assert!(result.success);
        assert_eq!(l.get_memory(PAGE + 8, 16).unwrap(), src[8..24]);
    }

    #[test]
    fn test_masked_unit_store_preserves_memory() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        let old: Vec<u8> = vec![0xee; 32];
        l.set_memory(0, &old).unwrap();
        for i in 0..8 {
            l.write_vreg_element(0, i, ordering32(), &word32(0x1000 + i as u32));
        }
        let bits: Vec<bool> = (0..8).map(|i| i % 2 == 0).collect();
        l.write_mask_register(8, WordOrder::Standard, &bits);
        let result = l.vstore_unit(0, 0, ordering32(), 8, 0, Some(8)).unwrap();
        assert!(result.success);
        let out = l.get_memory(0, 32).unwrap();
        for i in 0..8 {
            let got = &out[i * 4..(i + 1) * 4];
            if i % 2 == 0 {
                assert_eq!(got, word32(0x1000 + i as u32), "element {i} written");
            } else {
                assert_eq!(got, vec![0xee; 4], "element {i} preserved");
            }
        }
    }

    #[test]
    fn test_vrgather_with_out_of_range() {
        let mut l = setup();
        for e in 0..8 {
            l.write_vreg_element(0, e, ordering32(), &word32((e as u32 + 1) * 0x10));
        }
        let indices = [3u32, 7, 0, 9, 1, 2, 5, 8];
        for (i, index) in indices.iter().enumerate() {
            l.write_vreg_element(4, i, ordering32(), &word32(*index));
        }
        l.vrgather(8, 0, 4, 8, 32, 32, WordOrder::Standard, 8, 0, None).unwrap();
        let expect = [0x40u32, 0x80, 0x10, 0, 0x20, 0x30, 0x60, 0];
        for (i, v) in expect.iter().enumerate() {
            assert_eq!(l.read_vreg_element(8, i, ordering32()), word32(*v), "element {i}");
        }
    }

    #[test]
    fn test_scatter_into_vpu_pages() {
        // Cross-kamlet WRITE_MEM_WORD traffic: strided store where targets
        // live in VPU memory owned by both kamlets.
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        let values = [0x91u32, 0x92, 0x93, 0x94];
        for (i, v) in values.iter().enumerate() {
            l.write_vreg_element(0, i, ordering32(), &word32(*v));
        }
        let result = l.vstore_strided(0, 0, 12, ordering32(), 4, 0, None).unwrap();
        assert!(result.success);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(l.get_memory(i as u64 * 12, 4).unwrap(), word32(*v), "element {i}");
        }
    }

    #[test]
    fn test_determinism() {
        fn run_once() -> (u64, Vec<u8>, u64, usize) {
            let mut l = setup();
            alloc_vpu(&mut l, 0, 1);
            alloc_vpu(&mut l, PAGE, 1);
            let src: Vec<u8> = (0u8..32).map(|b| b.wrapping_mul(7)).collect();
            l.set_memory(0, &src).unwrap();
            l.vload_strided(0, 0, 8, ordering32(), 4, 0, None).unwrap();
            l.vstore_strided(0, PAGE, 8, ordering32(), 4, 0, None).unwrap();
            let mem = l.get_memory(PAGE, 32).unwrap();
            (l.clock.cycle, mem, l.monitor.messages_sent, l.monitor.n_events())
        }
        let a = run_once();
        let b = run_once();
        assert_eq!(a, b, "two runs with identical inputs must be identical");
    }

    #[test]
    fn test_load_store_round_trip_strided() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        alloc_vpu(&mut l, PAGE, 1);
        let values: Vec<u32> = (0..8).map(|i| 0xfeed_0000 + i).collect();
        for (i, v) in values.iter().enumerate() {
            l.set_memory(i as u64 * 16, &word32(*v)).unwrap();
        }
        let load = l.vload_strided(0, 0, 16, ordering32(), 8, 0, None).unwrap();
        assert!(load.success);
        let store = l.vstore_strided(0, PAGE, 20, ordering32(), 8, 0, None).unwrap();
        assert!(store.success);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(l.get_memory(PAGE + i as u64 * 20, 4).unwrap(), word32(*v), "element {i}");
        }
    }

    #[test]
    fn test_strided_load_fault_reports_min_element() {
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        let result = l.vload_strided(0, 0, 1024, ordering32(), 8, 0, None).unwrap();
        assert!(!result.success);
        assert_eq!(result.element_index, Some(4), "first element in the unallocated page");
        // No non-idempotent read past the fault was delivered.
        assert!(l
            .frontend
            .non_idempotent_access_log
            .iter()
            .all(|a| a.addr < 4096));
    }

    #[test]
    fn test_mixed_page_gather() {
        // Indices alternating between VPU and scalar pages in one gather.
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        l.allocate_memory(PAGE, PAGE as usize, MemoryType::ScalarIdempotent, None);
        l.set_memory(16, &word32(0x5001)).unwrap();
        l.set_memory(PAGE + 24, &word32(0x5002)).unwrap();
        l.set_memory(40, &word32(0x5003)).unwrap();
        l.set_memory(PAGE + 48, &word32(0x5004)).unwrap();
        let indices = [16u32, 4096 + 24, 40, 4096 + 48];
        for (i, index) in indices.iter().enumerate() {
            l.write_vreg_element(4, i, ordering32(), &word32(*index));
        }
        let result = l.vload_indexed(0, 0, 4, 32, ordering32(), 4, 0, None).unwrap();
        assert!(result.success);
        let expect = [0x5001u32, 0x5002, 0x5003, 0x5004];
        for (i, v) in expect.iter().enumerate() {
            assert_eq!(l.read_vreg_element(0, i, ordering32()), word32(*v), "element {i}");
        }
    }

    #[test]
    fn test_eviction_write_back_round_trip() {
        // Touch more lines than the cache holds so dirty victims are
        // written back to DRAM and refetched on the way back in.
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        let n_lines = l.params.n_cache_slots() + 4;
        for i in 0..n_lines {
            let value = word32(0xcafe_0000 + i as u32);
            l.set_memory(i as u64 * 128, &value).unwrap();
        }
        for i in 0..n_lines {
            assert_eq!(
                l.get_memory(i as u64 * 128, 4).unwrap(),
                word32(0xcafe_0000 + i as u32),
                "line {i}"
            );
        }
    }

    #[test]
    fn test_zero_lines_without_fetch() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        // One kamlet cache line per kamlet covers 128 global bytes here.
        let pattern: Vec<u8> = (0u8..128).collect();
        l.set_memory(0, &pattern).unwrap();
        l.zero_lines(0, 1).unwrap();
        assert_eq!(l.get_memory(0, 128).unwrap(), vec![0u8; 128]);
    }

    #[test]
    fn test_discard_lines_drops_dirty_data() {
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        let pattern: Vec<u8> = (0u8..128).map(|b| b | 0x80).collect();
        l.set_memory(0, &pattern).unwrap();
        // The dirty line is discarded before any eviction, so the data
        // never reaches DRAM and reads come back as zero.
        l.discard_lines(0, 1).unwrap();
        assert_eq!(l.get_memory(0, 128).unwrap(), vec![0u8; 128]);
    }

    #[test]
    fn test_unit_stride_reversed_register_order() {
        // Memory keeps the standard order; the register group uses the
        // mirrored one, so every element crosses to the other kamlet.
        let mut l = setup();
        alloc_vpu(&mut l, 0, 1);
        let src: Vec<u8> = (0xa0u8..0xc0).collect();
        l.set_memory(0, &src).unwrap();
        let reversed = Ordering::new(WordOrder::Reversed, 32);
        let result = l.vload_unit(0, 0, reversed, 8, 0, None).unwrap();
        assert!(result.success);
        for i in 0..8 {
            assert_eq!(
                l.read_vreg_element(0, i, reversed),
                src[i * 4..(i + 1) * 4],
                "element {i}"
            );
        }
    }

    #[test]
    fn test_ordered_load_fault_stops_dispatch() {
        let mut l = setup();
        alloc_non_idempotent(&mut l, 0, 1);
        // Element 1's index points into the unallocated second page.
        let indices = [0u32, 8192, 8];
        for (i, index) in indices.iter().enumerate() {
            l.write_vreg_element(4, i, ordering32(), &word32(*index));
        }
        let result = l
            .vload_indexed_ordered(0, 0, 4, 32, 32, WordOrder::Standard, 3, 0, None)
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.element_index, Some(1));
        // Only element 0 reached memory.
        let reads: Vec<u64> = l
            .frontend
            .non_idempotent_access_log
            .iter()
            .map(|a| a.addr)
            .collect();
        assert_eq!(reads, vec![0]);
    }
}
