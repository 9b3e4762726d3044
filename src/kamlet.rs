use crate::addresses::{KMAddr, Tlb};
use crate::cache::{CacheRequestKind, CacheTable};
use crate::jamlet::{Jamlet, PartialPacket};
use crate::kinstr::KInstr;
use crate::message::{
    Direction, Flit, Header, HeaderExt, MessageType, Packet, SendType,
};
use crate::monitor::Monitor;
use crate::params::LamletParams;
use crate::queue::Queue;
use crate::rf::KamletRegisterFile;
use crate::sync::Synchronizer;
use crate::txn;
use crate::utils;
use crate::witem::WitemTable;

/// Per-phase context threaded through the step functions: the lamlet owns
/// the clock value, TLB, and monitor.
pub struct StepCtx<'a> {
    pub cycle: u64,
    pub tlb: &'a Tlb,
    pub monitor: &'a mut Monitor,
}

/// Everything in a kamlet except the waiting-item table. Waiting-item hooks
/// borrow the body mutably while the item itself is lifted out of the table.
pub struct KamletBody {
    pub params: LamletParams,
    pub k_index: usize,
    pub min_x: i32,
    pub min_y: i32,
    pub jamlets: Vec<Jamlet>,
    pub cache: CacheTable,
    pub rf: KamletRegisterFile,
    pub synchronizer: Synchronizer,
}

impl KamletBody {
    /// Registers of a group covering elements `[start, start + n)` at `ew`.
    pub fn regs_for(&self, base_reg: usize, start_index: usize, n_elements: usize, ew: usize) -> Vec<usize> {
        if n_elements == 0 {
            return vec![base_reg];
        }
        let epv = self.params.elements_in_vline(ew);
        let first = start_index / epv;
        let last = (start_index + n_elements - 1) / epv;
        (first..=last).map(|v| base_reg + v).collect()
    }
}

const N_WITEMS: usize = 8;
const INSTR_BUFFER_DEPTH: usize = 4;

/// A compute tile: jamlets, one cache, one synchronizer, an instruction
/// buffer, and the live waiting items.
pub struct Kamlet {
    pub body: KamletBody,
    pub witems: WitemTable,
    pub instr_buffer: Queue<KInstr>,
    /// Instruction waiting for register-file hazards or a witem slot.
    stalled: Option<KInstr>,
}

impl Kamlet {
    pub fn new(params: &LamletParams, k_index: usize) -> Self {
        let k_x = k_index % params.k_cols;
        let k_y = k_index / params.k_cols;
        let min_x = (k_x * params.j_cols) as i32;
        let min_y = (k_y * params.j_rows) as i32;
        let mut jamlets = Vec::new();
        for j_in_k in 0..params.j_in_k() {
            let (x, y) = crate::addresses::k_indices_to_j_coords(params, k_index, j_in_k);
            jamlets.push(Jamlet::new(params, x, y));
        }
        Kamlet {
            body: KamletBody {
                params: params.clone(),
                k_index,
                min_x,
                min_y,
                jamlets,
                cache: CacheTable::new(params),
                rf: KamletRegisterFile::new(params.n_vregs),
                synchronizer: Synchronizer::new(params.k_cols, params.k_rows, k_x as i32, k_y as i32),
            },
            witems: WitemTable::new(N_WITEMS),
            instr_buffer: Queue::new(INSTR_BUFFER_DEPTH),
            stalled: None,
        }
    }

    /// No live work: an idle kamlet stays idle until a packet arrives.
    pub fn is_idle(&self) -> bool {
        self.witems.n_live() == 0 && self.instr_buffer.is_empty() && self.stalled.is_none()
    }

    /// One cycle: receive, coordinate the cache, dispatch an instruction,
    /// run the waiting-item hooks, then feed the send queues.
    pub fn step(&mut self, ctx: &mut StepCtx) {
        self.receive_phase(ctx);
        self.coordinator_phase(ctx);
        self.instruction_phase(ctx);
        self.monitor_phase(ctx);
        self.body.synchronizer.step(ctx.cycle, ctx.monitor);
        for jamlet in &mut self.body.jamlets {
            jamlet.step_send();
        }
    }

    pub fn step_routers(&mut self, cycle: u64) {
        for jamlet in &mut self.body.jamlets {
            for router in &mut jamlet.routers {
                router.step(cycle);
            }
        }
    }

    pub fn update(&mut self) {
        for jamlet in &mut self.body.jamlets {
            jamlet.update();
        }
        self.instr_buffer.update();
        self.body.synchronizer.update();
    }

    // --- receive ---

    /// The responses a request handler may need to emit synchronously; a
    /// request is only consumed once there is room for them, so channel-0
    /// traffic never depends on request-side progress.
    fn response_room(jamlet: &Jamlet, message_type: MessageType) -> bool {
        match message_type {
            MessageType::LoadJ2JWordsReq => {
                jamlet.can_send(MessageType::LoadJ2JWordsResp)
                    && jamlet.can_send(MessageType::LoadJ2JWordsDrop)
            }
            MessageType::StoreJ2JWordsReq => {
                jamlet.can_send(MessageType::StoreJ2JWordsResp)
                    && jamlet.can_send(MessageType::StoreJ2JWordsDrop)
            }
            MessageType::ReadMemWordReq => {
                jamlet.can_send(MessageType::ReadMemWordResp)
                    && jamlet.can_send(MessageType::ReadMemWordDrop)
            }
            MessageType::WriteMemWordReq => {
                jamlet.can_send(MessageType::WriteMemWordResp)
                    && jamlet.can_send(MessageType::WriteMemWordDrop)
            }
            MessageType::ReadRegElementReq => {
                jamlet.can_send(MessageType::ReadRegElementResp)
                    && jamlet.can_send(MessageType::ReadRegElementDrop)
            }
            _ => true,
        }
    }

    fn receive_phase(&mut self, ctx: &mut StepCtx) {
        let n_jamlets = self.body.jamlets.len();
        let n_channels = self.body.params.n_channels;
        for j in 0..n_jamlets {
            for channel in 0..n_channels {
                if let Some(packet) = self.consume_word(j, channel, ctx) {
                    self.dispatch_packet(j, packet, ctx);
                }
            }
        }
    }

    /// Consume at most one word from a jamlet's router host port, returning
    /// a packet once fully assembled.
    fn consume_word(&mut self, j: usize, channel: usize, ctx: &mut StepCtx) -> Option<Packet> {
        let jamlet = &mut self.body.jamlets[j];
        if jamlet.assembling[channel].is_none() {
            let header = match jamlet.routers[channel].output_head(Direction::H)? {
                Flit::Header(h) => h.clone(),
                other => panic!(
                    "jamlet ({}, {}) ch{channel}: stream starts with {other:?}",
                    jamlet.x, jamlet.y
                ),
            };
            assert_eq!(header.message_type.channel(), channel, "message on wrong channel");
            if channel != 0 && !Self::response_room(jamlet, header.message_type) {
                // Backpressure: leave the request in the router until the
                // response queues drain.
                return None;
            }
            jamlet.routers[channel].pop_output(Direction::H);
            ctx.monitor.record_message_received(
                ctx.cycle,
                header.message_type.name(),
                header.ident,
                (jamlet.x, jamlet.y),
            );
            debug!(
                "{}: jamlet ({}, {}): receiving {} from ({}, {})",
                ctx.cycle, jamlet.x, jamlet.y,
                header.message_type.name(), header.source_x, header.source_y
            );
            if header.length == 1 {
                return Some(Packet::header_only(header));
            }
            jamlet.assembling[channel] = Some(PartialPacket { header, payload: Vec::new() });
            return None;
        }

        let is_instr_stream = jamlet.assembling[channel]
            .as_ref()
            .map(|p| p.header.message_type == MessageType::Instructions)
            .unwrap_or(false);
        if !jamlet.routers[channel].has_output(Direction::H) {
            return None;
        }
        if is_instr_stream {
            // Instruction words feed the kamlet buffer directly, one per
            // cycle, under buffer backpressure.
            if !self.instr_buffer.can_append() {
                return None;
            }
            let word = self.body.jamlets[j].routers[channel].pop_output(Direction::H);
            let instr = match word {
                Flit::Instr(instr) => instr,
                other => panic!("instruction stream carries {other:?}"),
            };
            debug!("{}: kamlet {}: buffering {}", ctx.cycle, self.body.k_index, instr.name());
            self.instr_buffer.append(instr);
            let partial = self.body.jamlets[j].assembling[channel].as_mut().unwrap();
            partial.header.length -= 1;
            if partial.header.length == 1 {
                self.body.jamlets[j].assembling[channel] = None;
            }
            return None;
        }
        let jamlet = &mut self.body.jamlets[j];
        // The handler fires when the last word lands, so the response gate
        // is re-checked on the completing word, not just on the header.
        let partial = jamlet.assembling[channel].as_ref().unwrap();
        if channel != 0
            && partial.remaining() == 1
            && !Self::response_room(jamlet, partial.header.message_type)
        {
            return None;
        }
        let word = jamlet.routers[channel].pop_output(Direction::H);
        let partial = jamlet.assembling[channel].as_mut().unwrap();
        partial.payload.push(word);
        if partial.remaining() == 0 {
            let partial = jamlet.assembling[channel].take().unwrap();
            return Some(Packet::new(partial.header, partial.payload));
        }
        None
    }

    fn dispatch_packet(&mut self, j: usize, packet: Packet, ctx: &mut StepCtx) {
        let Kamlet { body, witems, .. } = self;
        match packet.header.message_type {
            MessageType::ReadLineResp | MessageType::WriteLineReadLineResp => {
                Self::handle_line_fill(body, j, &packet, ctx);
            }
            MessageType::WriteLineResp => {
                body.cache.receive_response(packet.header.ident as usize);
            }
            MessageType::WriteLineReadLineDrop => {
                body.cache.clear_sent(packet.header.ident as usize, j);
            }
            MessageType::Instructions => {
                // Fully consumed during assembly.
            }
            _ => txn::handle_packet(body, witems, j, &packet, ctx),
        }
    }

    fn handle_line_fill(body: &mut KamletBody, j: usize, packet: &Packet, ctx: &mut StepCtx) {
        let header = &packet.header;
        let sram_base = match header.ext {
            HeaderExt::Address { address } => address as usize,
            _ => panic!("line fill without an SRAM address"),
        };
        let wb = body.params.word_bytes;
        assert_eq!(packet.payload.len(), body.params.vlines_in_cache_line());
        let jamlet = &mut body.jamlets[j];
        for (index, flit) in packet.payload.iter().enumerate() {
            let word = flit.as_data();
            let sram_addr = sram_base + index * wb;
            debug!(
                "{}: jamlet ({}, {}): line fill sram[{}] = {:02x?}",
                ctx.cycle, jamlet.x, jamlet.y, sram_addr, word
            );
            jamlet.sram[sram_addr..sram_addr + wb].copy_from_slice(word);
        }
        body.cache.receive_response(header.ident as usize);
    }

    // --- cache coordination ---

    fn coordinator_phase(&mut self, ctx: &mut StepCtx) {
        let Kamlet { body, witems, .. } = self;
        if cfg!(debug_assertions) {
            body.cache.assert_consistent();
        }
        // Assign slots to waiting items that need a line, then refresh
        // availability.
        for index in witems.indices() {
            let witem = witems.get_mut(index).unwrap();
            let core = witem.core();
            let (Some(line_addr), writeset) = (core.line_addr, core.writeset_ident) else {
                continue;
            };
            if witem.core().cache_slot.is_none() {
                if let Some(slot) = body.cache.map_line(line_addr) {
                    // A slot never carries holders of two writesets at
                    // once; wait for a clashing holder to release before
                    // claiming it.
                    if !body.cache.held_by_other(slot, writeset) {
                        body.cache.acquire_slot(slot, writeset);
                        witem.core_mut().cache_slot = Some(slot);
                    }
                }
            }
            let core = witem.core();
            let avail = match core.cache_slot {
                Some(slot) => body.cache.slot_avail(slot, line_addr, writeset),
                None => false,
            };
            witem.core_mut().cache_is_avail = avail;
        }
        // Emit line request packets, one per jamlet per request, in ident
        // order so every jamlet serves a shared request before the next.
        for (ident, j) in body.cache.pending_sends() {
            let request = body.cache.request(ident);
            let kind = request.kind;
            let slot = request.slot;
            let read_addr = request.read_addr;
            let write_addr = request.write_addr;
            let message_type = match kind {
                CacheRequestKind::Read => MessageType::ReadLine,
                CacheRequestKind::WriteRead => MessageType::WriteLineReadLine,
                CacheRequestKind::Write => MessageType::WriteLine,
            };
            if !body.jamlets[j].can_send(message_type) {
                continue;
            }
            let packet = Self::line_request_packet(body, ident, j, kind, slot, read_addr, write_addr);
            body.jamlets[j].send_packet(packet, ctx);
            body.cache.mark_sent(ident, j);
        }
    }

    fn line_request_packet(
        body: &KamletBody,
        ident: usize,
        j: usize,
        kind: CacheRequestKind,
        slot: usize,
        read_addr: u64,
        write_addr: u64,
    ) -> Packet {
        let params = &body.params;
        let jamlet = &body.jamlets[j];
        let wb = params.word_bytes;
        let sram_base = slot * params.line_bytes_per_jamlet();
        let n_words = params.line_bytes_per_jamlet() / wb;
        let mut payload = Vec::new();
        match kind {
            CacheRequestKind::Read => {
                payload.push(Flit::Data(utils::u64_to_word(read_addr, wb)));
            }
            CacheRequestKind::WriteRead => {
                payload.push(Flit::Data(utils::u64_to_word(write_addr, wb)));
                payload.push(Flit::Data(utils::u64_to_word(read_addr, wb)));
            }
            CacheRequestKind::Write => {
                payload.push(Flit::Data(utils::u64_to_word(write_addr, wb)));
            }
        }
        if kind != CacheRequestKind::Read {
            for index in 0..n_words {
                let base = sram_base + index * wb;
                payload.push(Flit::Data(jamlet.sram[base..base + wb].to_vec()));
            }
        }
        let message_type = match kind {
            CacheRequestKind::Read => MessageType::ReadLine,
            CacheRequestKind::WriteRead => MessageType::WriteLineReadLine,
            CacheRequestKind::Write => MessageType::WriteLine,
        };
        let header = Header {
            message_type,
            send_type: SendType::Single,
            length: 1 + payload.len(),
            source_x: jamlet.x,
            source_y: jamlet.y,
            target_x: jamlet.mem_x,
            target_y: jamlet.mem_y,
            ident: ident as u32,
            ext: HeaderExt::Address { address: sram_base as u64 },
        };
        Packet::new(header, payload)
    }

    // --- instruction dispatch ---

    fn instruction_phase(&mut self, ctx: &mut StepCtx) {
        if self.stalled.is_none() && !self.instr_buffer.is_empty() {
            self.stalled = Some(self.instr_buffer.pop());
        }
        if let Some(instr) = self.stalled.take() {
            if let Some(instr) = self.try_dispatch(instr, ctx) {
                self.stalled = Some(instr);
            }
        }
    }

    /// Dispatch one instruction; hands it back when it must stall.
    fn try_dispatch(&mut self, instr: KInstr, ctx: &mut StepCtx) -> Option<KInstr> {
        let Kamlet { body, witems, .. } = self;
        if !witems.can_add() {
            return Some(instr);
        }
        match instr {
            KInstr::Load(instr) => txn::load_j2j::dispatch(body, witems, instr, ctx),
            KInstr::Store(instr) => txn::store_j2j::dispatch(body, witems, instr, ctx),
            KInstr::LoadStride(instr) => txn::gather::dispatch_strided(body, witems, instr, ctx),
            KInstr::StoreStride(instr) => txn::scatter::dispatch_strided(body, witems, instr, ctx),
            KInstr::LoadIndexed(instr) => txn::gather::dispatch_indexed(body, witems, instr, ctx),
            KInstr::StoreIndexed(instr) => txn::scatter::dispatch_indexed(body, witems, instr, ctx),
            KInstr::LoadIndexedElement(instr) => {
                txn::indexed_element::dispatch(body, witems, instr, false, ctx)
            }
            KInstr::StoreIndexedElement(instr) => {
                txn::indexed_element::dispatch(body, witems, instr, true, ctx)
            }
            KInstr::RegGather(instr) => txn::reg_gather::dispatch(body, witems, instr, ctx),
            KInstr::WriteImmBytes(instr) => txn::probes::dispatch_write_imm(body, witems, instr, ctx),
            KInstr::ReadBytes(instr) => txn::probes::dispatch_read_bytes(body, witems, instr, ctx),
            KInstr::ZeroLines(instr) => txn::probes::dispatch_zero_lines(body, witems, instr, ctx),
            KInstr::DiscardLines(instr) => {
                txn::probes::dispatch_discard_lines(body, witems, instr, ctx)
            }
        }
    }

    // --- waiting items ---

    fn monitor_phase(&mut self, ctx: &mut StepCtx) {
        let Kamlet { body, witems, .. } = self;
        for index in witems.indices() {
            let mut witem = witems.take(index);
            for j in 0..body.jamlets.len() {
                witem.monitor_jamlet(body, j, ctx);
            }
            witem.monitor_kamlet(body, ctx);
            if witem.ready() {
                debug!(
                    "{}: kamlet {}: finalizing {} ident={}",
                    ctx.cycle, body.k_index, witem.kind_name(), witem.core().instr_ident
                );
                witem.finalize(body, ctx);
            } else {
                witems.put_back(index, witem);
            }
        }
    }
}

/// Helpers shared by the transaction modules.
impl KamletBody {
    /// Word-aligned SRAM read for a foreign access to this kamlet's cache.
    pub fn cached_word(&mut self, km_addr: &KMAddr, slot: usize) -> Vec<u8> {
        let sram_addr = self.cache.sram_addr(slot, km_addr);
        let jamlet = &self.jamlets[km_addr.j_in_k_index];
        jamlet.sram_word(&self.params, sram_addr).to_vec()
    }
}
