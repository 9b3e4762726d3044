//! Cache-through probes and line management instructions.
//!
//! `WriteImmBytes`/`ReadBytes` are how the scalar front-end reaches VPU
//! memory coherently: they pull the line into the kamlet cache and touch it
//! there. `ZeroLines` creates dirty lines without fetching; `DiscardLines`
//! drops resident lines without write-back.

use std::collections::VecDeque;

use crate::addresses::KMAddr;
use crate::kamlet::{KamletBody, StepCtx};
use crate::kinstr::{KInstr, LinesInstr, ReadBytesInstr, WriteImmBytesInstr};
use crate::message::{Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::witem::{Witem, WitemCore, WitemTable};

/// Writeset for probe items; probes never run concurrently with vector ops
/// on the same lines.
const PROBE_WRITESET: u32 = u32::MAX;

pub struct WaitingWriteImmBytes {
    pub core: WitemCore,
    pub k_maddr: KMAddr,
    pub imm: Vec<u8>,
    pub done: bool,
}

pub struct WaitingReadBytes {
    pub core: WitemCore,
    pub k_maddr: KMAddr,
    pub size: usize,
    pub ident: u32,
    pub done: bool,
}

pub struct WaitingZeroLines {
    pub core: WitemCore,
    pub lines: VecDeque<u64>,
    pub done: bool,
}

pub struct WaitingDiscardLines {
    pub core: WitemCore,
    pub lines: VecDeque<u64>,
    pub done: bool,
}

pub fn dispatch_write_imm(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: WriteImmBytesInstr,
    _ctx: &mut StepCtx,
) -> Option<KInstr> {
    if instr.k_maddr.k_index != body.k_index {
        return None;
    }
    let line = instr.k_maddr.line_addr(&body.params);
    let end = instr.k_maddr.addr + instr.imm.len() as u64;
    assert!(end <= line + body.params.cache_line_bytes as u64, "probe write crosses a line");
    let mut core = WitemCore::new(0, PROBE_WRITESET, None);
    core.line_addr = Some(line);
    core.source = Some((0, -1));
    witems.add(Witem::WriteImmBytes(WaitingWriteImmBytes {
        core,
        k_maddr: instr.k_maddr,
        imm: instr.imm,
        done: false,
    }));
    None
}

pub fn dispatch_read_bytes(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: ReadBytesInstr,
    _ctx: &mut StepCtx,
) -> Option<KInstr> {
    if instr.k_maddr.k_index != body.k_index {
        return None;
    }
    let line = instr.k_maddr.line_addr(&body.params);
    let end = instr.k_maddr.addr + instr.size as u64;
    assert!(end <= line + body.params.cache_line_bytes as u64, "probe read crosses a line");
    let mut core = WitemCore::new(instr.instr_ident, PROBE_WRITESET, None);
    core.line_addr = Some(line);
    core.source = Some((0, -1));
    witems.add(Witem::ReadBytes(WaitingReadBytes {
        core,
        k_maddr: instr.k_maddr,
        size: instr.size,
        ident: instr.instr_ident,
        done: false,
    }));
    None
}

pub fn dispatch_zero_lines(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: LinesInstr,
    _ctx: &mut StepCtx,
) -> Option<KInstr> {
    if instr.k_maddr.k_index != body.k_index {
        return None;
    }
    let line = instr.k_maddr.line_addr(&body.params);
    let lines = (0..instr.n_cache_lines)
        .map(|i| line + (i * body.params.cache_line_bytes) as u64)
        .collect();
    let mut core = WitemCore::new(0, PROBE_WRITESET, None);
    core.source = Some((0, -1));
    witems.add(Witem::ZeroLines(WaitingZeroLines {
        core,
        lines,
        done: false,
    }));
    None
}

pub fn dispatch_discard_lines(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: LinesInstr,
    _ctx: &mut StepCtx,
) -> Option<KInstr> {
    if instr.k_maddr.k_index != body.k_index {
        return None;
    }
    let line = instr.k_maddr.line_addr(&body.params);
    let lines = (0..instr.n_cache_lines)
        .map(|i| line + (i * body.params.cache_line_bytes) as u64)
        .collect();
    let mut core = WitemCore::new(0, PROBE_WRITESET, None);
    core.source = Some((0, -1));
    witems.add(Witem::DiscardLines(WaitingDiscardLines {
        core,
        lines,
        done: false,
    }));
    None
}

/// Byte position of a kamlet-space address within a jamlet's slot.
fn byte_location(body: &KamletBody, slot: usize, addr: u64) -> (usize, usize) {
    let params = &body.params;
    let in_line = (addr % params.cache_line_bytes as u64) as usize;
    let vline_in_line = in_line / params.kamlet_vline_bytes();
    let j = (in_line % params.kamlet_vline_bytes()) / params.word_bytes;
    let sram_addr = slot * params.line_bytes_per_jamlet()
        + vline_in_line * params.word_bytes
        + (addr % params.word_bytes as u64) as usize;
    (j, sram_addr)
}

pub fn monitor_kamlet_write_imm(
    w: &mut WaitingWriteImmBytes,
    body: &mut KamletBody,
    ctx: &mut StepCtx,
) {
    if w.done || !w.core.cache_is_avail {
        return;
    }
    let slot = w.core.cache_slot.unwrap();
    for (i, byte) in w.imm.iter().enumerate() {
        let (j, sram_addr) = byte_location(body, slot, w.k_maddr.addr + i as u64);
        body.jamlets[j].sram[sram_addr] = *byte;
    }
    body.cache.mark_modified(slot);
    debug!(
        "{}: kamlet {}: probe wrote {} bytes at {:#x}",
        ctx.cycle, body.k_index, w.imm.len(), w.k_maddr.addr
    );
    w.done = true;
}

pub fn monitor_kamlet_read_bytes(
    w: &mut WaitingReadBytes,
    body: &mut KamletBody,
    ctx: &mut StepCtx,
) {
    if w.done || !w.core.cache_is_avail {
        return;
    }
    if !body.jamlets[0].can_send(MessageType::ReadBytesResp) {
        return;
    }
    let slot = w.core.cache_slot.unwrap();
    let mut bytes = Vec::with_capacity(w.size);
    for i in 0..w.size {
        let (j, sram_addr) = byte_location(body, slot, w.k_maddr.addr + i as u64);
        bytes.push(body.jamlets[j].sram[sram_addr]);
    }
    let wb = body.params.word_bytes;
    let mut payload = Vec::new();
    for chunk in bytes.chunks(wb) {
        let mut word = chunk.to_vec();
        word.resize(wb, 0);
        payload.push(Flit::Data(word));
    }
    let at = (body.jamlets[0].x, body.jamlets[0].y);
    let header = Header {
        message_type: MessageType::ReadBytesResp,
        send_type: SendType::Single,
        length: 1 + payload.len(),
        source_x: at.0,
        source_y: at.1,
        target_x: 0,
        target_y: -1,
        ident: w.ident,
        ext: HeaderExt::Plain,
    };
    body.jamlets[0].send_packet(Packet::new(header, payload), ctx);
    w.done = true;
}

pub fn monitor_kamlet_zero_lines(
    w: &mut WaitingZeroLines,
    body: &mut KamletBody,
    _ctx: &mut StepCtx,
) {
    while let Some(&line) = w.lines.front() {
        let Some(slot) = body.cache.map_line_without_fetch(line) else {
            // A dirty victim is draining; retry next cycle.
            return;
        };
        let lbpj = body.params.line_bytes_per_jamlet();
        for jamlet in &mut body.jamlets {
            jamlet.sram[slot * lbpj..(slot + 1) * lbpj].fill(0);
        }
        w.lines.pop_front();
    }
    w.done = true;
}

pub fn monitor_kamlet_discard_lines(
    w: &mut WaitingDiscardLines,
    body: &mut KamletBody,
    _ctx: &mut StepCtx,
) {
    while let Some(&line) = w.lines.front() {
        if !body.cache.discard_line(line) {
            return;
        }
        w.lines.pop_front();
    }
    w.done = true;
}
