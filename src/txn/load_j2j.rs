//! Unaligned vector loads via jamlet-to-jamlet word transfer.
//!
//! Used when a load is not vline-aligned or the register word order differs
//! from the memory word order. The kamlet fetches the cache line, then each
//! source jamlet pushes the words holding its byte lane to the destination
//! jamlet, which shifts them into its register slice. A destination with no
//! matching waiting item answers DROP and the source re-sends.

use crate::addresses;
use crate::kamlet::{KamletBody, StepCtx};
use crate::kinstr::{KInstr, LoadInstr};
use crate::message::{Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::txn::mapping::{mappings_from_mem, mappings_from_reg};
use crate::witem::{ReceiveState, SendState, Witem, WitemCore, WitemTable};

/// Paired per-tag protocol state: this kamlet's jamlet as data source and
/// as register destination.
#[derive(Debug, Clone, Copy)]
pub struct J2JState {
    pub src: SendState,
    pub dst: ReceiveState,
}

impl J2JState {
    pub fn finished(&self) -> bool {
        self.src == SendState::Complete && self.dst == ReceiveState::Complete
    }
}

pub struct WaitingLoadJ2J {
    pub core: WitemCore,
    pub instr: LoadInstr,
    pub states: Vec<J2JState>,
}

fn reg_sets(body: &KamletBody, instr: &LoadInstr) -> (Vec<usize>, Vec<usize>) {
    let dst_regs =
        body.regs_for(instr.dst, instr.start_index, instr.n_elements, instr.dst_ordering.ew);
    let read_regs = instr.mask_reg.map(|m| vec![m]).unwrap_or_default();
    (read_regs, dst_regs)
}

pub fn dispatch(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: LoadInstr,
    ctx: &mut StepCtx,
) -> Option<KInstr> {
    let (read_regs, dst_regs) = reg_sets(body, &instr);
    if !body.rf.is_available(&read_regs, &dst_regs) {
        return Some(KInstr::Load(instr));
    }
    let rf_ident = body.rf.start(&read_regs, &dst_regs);
    let params = &body.params;
    let wb = params.word_bytes;
    let mut states =
        vec![J2JState { src: SendState::Complete, dst: ReceiveState::Complete }; params.j_in_k() * wb];
    for j in 0..params.j_in_k() {
        let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
        for tag in 0..wb {
            let src_mappings = mappings_from_mem(
                params, &instr.k_maddr, instr.dst_ordering,
                instr.start_index, instr.n_elements, tag * 8, x, y,
            );
            let dst_mappings = mappings_from_reg(
                params, &instr.k_maddr, instr.dst_ordering,
                instr.start_index, instr.n_elements, tag * 8, x, y,
            );
            states[j * wb + tag] = J2JState {
                src: if src_mappings.is_empty() {
                    SendState::Complete
                } else {
                    SendState::NeedToSend
                },
                dst: if dst_mappings.is_empty() {
                    ReceiveState::Complete
                } else {
                    ReceiveState::WaitingForRequest
                },
            };
        }
    }
    let mut core = WitemCore::new(instr.instr_ident, instr.writeset_ident, Some(rf_ident));
    core.line_addr = Some(instr.k_maddr.line_addr(params));
    ctx.monitor.record_witem_created(ctx.cycle, instr.instr_ident, "WaitingLoadJ2J");
    witems.add(Witem::LoadJ2J(WaitingLoadJ2J { core, instr, states }));
    None
}

pub fn monitor_jamlet(w: &mut WaitingLoadJ2J, body: &mut KamletBody, j: usize, ctx: &mut StepCtx) {
    if !w.core.cache_is_avail {
        return;
    }
    let wb = body.params.word_bytes;
    for tag in 0..wb {
        if w.states[j * wb + tag].src == SendState::NeedToSend && send_req(w, body, j, tag, ctx) {
            w.states[j * wb + tag].src = SendState::WaitingForResponse;
        }
    }
}

fn send_req(w: &WaitingLoadJ2J, body: &mut KamletBody, j: usize, tag: usize, ctx: &mut StepCtx) -> bool {
    let params = body.params.clone();
    let instr = &w.instr;
    let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
    let mappings = mappings_from_mem(
        &params, &instr.k_maddr, instr.dst_ordering,
        instr.start_index, instr.n_elements, tag * 8, x, y,
    );
    assert!(!mappings.is_empty());
    if !body.jamlets[j].can_send(MessageType::LoadJ2JWordsReq) {
        return false;
    }
    let slot = w.core.cache_slot.expect("sending before a slot was assigned");
    let cache_base = slot * params.line_bytes_per_jamlet();
    let reg_vw = mappings[0].reg_vw;
    let mut words = Vec::new();
    for mapping in &mappings {
        assert_eq!(mapping.reg_vw, reg_vw);
        let vline_offset = (mapping.mem_v % params.vlines_in_cache_line() as u64) as usize;
        let addr = cache_base + vline_offset * params.word_bytes;
        words.push(body.jamlets[j].sram[addr..addr + params.word_bytes].to_vec());
    }
    let (target_x, target_y) =
        addresses::vw_index_to_j_coords(&params, instr.dst_ordering.word_order, reg_vw);
    let header = Header {
        message_type: MessageType::LoadJ2JWordsReq,
        send_type: SendType::Single,
        length: 1 + words.len(),
        source_x: x,
        source_y: y,
        target_x,
        target_y,
        ident: instr.instr_ident,
        ext: HeaderExt::Tagged { tag, mask: 0 },
    };
    ctx.monitor.create_transaction(
        ctx.cycle, "LoadJ2JWords", instr.instr_ident, tag, (x, y), (target_x, target_y),
    );
    let payload = words.into_iter().map(Flit::Data).collect();
    body.jamlets[j].send_packet(Packet::new(header, payload), ctx);
    true
}

pub fn handle_req(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let header = &packet.header;
    let at = (body.jamlets[j].x, body.jamlets[j].y);
    let Some(witem) = witems.find(header.ident) else {
        let drop = tagged_reply(MessageType::LoadJ2JWordsDrop, header, at);
        body.jamlets[j].send_packet(Packet::header_only(drop), ctx);
        return;
    };
    let Witem::LoadJ2J(w) = witem else {
        panic!("ident {} matched a different waiting-item kind", header.ident);
    };
    let params = body.params.clone();
    let instr = &w.instr;
    let wb = params.word_bytes;
    let mappings = mappings_from_mem(
        &params, &instr.k_maddr, instr.dst_ordering,
        instr.start_index, instr.n_elements,
        header.tag() * 8, header.source_x, header.source_y,
    );
    assert_eq!(mappings.len(), packet.payload.len());
    let epv = params.elements_in_vline(instr.dst_ordering.ew);
    let eb = instr.dst_ordering.eb();
    let reg_wb = mappings[0].reg_wb;
    for (flit, mapping) in packet.payload.iter().zip(&mappings) {
        assert_eq!(mapping.reg_wb, reg_wb);
        let word = flit.as_data();
        let reg_ve = (mapping.reg_wb / 8 / eb) * params.j_in_l() + mapping.reg_vw;
        let element = mapping.reg_v as usize * epv + reg_ve;
        if let Some(mask_reg) = instr.mask_reg {
            if !body.jamlets[j].mask_bit(&params, mask_reg, element) {
                continue;
            }
        }
        let dst_reg = instr.dst + mapping.reg_v as usize;
        body.jamlets[j].rf_update_word(
            &params, dst_reg, word, mapping.mem_wb / 8, mapping.reg_wb / 8, 1,
        );
        debug!(
            "{}: jamlet ({}, {}): load J2J wrote reg {dst_reg} byte {} element {element}",
            ctx.cycle, at.0, at.1, mapping.reg_wb / 8
        );
    }
    let response_tag = j * wb + reg_wb / 8;
    assert_eq!(w.states[response_tag].dst, ReceiveState::WaitingForRequest);
    w.states[response_tag].dst = ReceiveState::Complete;
    let resp = tagged_reply(MessageType::LoadJ2JWordsResp, header, at);
    body.jamlets[j].send_packet(Packet::header_only(resp), ctx);
}

fn tagged_reply(message_type: MessageType, rcvd: &Header, at: (i32, i32)) -> Header {
    Header {
        message_type,
        send_type: SendType::Single,
        length: 1,
        source_x: at.0,
        source_y: at.1,
        target_x: rcvd.source_x,
        target_y: rcvd.source_y,
        ident: rcvd.ident,
        ext: HeaderExt::Tagged { tag: rcvd.tag(), mask: 0 },
    }
}

pub fn handle_resp(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let witem = witems.find(packet.header.ident).expect("J2J response with no waiting item");
    witem.process_response(body, j, packet, ctx);
}

pub fn handle_drop(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let witem = witems.find(packet.header.ident).expect("J2J drop with no waiting item");
    witem.process_drop(body, j, packet, ctx);
}

pub fn process_response(
    w: &mut WaitingLoadJ2J,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    let response_tag = j * body.params.word_bytes + packet.header.tag();
    assert_eq!(w.states[response_tag].src, SendState::WaitingForResponse);
    w.states[response_tag].src = SendState::Complete;
}

pub fn process_drop(
    w: &mut WaitingLoadJ2J,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    let response_tag = j * body.params.word_bytes + packet.header.tag();
    assert_eq!(w.states[response_tag].src, SendState::WaitingForResponse);
    w.states[response_tag].src = SendState::NeedToSend;
}

pub fn ready(w: &WaitingLoadJ2J) -> bool {
    w.states.iter().all(|s| s.finished()) && w.core.cache_is_avail
}

pub fn finalize(w: &mut WaitingLoadJ2J, body: &mut KamletBody, _ctx: &mut StepCtx) {
    for state in &w.states {
        assert!(state.finished());
    }
    let (read_regs, dst_regs) = reg_sets(body, &w.instr);
    body.rf.finish(w.core.rf_ident.unwrap(), &read_regs, &dst_regs);
}
