//! Vector register gather: `vd[i] = vs1[i] >= vlmax ? 0 : vs2[vs1[i]]`.
//!
//! Register-to-register gather across jamlets. Same-jamlet elements copy
//! locally; remote elements fetch via READ_REG_ELEMENT_REQ with responses
//! on channel 0. A responder whose own gather item has not been created yet
//! answers DROP, which also keeps the read ordered behind its register
//! hazards. Completion is gated by a barrier on the instruction ident.

use crate::addresses::{self, Ordering};
use crate::kamlet::{KamletBody, StepCtx};
use crate::kinstr::{KInstr, RegGatherInstr};
use crate::message::{Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::txn::common::compute_element;
use crate::utils;
use crate::witem::{SendState, Witem, WitemCore, WitemSyncState, WitemTable};

pub struct WaitingRegGather {
    pub core: WitemCore,
    pub instr: RegGatherInstr,
    pub states: Vec<SendState>,
    pub completion_sync: WitemSyncState,
}

fn reg_sets(body: &KamletBody, instr: &RegGatherInstr) -> (Vec<usize>, Vec<usize>) {
    let dst_regs = body.regs_for(instr.vd, instr.start_index, instr.n_elements, instr.data_ew);
    let vs1_regs = body.regs_for(instr.vs1, instr.start_index, instr.n_elements, instr.index_ew);
    let vs2_regs = body.regs_for(instr.vs2, 0, instr.vlmax, instr.data_ew);
    let mut read_regs: Vec<usize> = vs1_regs;
    for reg in vs2_regs {
        if !read_regs.contains(&reg) {
            read_regs.push(reg);
        }
    }
    for dst in &dst_regs {
        assert!(!read_regs.contains(dst), "vd overlaps vs1/vs2");
    }
    if let Some(mask_reg) = instr.mask_reg {
        assert!(!dst_regs.contains(&mask_reg));
        read_regs.push(mask_reg);
    }
    (read_regs, dst_regs)
}

pub fn dispatch(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: RegGatherInstr,
    ctx: &mut StepCtx,
) -> Option<KInstr> {
    let (read_regs, dst_regs) = reg_sets(body, &instr);
    if !body.rf.is_available(&read_regs, &dst_regs) {
        return Some(KInstr::RegGather(instr));
    }
    let rf_ident = body.rf.start(&read_regs, &dst_regs);
    let n_tags = body.params.j_in_k() * body.params.word_bytes;
    ctx.monitor.record_witem_created(ctx.cycle, instr.instr_ident, "WaitingRegGather");
    let core = WitemCore::new(instr.instr_ident, instr.instr_ident, Some(rf_ident));
    witems.add(Witem::RegGather(WaitingRegGather {
        core,
        instr,
        states: vec![SendState::Initial; n_tags],
        completion_sync: WitemSyncState::NotStarted,
    }));
    None
}

/// Where `vs2[index]` lives: jamlet coords, register, and byte offset.
fn src_location(
    body: &KamletBody,
    instr: &RegGatherInstr,
    index: usize,
) -> ((i32, i32), usize, usize) {
    let params = &body.params;
    let eb = instr.data_ew / 8;
    let epv = params.elements_in_vline(instr.data_ew);
    let src_v = index / epv;
    let src_ve = index % epv;
    let src_vw = src_ve % params.j_in_l();
    let src_we = src_ve / params.j_in_l();
    let coords = addresses::vw_index_to_j_coords(params, instr.word_order, src_vw);
    (coords, instr.vs2 + src_v, src_we * eb)
}

pub fn monitor_jamlet(w: &mut WaitingRegGather, body: &mut KamletBody, j: usize, ctx: &mut StepCtx) {
    let params = body.params.clone();
    let wb = params.word_bytes;
    let instr = w.instr.clone();
    let eb = instr.data_ew / 8;
    let ordering = Ordering::new(instr.word_order, instr.data_ew);
    for tag in 0..wb {
        let state_idx = j * wb + tag;
        let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
        let pos = compute_element(&params, ordering, instr.start_index, tag, x, y);
        match w.states[state_idx] {
            SendState::Initial => {
                if pos.bit_in_element != 0
                    || pos.e < instr.start_index
                    || pos.e >= instr.start_index + instr.n_elements
                {
                    w.states[state_idx] = SendState::Complete;
                    continue;
                }
                if let Some(mask_reg) = instr.mask_reg {
                    if !body.jamlets[j].mask_bit(&params, mask_reg, pos.e) {
                        w.states[state_idx] = SendState::Complete;
                        continue;
                    }
                }
                let index = utils::word_to_u64(&body.jamlets[j].read_rf_element(
                    &params, instr.vs1, pos.e, instr.index_ew,
                )) as usize;
                if index >= instr.vlmax {
                    let zeros = vec![0u8; eb];
                    let dst_reg = instr.vd + pos.v;
                    body.jamlets[j].rf_update_word(&params, dst_reg, &zeros, 0, tag, eb);
                    w.states[state_idx] = SendState::Complete;
                    continue;
                }
                let (src_coords, src_reg, src_byte_offset) = src_location(body, &instr, index);
                if src_coords == (x, y) {
                    let word = body.jamlets[j].rf_word(&params, src_reg).to_vec();
                    let dst_reg = instr.vd + pos.v;
                    body.jamlets[j]
                        .rf_update_word(&params, dst_reg, &word, src_byte_offset, tag, eb);
                    w.states[state_idx] = SendState::Complete;
                } else {
                    w.states[state_idx] = SendState::NeedToSend;
                }
            }
            SendState::NeedToSend => {
                if !body.jamlets[j].can_send(MessageType::ReadRegElementReq) {
                    continue;
                }
                let index = utils::word_to_u64(&body.jamlets[j].read_rf_element(
                    &params, instr.vs1, pos.e, instr.index_ew,
                )) as usize;
                let (src_coords, src_reg, src_byte_offset) = src_location(body, &instr, index);
                let header = Header {
                    message_type: MessageType::ReadRegElementReq,
                    send_type: SendType::Single,
                    length: 1,
                    source_x: x,
                    source_y: y,
                    target_x: src_coords.0,
                    target_y: src_coords.1,
                    ident: instr.instr_ident,
                    ext: HeaderExt::RegElement { tag, src_reg, src_byte_offset, n_bytes: eb },
                };
                ctx.monitor.create_transaction(
                    ctx.cycle, "ReadRegElement", instr.instr_ident, tag, (x, y), src_coords,
                );
                body.jamlets[j].send_packet(Packet::header_only(header), ctx);
                w.states[state_idx] = SendState::WaitingForResponse;
            }
            _ => {}
        }
    }
}

pub fn monitor_kamlet(w: &mut WaitingRegGather, body: &mut KamletBody, ctx: &mut StepCtx) {
    let sync_ident = w.instr.instr_ident;
    if w.completion_sync == WitemSyncState::NotStarted
        && w.states.iter().all(|s| *s == SendState::Complete)
    {
        w.completion_sync = WitemSyncState::InProgress;
        let at = (body.synchronizer.x, body.synchronizer.y);
        ctx.monitor.create_sync_local_span(ctx.cycle, sync_ident, at);
        body.synchronizer.local_event(ctx.cycle, sync_ident, None, ctx.monitor);
    } else if w.completion_sync == WitemSyncState::InProgress
        && body.synchronizer.is_complete(sync_ident)
    {
        w.completion_sync = WitemSyncState::Complete;
    }
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
    let (tag, src_reg, src_byte_offset, n_bytes) = match header.ext {
        HeaderExt::RegElement { tag, src_reg, src_byte_offset, n_bytes } => {
            (tag, src_reg, src_byte_offset, n_bytes)
        }
        ref ext => panic!("register element request with {ext:?}"),
    };
    // Until our own gather item exists, vs2 may still be mid-write by an
    // older instruction; drop and let the requester retry.
    let message_type = if witems.find(header.ident).is_some() {
        MessageType::ReadRegElementResp
    } else {
        MessageType::ReadRegElementDrop
    };
    let mut payload = Vec::new();
    let mut length = 1;
    if message_type == MessageType::ReadRegElementResp {
        let word = body.jamlets[j].rf_word(&body.params, src_reg);
        let mut data = word[src_byte_offset..src_byte_offset + n_bytes].to_vec();
        data.resize(body.params.word_bytes, 0);
        payload.push(Flit::Data(data));
        length = 2;
    }
    let resp = Header {
        message_type,
        send_type: SendType::Single,
        length,
        source_x: at.0,
        source_y: at.1,
        target_x: header.source_x,
        target_y: header.source_y,
        ident: header.ident,
        ext: HeaderExt::RegElement { tag, src_reg, src_byte_offset, n_bytes },
    };
    body.jamlets[j].send_packet(Packet::new(resp, payload), ctx);
}

pub fn handle_resp(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let witem = witems.find(packet.header.ident).expect("register gather response with no item");
    witem.process_response(body, j, packet, ctx);
}

pub fn handle_drop(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let witem = witems.find(packet.header.ident).expect("register gather drop with no item");
    witem.process_drop(body, j, packet, ctx);
}

pub fn process_response(
    w: &mut WaitingRegGather,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    let params = body.params.clone();
    let tag = packet.header.tag();
    let state_idx = j * params.word_bytes + tag;
    assert_eq!(w.states[state_idx], SendState::WaitingForResponse);
    let ordering = Ordering::new(w.instr.word_order, w.instr.data_ew);
    let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
    let pos = compute_element(&params, ordering, w.instr.start_index, tag, x, y);
    let eb = w.instr.data_ew / 8;
    let data = packet.payload[0].as_data().to_vec();
    let dst_reg = w.instr.vd + pos.v;
    body.jamlets[j].rf_update_word(&params, dst_reg, &data, 0, tag, eb);
    w.states[state_idx] = SendState::Complete;
}

pub fn process_drop(
    w: &mut WaitingRegGather,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    let state_idx = j * body.params.word_bytes + packet.header.tag();
    assert_eq!(w.states[state_idx], SendState::WaitingForResponse);
    w.states[state_idx] = SendState::NeedToSend;
}

pub fn ready(w: &WaitingRegGather) -> bool {
    w.completion_sync == WitemSyncState::Complete
}

pub fn finalize(w: &mut WaitingRegGather, body: &mut KamletBody, _ctx: &mut StepCtx) {
    let (read_regs, dst_regs) = reg_sets(body, &w.instr);
    body.rf.finish(w.core.rf_ident.unwrap(), &read_regs, &dst_regs);
}
