//! Unaligned vector stores via jamlet-to-jamlet word transfer.
//!
//! Mirror of the unaligned loads with a retry path: the destination owns
//! the cache write, and when its line is not yet writable it parks the tag
//! in NEED_TO_ASK_FOR_RESEND and asks the source to resend once the line
//! lands. Requests carry per-payload-word mask bits so masked elements
//! never touch the cache.

use crate::addresses;
use crate::kamlet::{KamletBody, StepCtx};
use crate::kinstr::{KInstr, StoreInstr};
use crate::message::{Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::txn::load_j2j::J2JState;
use crate::txn::mapping::{mappings_from_mem, mappings_from_reg};
use crate::witem::{ReceiveState, SendState, Witem, WitemCore, WitemTable};

pub struct WaitingStoreJ2J {
    pub core: WitemCore,
    pub instr: StoreInstr,
    pub states: Vec<J2JState>,
}

fn reg_sets(body: &KamletBody, instr: &StoreInstr) -> (Vec<usize>, Vec<usize>) {
    let mut read_regs =
        body.regs_for(instr.src, instr.start_index, instr.n_elements, instr.src_ordering.ew);
    if let Some(mask_reg) = instr.mask_reg {
        read_regs.push(mask_reg);
    }
    (read_regs, Vec::new())
}

pub fn dispatch(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: StoreInstr,
    ctx: &mut StepCtx,
) -> Option<KInstr> {
    let (read_regs, write_regs) = reg_sets(body, &instr);
    if !body.rf.is_available(&read_regs, &write_regs) {
        return Some(KInstr::Store(instr));
    }
    let rf_ident = body.rf.start(&read_regs, &write_regs);
    let params = &body.params;
    let wb = params.word_bytes;
    let mut states =
        vec![J2JState { src: SendState::Complete, dst: ReceiveState::Complete }; params.j_in_k() * wb];
    for j in 0..params.j_in_k() {
        let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
        for tag in 0..wb {
            let src_mappings = mappings_from_reg(
                params, &instr.k_maddr, instr.src_ordering,
                instr.start_index, instr.n_elements, tag * 8, x, y,
            );
            let dst_mappings = mappings_from_mem(
                params, &instr.k_maddr, instr.src_ordering,
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
    ctx.monitor.record_witem_created(ctx.cycle, instr.instr_ident, "WaitingStoreJ2J");
    witems.add(Witem::StoreJ2J(WaitingStoreJ2J { core, instr, states }));
    None
}

pub fn monitor_jamlet(w: &mut WaitingStoreJ2J, body: &mut KamletBody, j: usize, ctx: &mut StepCtx) {
    if !w.core.cache_is_avail {
        return;
    }
    let wb = body.params.word_bytes;
    for tag in 0..wb {
        if w.states[j * wb + tag].src == SendState::NeedToSend && send_req(w, body, j, tag, ctx) {
            w.states[j * wb + tag].src = SendState::WaitingForResponse;
        }
        if w.states[j * wb + tag].dst == ReceiveState::NeedToAskForResend
            && send_retry(w, body, j, tag, ctx)
        {
            w.states[j * wb + tag].dst = ReceiveState::WaitingForRequest;
        }
    }
}

fn send_req(w: &WaitingStoreJ2J, body: &mut KamletBody, j: usize, tag: usize, ctx: &mut StepCtx) -> bool {
    let params = body.params.clone();
    let instr = &w.instr;
    let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
    let mappings = mappings_from_reg(
        &params, &instr.k_maddr, instr.src_ordering,
        instr.start_index, instr.n_elements, tag * 8, x, y,
    );
    assert!(!mappings.is_empty());
    if !body.jamlets[j].can_send(MessageType::StoreJ2JWordsReq) {
        return false;
    }
    let epv = params.elements_in_vline(instr.src_ordering.ew);
    let eb = instr.src_ordering.eb();
    let mem_vw = mappings[0].mem_vw;
    let mut words = Vec::new();
    let mut mask_bits: u64 = 0;
    for (index, mapping) in mappings.iter().enumerate() {
        assert_eq!(mapping.mem_vw, mem_vw);
        let src_reg = instr.src + mapping.reg_v as usize;
        words.push(body.jamlets[j].rf_word(&params, src_reg).to_vec());
        let reg_ve = (mapping.reg_wb / 8 / eb) * params.j_in_l() + mapping.reg_vw;
        let element = mapping.reg_v as usize * epv + reg_ve;
        let active = match instr.mask_reg {
            Some(mask_reg) => body.jamlets[j].mask_bit(&params, mask_reg, element),
            None => true,
        };
        if active {
            mask_bits |= 1 << index;
        }
    }
    let (target_x, target_y) = addresses::vw_index_to_j_coords(
        &params, instr.k_maddr.ordering.word_order, mem_vw,
    );
    let header = Header {
        message_type: MessageType::StoreJ2JWordsReq,
        send_type: SendType::Single,
        length: 1 + words.len(),
        source_x: x,
        source_y: y,
        target_x,
        target_y,
        ident: instr.instr_ident,
        ext: HeaderExt::Tagged { tag, mask: mask_bits },
    };
    ctx.monitor.create_transaction(
        ctx.cycle, "StoreJ2JWords", instr.instr_ident, tag, (x, y), (target_x, target_y),
    );
    let payload = words.into_iter().map(Flit::Data).collect();
    body.jamlets[j].send_packet(Packet::new(header, payload), ctx);
    true
}

fn send_retry(w: &WaitingStoreJ2J, body: &mut KamletBody, j: usize, tag: usize, ctx: &mut StepCtx) -> bool {
    let params = body.params.clone();
    let instr = &w.instr;
    let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
    if !body.jamlets[j].can_send(MessageType::StoreJ2JWordsRetry) {
        return false;
    }
    // The source for this tag is the register-side jamlet of our mappings.
    let mappings = mappings_from_mem(
        &params, &instr.k_maddr, instr.src_ordering,
        instr.start_index, instr.n_elements, tag * 8, x, y,
    );
    assert!(!mappings.is_empty());
    let (target_x, target_y) = addresses::vw_index_to_j_coords(
        &params, instr.src_ordering.word_order, mappings[0].reg_vw,
    );
    let header = Header {
        message_type: MessageType::StoreJ2JWordsRetry,
        send_type: SendType::Single,
        length: 1,
        source_x: x,
        source_y: y,
        target_x,
        target_y,
        ident: instr.instr_ident,
        ext: HeaderExt::Tagged { tag: mappings[0].reg_wb / 8, mask: 0 },
    };
    body.jamlets[j].send_packet(Packet::header_only(header), ctx);
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
        let drop = tagged_reply(MessageType::StoreJ2JWordsDrop, header, at);
        body.jamlets[j].send_packet(Packet::header_only(drop), ctx);
        return;
    };
    let Witem::StoreJ2J(w) = witem else {
        panic!("ident {} matched a different waiting-item kind", header.ident);
    };
    let params = body.params.clone();
    let instr = w.instr.clone();
    let wb = params.word_bytes;
    let mappings = mappings_from_reg(
        &params, &instr.k_maddr, instr.src_ordering,
        instr.start_index, instr.n_elements,
        header.tag() * 8, header.source_x, header.source_y,
    );
    assert_eq!(mappings.len(), packet.payload.len());
    let mem_wb = mappings[0].mem_wb;
    let response_tag = j * wb + mem_wb / 8;
    let mask = match header.ext {
        HeaderExt::Tagged { mask, .. } => mask,
        _ => panic!("store request without a tagged header"),
    };

    if w.core.cache_is_avail {
        let slot = w.core.cache_slot.expect("available without a slot");
        let cache_base = slot * params.line_bytes_per_jamlet();
        for (index, (flit, mapping)) in packet.payload.iter().zip(&mappings).enumerate() {
            assert_eq!(mapping.mem_wb, mem_wb);
            if (mask >> index) & 1 == 0 {
                continue;
            }
            let word = flit.as_data().to_vec();
            let vline_offset = (mapping.mem_v % params.vlines_in_cache_line() as u64) as usize;
            let sram_addr = cache_base + vline_offset * params.word_bytes;
            body.jamlets[j].sram_update_word(
                &params, sram_addr, &word, mapping.reg_wb / 8, mapping.mem_wb / 8, 1,
            );
        }
        body.cache.mark_modified(slot);
        assert_eq!(w.states[response_tag].dst, ReceiveState::WaitingForRequest);
        w.states[response_tag].dst = ReceiveState::Complete;
        let resp = tagged_reply(MessageType::StoreJ2JWordsResp, header, at);
        body.jamlets[j].send_packet(Packet::header_only(resp), ctx);
    } else {
        debug!(
            "{}: jamlet ({}, {}): store J2J ident={} tag={} waiting for cache",
            ctx.cycle, at.0, at.1, header.ident, header.tag()
        );
        w.states[response_tag].dst = ReceiveState::NeedToAskForResend;
    }
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
    let witem = witems.find(packet.header.ident).expect("store J2J response with no waiting item");
    witem.process_response(body, j, packet, ctx);
}

pub fn handle_drop(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let witem = witems.find(packet.header.ident).expect("store J2J drop with no waiting item");
    witem.process_drop(body, j, packet, ctx);
}

pub fn process_response(
    w: &mut WaitingStoreJ2J,
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
    w: &mut WaitingStoreJ2J,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    let response_tag = j * body.params.word_bytes + packet.header.tag();
    assert_eq!(w.states[response_tag].src, SendState::WaitingForResponse);
    w.states[response_tag].src = SendState::NeedToSend;
}

pub fn ready(w: &WaitingStoreJ2J) -> bool {
    w.states.iter().all(|s| s.finished()) && w.core.cache_is_avail
}

pub fn finalize(w: &mut WaitingStoreJ2J, body: &mut KamletBody, _ctx: &mut StepCtx) {
    for state in &w.states {
        assert!(state.finished());
    }
    let (read_regs, write_regs) = reg_sets(body, &w.instr);
    body.rf.finish(w.core.rf_ident.unwrap(), &read_regs, &write_regs);
}
