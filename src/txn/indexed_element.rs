//! Ordered indexed access, one element per instruction.
//!
//! The front-end dispatches one instruction per element; only the kamlet
//! owning the element's word slot acts. The owning jamlet pre-checks the
//! TLB over every byte the element spans, answers immediately for masked or
//! faulting elements, and otherwise issues ordered tagged memory-word
//! requests. The response to the front-end frees its dispatch slot.

use crate::addresses::TlbFault;
use crate::jamlet::Jamlet;
use crate::kamlet::{KamletBody, StepCtx};
use crate::kinstr::{IndexedElementInstr, KInstr};
use crate::message::{
    Flit, Header, HeaderExt, MessageType, Packet, SendType,
};
use crate::params::LamletParams;
use crate::txn::child_ident;
use crate::txn::common::RequiredBytes;
use crate::utils;
use crate::witem::{SendState, Witem, WitemCore, WitemTable};

pub struct WaitingIndexedElement {
    pub core: WitemCore,
    pub instr: IndexedElementInstr,
    pub is_store: bool,
    pub j: usize,
    pub states: Vec<SendState>,
    pub resp_sent: bool,
}

fn resp_type(is_store: bool) -> MessageType {
    if is_store {
        MessageType::StoreIndexedElementResp
    } else {
        MessageType::LoadIndexedElementResp
    }
}

fn element_resp(
    instr: &IndexedElementInstr,
    at: (i32, i32),
    is_store: bool,
    masked: bool,
    fault: bool,
) -> Header {
    Header {
        message_type: resp_type(is_store),
        send_type: SendType::Single,
        length: 1,
        source_x: at.0,
        source_y: at.1,
        target_x: 0,
        target_y: -1,
        ident: instr.instr_ident,
        ext: HeaderExt::ElementIndex { element_index: instr.element_index, masked, fault },
    }
}

fn reg_sets(params: &LamletParams, instr: &IndexedElementInstr, is_store: bool) -> (Vec<usize>, Vec<usize>) {
    let epv_data = params.elements_in_vline(instr.data_ew);
    let epv_index = params.elements_in_vline(instr.index_ew);
    let data_reg = instr.reg + instr.element_index / epv_data;
    let index_reg = instr.index_reg + instr.element_index / epv_index;
    if is_store {
        (vec![index_reg, data_reg], Vec::new())
    } else {
        (vec![index_reg], vec![data_reg])
    }
}

fn index_value(params: &LamletParams, jamlet: &Jamlet, instr: &IndexedElementInstr) -> u64 {
    let bytes = jamlet.read_rf_element(params, instr.index_reg, instr.element_index, instr.index_ew);
    utils::word_to_u64(&bytes)
}

pub fn dispatch(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: IndexedElementInstr,
    is_store: bool,
    ctx: &mut StepCtx,
) -> Option<KInstr> {
    let params = body.params.clone();
    let vw = instr.element_index % params.j_in_l();
    let (k_index, j_in_k_index) = instr.word_order.vw_to_k(&params, vw);
    if k_index != body.k_index {
        return None;
    }
    let j = j_in_k_index;
    let wrap = |instr| {
        if is_store {
            KInstr::StoreIndexedElement(instr)
        } else {
            KInstr::LoadIndexedElement(instr)
        }
    };
    // The masked/fault fast paths answer synchronously; hold the
    // instruction until there is room for that answer.
    if !body.jamlets[j].can_send(resp_type(is_store)) {
        return Some(wrap(instr));
    }
    let at = (body.jamlets[j].x, body.jamlets[j].y);

    let masked = instr
        .mask_reg
        .map(|m| !body.jamlets[j].mask_bit(&params, m, instr.element_index))
        .unwrap_or(false);
    if masked {
        debug!(
            "{}: kamlet {}: element {} masked, answering immediately",
            ctx.cycle, body.k_index, instr.element_index
        );
        let header = element_resp(&instr, at, is_store, true, false);
        body.jamlets[j].send_packet(Packet::header_only(header), ctx);
        return None;
    }

    let (read_regs, write_regs) = reg_sets(&params, &instr, is_store);
    if !body.rf.is_available(&read_regs, &write_regs) {
        return Some(wrap(instr));
    }
    let rf_ident = body.rf.start(&read_regs, &write_regs);

    // TLB precheck across every byte (and page) the element spans.
    let byte_offset = index_value(&params, &body.jamlets[j], &instr);
    let element_bytes = instr.data_ew / 8;
    let mut fault = false;
    let mut current = 0usize;
    while current < element_bytes {
        let g = instr.base_addr.bit_offset(((byte_offset as i64) + current as i64) * 8);
        if ctx.tlb.check_access(g, is_store) != TlbFault::None {
            fault = true;
            break;
        }
        let page_offset = g.byte_in_page(&params) as usize;
        current += params.page_bytes - page_offset;
    }
    if fault {
        debug!(
            "{}: kamlet {}: element {} faults, answering immediately",
            ctx.cycle, body.k_index, instr.element_index
        );
        body.rf.finish(rf_ident, &read_regs, &write_regs);
        let header = element_resp(&instr, at, is_store, false, true);
        body.jamlets[j].send_packet(Packet::header_only(header), ctx);
        return None;
    }

    let kind = if is_store { "WaitingStoreIndexedElement" } else { "WaitingLoadIndexedElement" };
    ctx.monitor.record_witem_created(ctx.cycle, instr.instr_ident, kind);
    let core = WitemCore::new(instr.instr_ident, instr.instr_ident, Some(rf_ident));
    let witem = WaitingIndexedElement {
        core,
        instr,
        is_store,
        j,
        states: vec![SendState::NeedToSend; params.word_bytes],
        resp_sent: false,
    };
    if is_store {
        witems.add(Witem::StoreIndexedElement(witem));
    } else {
        witems.add(Witem::LoadIndexedElement(witem));
    }
    None
}

/// Byte offset of the element within its jamlet word.
fn dst_byte_offset(params: &LamletParams, instr: &IndexedElementInstr) -> usize {
    let eb = instr.data_ew / 8;
    let element_in_jamlet = instr.element_index / params.j_in_l();
    let element_in_word = element_in_jamlet % (params.word_bytes / eb);
    element_in_word * eb
}

fn get_request(
    params: &LamletParams,
    tlb: &crate::addresses::Tlb,
    w: &WaitingIndexedElement,
    jamlet: &Jamlet,
    tag: usize,
) -> Option<RequiredBytes> {
    let instr = &w.instr;
    let eb = instr.data_ew / 8;
    let dbo = dst_byte_offset(params, instr);
    if tag < dbo || tag >= dbo + eb {
        return None;
    }
    let src_eb = tag - dbo;
    let byte_offset = index_value(params, jamlet, instr);
    let g_addr = instr.base_addr.bit_offset(((byte_offset as i64) + src_eb as i64) * 8);
    let page_info = tlb.page_info_for(g_addr);
    let page_byte_offset = g_addr.byte_in_page(params) as usize;
    let remaining_page_bytes = params.page_bytes - page_byte_offset;
    if !page_info.is_vpu() {
        if src_eb == 0 || page_byte_offset == 0 {
            let n_bytes = remaining_page_bytes.min(eb - src_eb);
            Some(RequiredBytes { is_vpu: false, g_addr: Some(g_addr), n_bytes, tag })
        } else {
            None
        }
    } else {
        let mem_ordering = page_info.ordering.unwrap();
        let mem_bie = tlb.bit_in_element(g_addr, mem_ordering);
        if mem_bie == 0 || src_eb == 0 || page_byte_offset == 0 {
            let n_bytes = ((mem_ordering.ew - mem_bie) / 8)
                .min(eb - src_eb)
                .min(remaining_page_bytes);
            Some(RequiredBytes { is_vpu: true, g_addr: Some(g_addr), n_bytes, tag })
        } else {
            None
        }
    }
}

pub fn monitor_jamlet(
    w: &mut WaitingIndexedElement,
    body: &mut KamletBody,
    j: usize,
    ctx: &mut StepCtx,
) {
    if j != w.j {
        return;
    }
    let wb = body.params.word_bytes;
    for tag in 0..wb {
        if w.states[tag] != SendState::NeedToSend {
            continue;
        }
        let params = body.params.clone();
        let Some(request) = get_request(&params, ctx.tlb, w, &body.jamlets[j], tag) else {
            w.states[tag] = SendState::Complete;
            continue;
        };
        let g_addr = request.g_addr.unwrap();
        let message_type =
            if w.is_store { MessageType::WriteMemWordReq } else { MessageType::ReadMemWordReq };
        if !body.jamlets[j].can_send(message_type) {
            continue;
        }
        let ((target_x, target_y), addr, dst_byte_in_word) =
            crate::txn::common::mem_word_target(&params, ctx.tlb, g_addr, request.is_vpu);
        let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
        let ident = child_ident(&params, w.instr.instr_ident, tag);
        let (header, payload) = if w.is_store {
            let epv = params.elements_in_vline(w.instr.data_ew);
            let src_reg = w.instr.reg + w.instr.element_index / epv;
            let word = body.jamlets[j].rf_word(&params, src_reg).to_vec();
            let header = Header {
                message_type,
                send_type: SendType::Single,
                length: 3,
                source_x: x,
                source_y: y,
                target_x,
                target_y,
                ident,
                ext: HeaderExt::WriteMemWord {
                    tag,
                    dst_byte_in_word,
                    n_bytes: request.n_bytes,
                    element_index: w.instr.element_index,
                    ordered: true,
                    parent_ident: w.instr.parent_ident,
                },
            };
            (header, vec![Flit::Addr(addr), Flit::Data(word)])
        } else {
            let header = Header {
                message_type,
                send_type: SendType::Single,
                length: 2,
                source_x: x,
                source_y: y,
                target_x,
                target_y,
                ident,
                ext: HeaderExt::ReadMemWord {
                    tag,
                    element_index: w.instr.element_index,
                    ordered: true,
                    parent_ident: w.instr.parent_ident,
                    fault: false,
                },
            };
            (header, vec![Flit::Addr(addr)])
        };
        let kind = if w.is_store { "WriteMemWord" } else { "ReadMemWord" };
        ctx.monitor.create_transaction(ctx.cycle, kind, ident, tag, (x, y), (target_x, target_y));
        body.jamlets[j].send_packet(Packet::new(header, payload), ctx);
        w.states[tag] = SendState::WaitingForResponse;
    }
}

pub fn monitor_kamlet(w: &mut WaitingIndexedElement, body: &mut KamletBody, ctx: &mut StepCtx) {
    if w.resp_sent || w.states.iter().any(|s| *s != SendState::Complete) {
        return;
    }
    if !body.jamlets[w.j].can_send(resp_type(w.is_store)) {
        return;
    }
    let at = (body.jamlets[w.j].x, body.jamlets[w.j].y);
    let header = element_resp(&w.instr, at, w.is_store, false, false);
    body.jamlets[w.j].send_packet(Packet::header_only(header), ctx);
    w.resp_sent = true;
}

pub fn process_response(
    w: &mut WaitingIndexedElement,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    if j != w.j {
        return;
    }
    let header = &packet.header;
    let tag = header.tag();
    assert_eq!(w.states[tag], SendState::WaitingForResponse);
    w.states[tag] = SendState::Complete;
    ctx.monitor.complete_transaction(ctx.cycle, header.ident, tag);
    if w.is_store {
        return;
    }
    // An earlier element faulted: the data never arrives and the register
    // keeps its old bytes.
    if matches!(header.ext, HeaderExt::ReadMemWord { fault: true, .. }) {
        return;
    }
    let params = body.params.clone();
    let request = get_request(&params, ctx.tlb, w, &body.jamlets[j], tag)
        .expect("response for a tag with no request");
    let (_, _, src_byte_in_word) =
        crate::txn::common::mem_word_target(&params, ctx.tlb, request.g_addr.unwrap(), request.is_vpu);
    let data = packet.payload[0].as_data().to_vec();
    let epv = params.elements_in_vline(w.instr.data_ew);
    let dst_reg = w.instr.reg + w.instr.element_index / epv;
    body.jamlets[j].rf_update_word(&params, dst_reg, &data, src_byte_in_word, tag, request.n_bytes);
}

pub fn process_drop(
    w: &mut WaitingIndexedElement,
    _body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    if j != w.j {
        return;
    }
    let tag = packet.header.tag();
    assert_eq!(w.states[tag], SendState::WaitingForResponse);
    w.states[tag] = SendState::NeedToSend;
}

pub fn ready(w: &WaitingIndexedElement) -> bool {
    w.resp_sent
}

pub fn finalize(w: &mut WaitingIndexedElement, body: &mut KamletBody, _ctx: &mut StepCtx) {
    let (read_regs, write_regs) = reg_sets(&body.params, &w.instr, w.is_store);
    body.rf.finish(w.core.rf_ident.unwrap(), &read_regs, &write_regs);
}
