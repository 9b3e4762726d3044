//! Gather-style loads (strided and indexed-unordered).
//!
//! Elements load from non-contiguous memory into contiguous register
//! positions. Each (jamlet, tag) runs an independent READ_MEM_WORD
//! transaction; two barriers close the operation: a fault barrier carrying
//! the minimum faulting element, then a completion barrier. Tags that would
//! read non-idempotent memory hold until the fault barrier resolves so no
//! side-effecting read happens past a faulting element.

use crate::kamlet::{KamletBody, StepCtx};
use crate::kinstr::{IndexedInstr, KInstr, StrideInstr};
use crate::message::{Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::txn::common::{self, compute_element, GatherOp};
use crate::txn::{child_ident, completion_ident};
use crate::witem::{SendState, Witem, WitemCore, WitemSyncState, WitemTable};

pub struct WaitingLoadGather {
    pub core: WitemCore,
    pub op: GatherOp,
    pub states: Vec<SendState>,
    pub fault_sync: WitemSyncState,
    pub completion_sync: WitemSyncState,
    pub min_fault_element: Option<u64>,
    pub global_min_fault: Option<u64>,
}

fn reg_sets(body: &KamletBody, op: &GatherOp) -> (Vec<usize>, Vec<usize>) {
    let dst_regs = body.regs_for(op.reg, op.start_index, op.n_elements, op.ordering.ew);
    let mut read_regs = Vec::new();
    if let common::AddressMode::Indexed { index_reg, index_ew } = &op.mode {
        read_regs.extend(body.regs_for(*index_reg, op.start_index, op.n_elements, *index_ew));
    }
    if let Some(mask_reg) = op.mask_reg {
        read_regs.push(mask_reg);
    }
    (read_regs, dst_regs)
}

fn dispatch(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    op: GatherOp,
    ctx: &mut StepCtx,
) -> bool {
    let (read_regs, dst_regs) = reg_sets(body, &op);
    if !body.rf.is_available(&read_regs, &dst_regs) {
        return false;
    }
    let rf_ident = body.rf.start(&read_regs, &dst_regs);
    let n_tags = body.params.j_in_k() * body.params.word_bytes;
    ctx.monitor.record_witem_created(ctx.cycle, op.instr_ident, "WaitingLoadGather");
    let witem = WaitingLoadGather {
        core: WitemCore::new(op.instr_ident, op.writeset_ident, Some(rf_ident)),
        op,
        states: vec![SendState::Initial; n_tags],
        fault_sync: WitemSyncState::NotStarted,
        completion_sync: WitemSyncState::NotStarted,
        min_fault_element: None,
        global_min_fault: None,
    };
    witems.add(Witem::LoadGather(witem));
    true
}

pub fn dispatch_strided(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: StrideInstr,
    ctx: &mut StepCtx,
) -> Option<KInstr> {
    let op = GatherOp::from_stride(&instr);
    if dispatch(body, witems, op, ctx) {
        None
    } else {
        Some(KInstr::LoadStride(instr))
    }
}

pub fn dispatch_indexed(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    instr: IndexedInstr,
    ctx: &mut StepCtx,
) -> Option<KInstr> {
    let op = GatherOp::from_indexed(&instr);
    if dispatch(body, witems, op, ctx) {
        None
    } else {
        Some(KInstr::LoadIndexed(instr))
    }
}

pub fn monitor_jamlet(w: &mut WaitingLoadGather, body: &mut KamletBody, j: usize, ctx: &mut StepCtx) {
    let wb = body.params.word_bytes;
    for tag in 0..wb {
        let state_idx = j * wb + tag;
        let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
        let pos = compute_element(&body.params, w.op.ordering, w.op.start_index, tag, x, y);
        match w.states[state_idx] {
            SendState::Initial => {
                let request =
                    common::mem_request(&body.params, ctx.tlb, &w.op, &body.jamlets[j], pos, tag, false);
                w.states[state_idx] = match request {
                    None => SendState::Complete,
                    Some(r) if r.g_addr.is_none() => {
                        let e = pos.e as u64;
                        w.min_fault_element = Some(match w.min_fault_element {
                            Some(m) => m.min(e),
                            None => e,
                        });
                        SendState::Complete
                    }
                    Some(r) => {
                        let page = ctx.tlb.page_info_for(r.g_addr.unwrap());
                        if page.idempotent() {
                            SendState::NeedToSend
                        } else {
                            SendState::WaitingInCaseFault
                        }
                    }
                };
            }
            SendState::WaitingInCaseFault => {
                if w.fault_sync == WitemSyncState::Complete {
                    let suppressed = matches!(w.global_min_fault, Some(m) if pos.e as u64 >= m);
                    w.states[state_idx] =
                        if suppressed { SendState::Complete } else { SendState::NeedToSend };
                }
            }
            SendState::NeedToSend => {
                if send_req(w, body, j, tag, ctx) {
                    w.states[state_idx] = SendState::WaitingForResponse;
                }
            }
            _ => {}
        }
    }
}

fn send_req(w: &WaitingLoadGather, body: &mut KamletBody, j: usize, tag: usize, ctx: &mut StepCtx) -> bool {
    let params = body.params.clone();
    let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
    let pos = compute_element(&params, w.op.ordering, w.op.start_index, tag, x, y);
    let request = common::mem_request(&params, ctx.tlb, &w.op, &body.jamlets[j], pos, tag, false)
        .expect("request vanished between classification and send");
    let g_addr = request.g_addr.expect("fault classified as sendable");
    if !body.jamlets[j].can_send(MessageType::ReadMemWordReq) {
        return false;
    }
    let ((target_x, target_y), addr, _) =
        common::mem_word_target(&params, ctx.tlb, g_addr, request.is_vpu);
    let ident = child_ident(&params, w.op.instr_ident, tag);
    let header = Header {
        message_type: MessageType::ReadMemWordReq,
        send_type: SendType::Single,
        length: 2,
        source_x: x,
        source_y: y,
        target_x,
        target_y,
        ident,
        ext: HeaderExt::ReadMemWord {
            tag,
            element_index: pos.e,
            ordered: false,
            parent_ident: 0,
            fault: false,
        },
    };
    debug!(
        "{}: LoadGather jamlet ({x}, {y}) ident={} tag={tag} -> ({target_x}, {target_y}) \
         element={} vpu={}",
        ctx.cycle, w.op.instr_ident, pos.e, request.is_vpu
    );
    ctx.monitor.create_transaction(
        ctx.cycle, "ReadMemWord", ident, tag, (x, y), (target_x, target_y),
    );
    body.jamlets[j].send_packet(Packet::new(header, vec![Flit::Addr(addr)]), ctx);
    true
}

pub fn monitor_kamlet(w: &mut WaitingLoadGather, body: &mut KamletBody, ctx: &mut StepCtx) {
    let fault_ident = w.op.instr_ident;
    let comp_ident = completion_ident(&body.params, w.op.instr_ident);

    if w.fault_sync == WitemSyncState::NotStarted
        && w.states.iter().all(|s| *s != SendState::Initial)
    {
        w.fault_sync = WitemSyncState::InProgress;
        let at = (body.synchronizer.x, body.synchronizer.y);
        ctx.monitor.create_sync_local_span(ctx.cycle, fault_ident, at);
        body.synchronizer
            .local_event(ctx.cycle, fault_ident, w.min_fault_element, ctx.monitor);
    } else if w.fault_sync == WitemSyncState::InProgress
        && body.synchronizer.is_complete(fault_ident)
    {
        w.fault_sync = WitemSyncState::Complete;
        w.global_min_fault = body.synchronizer.get_min_value(fault_ident);
    }

    if w.completion_sync == WitemSyncState::NotStarted
        && w.states.iter().all(|s| *s == SendState::Complete)
    {
        w.completion_sync = WitemSyncState::InProgress;
        let at = (body.synchronizer.x, body.synchronizer.y);
        ctx.monitor.create_sync_local_span(ctx.cycle, comp_ident, at);
        body.synchronizer.local_event(ctx.cycle, comp_ident, None, ctx.monitor);
    } else if w.completion_sync == WitemSyncState::InProgress
        && body.synchronizer.is_complete(comp_ident)
    {
        w.completion_sync = WitemSyncState::Complete;
    }
}

pub fn process_response(
    w: &mut WaitingLoadGather,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let header = &packet.header;
    let tag = header.tag();
    let wb = body.params.word_bytes;
    let state_idx = j * wb + tag;
    assert_eq!(w.states[state_idx], SendState::WaitingForResponse);
    w.states[state_idx] = SendState::Complete;

    let params = body.params.clone();
    let (x, y) = (body.jamlets[j].x, body.jamlets[j].y);
    let pos = compute_element(&params, w.op.ordering, w.op.start_index, tag, x, y);
    let request = common::mem_request(&params, ctx.tlb, &w.op, &body.jamlets[j], pos, tag, false)
        .expect("response for a tag with no request");
    let (_, _, src_byte_in_word) =
        common::mem_word_target(&params, ctx.tlb, request.g_addr.unwrap(), request.is_vpu);
    let data = packet.payload[0].as_data().to_vec();
    let dst_reg = w.op.reg + pos.v;
    body.jamlets[j].rf_update_word(&params, dst_reg, &data, src_byte_in_word, tag, request.n_bytes);
    debug!(
        "{}: LoadGather resp jamlet ({x}, {y}) ident={} tag={tag} reg={dst_reg} \
         src_byte={src_byte_in_word} n_bytes={}",
        ctx.cycle, w.op.instr_ident, request.n_bytes
    );
    ctx.monitor.complete_transaction(ctx.cycle, header.ident, tag);
}

pub fn process_drop(
    w: &mut WaitingLoadGather,
    body: &mut KamletBody,
    j: usize,
    packet: &Packet,
    _ctx: &mut StepCtx,
) {
    let tag = packet.header.tag();
    let state_idx = j * body.params.word_bytes + tag;
    assert_eq!(w.states[state_idx], SendState::WaitingForResponse);
    w.states[state_idx] = SendState::NeedToSend;
}

pub fn ready(w: &WaitingLoadGather) -> bool {
    w.completion_sync == WitemSyncState::Complete
}

pub fn finalize(w: &mut WaitingLoadGather, body: &mut KamletBody, _ctx: &mut StepCtx) {
    let (read_regs, dst_regs) = reg_sets(body, &w.op);
    body.rf.finish(w.core.rf_ident.unwrap(), &read_regs, &dst_regs);
}
