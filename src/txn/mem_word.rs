//! READ_MEM_WORD / WRITE_MEM_WORD responder sides.
//!
//! Requests target the jamlet owning the addressed word of the kamlet
//! cache. When the line is resident the jamlet answers immediately; when it
//! is not, a receiver-side waiting item claims the slot and either responds
//! itself once the line lands (reads) or asks the requester to resend the
//! data (writes, via RETRY). When nothing can be allocated the request is
//! dropped and the requester retries.
//!
//! Responses and drops arriving back at the requester are routed to the
//! parent waiting item via the tag arithmetic on the child ident.

use crate::addresses::KMAddr;
use crate::kamlet::{KamletBody, StepCtx};
use crate::message::{
    Flit, Header, HeaderExt, MemAddr, MessageType, Packet, SendType,
};
use crate::txn::parent_ident;
use crate::witem::{ReceiveState, Witem, WitemCore, WitemTable};

pub struct WaitingReadMemWord {
    pub core: WitemCore,
    pub km: KMAddr,
    pub j: usize,
    pub tag: usize,
    pub element_index: usize,
    pub requester: (i32, i32),
    pub ident: u32,
    pub done: bool,
}

pub struct WaitingWriteMemWord {
    pub core: WitemCore,
    pub km: KMAddr,
    pub j: usize,
    pub tag: usize,
    pub requester: (i32, i32),
    pub ident: u32,
    pub state: ReceiveState,
}

fn resp_header(
    message_type: MessageType,
    rcvd: &Header,
    at: (i32, i32),
    length: usize,
    fault: bool,
) -> Header {
    let ext = match (&message_type, &rcvd.ext) {
        (MessageType::ReadMemWordResp, HeaderExt::ReadMemWord { tag, element_index, .. }) => {
            HeaderExt::ReadMemWord {
                tag: *tag,
                element_index: *element_index,
                ordered: false,
                parent_ident: 0,
                fault,
            }
        }
        (MessageType::ReadMemWordDrop, HeaderExt::ReadMemWord { tag, element_index, .. }) => {
            HeaderExt::ReadMemWord {
                tag: *tag,
                element_index: *element_index,
                ordered: false,
                parent_ident: 0,
                fault,
            }
        }
        (_, HeaderExt::WriteMemWord { tag, .. }) => HeaderExt::Tagged { tag: *tag, mask: 0 },
        (_, ext) => panic!("memory word response to {ext:?}"),
    };
    Header {
        message_type,
        send_type: SendType::Single,
        length,
        source_x: at.0,
        source_y: at.1,
        target_x: rcvd.source_x,
        target_y: rcvd.source_y,
        ident: rcvd.ident,
        ext,
    }
}

pub fn handle_read_req(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let header = &packet.header;
    let tag = header.tag();
    let km = match packet.payload[0].as_addr() {
        MemAddr::Vpu(km) => *km,
        MemAddr::Scalar(addr) => panic!("scalar read {addr:#x} routed to a jamlet"),
    };
    assert_eq!(km.k_index, body.k_index);
    assert_eq!(km.j_in_k_index, j);
    let at = (body.jamlets[j].x, body.jamlets[j].y);

    // Unordered operations are SPMD: this kamlet runs a sibling of the
    // same instruction, which carries the writeset for clash checks and
    // whose absence means "not dispatched yet, retry". Ordered per-element
    // requests have no sibling here; they stand on their own ident.
    let (ordered, element_index) = match &header.ext {
        HeaderExt::ReadMemWord { element_index, ordered, .. } => (*ordered, *element_index),
        ext => panic!("read request with {ext:?}"),
    };
    let parent = parent_ident(&body.params, header.ident, tag);
    let ring = body.params.max_response_tags as u32;
    let writeset = match witems.find_mod(parent, ring) {
        Some(parent_witem) => parent_witem.core().writeset_ident,
        None if ordered => parent,
        None => {
            debug!(
                "{}: jamlet ({}, {}): READ_MEM_WORD_REQ ident={} without parent {parent}, \
                 dropping",
                ctx.cycle, at.0, at.1, header.ident
            );
            let drop = resp_header(MessageType::ReadMemWordDrop, header, at, 1, false);
            body.jamlets[j].send_packet(Packet::header_only(drop), ctx);
            return;
        }
    };

    if let Some(slot) = body.cache.can_access(&km, writeset) {
        let word = body.cached_word(&km, slot);
        let resp = resp_header(MessageType::ReadMemWordResp, header, at, 2, false);
        body.jamlets[j].send_packet(Packet::new(resp, vec![Flit::Data(word)]), ctx);
        return;
    }
    // A slot merely not yet fetched (or busy under our own writeset) gets a
    // waiting item; a slot held by a clashing writeset gets a DROP with no
    // waiting item and no holder, so holders of two writesets never stack
    // up on one slot. The requester retries after the holder drains.
    let line_addr = body.cache.line_addr(&km);
    if witems.can_add() && !body.cache.line_held_by_other(line_addr, writeset) {
        let mut core = WitemCore::new(header.ident, writeset, None);
        core.line_addr = Some(line_addr);
        core.source = Some((header.source_x, header.source_y));
        witems.add(Witem::ReadMemWord(WaitingReadMemWord {
            core,
            km,
            j,
            tag,
            element_index,
            requester: (header.source_x, header.source_y),
            ident: header.ident,
            done: false,
        }));
        debug!(
            "{}: jamlet ({}, {}): READ_MEM_WORD_REQ ident={} waits for line",
            ctx.cycle, at.0, at.1, header.ident
        );
    } else {
        let drop = resp_header(MessageType::ReadMemWordDrop, header, at, 1, false);
        body.jamlets[j].send_packet(Packet::header_only(drop), ctx);
    }
}

pub fn monitor_kamlet_read(w: &mut WaitingReadMemWord, body: &mut KamletBody, ctx: &mut StepCtx) {
    if w.done || !w.core.cache_is_avail {
        return;
    }
    if !body.jamlets[w.j].can_send(MessageType::ReadMemWordResp) {
        return;
    }
    let slot = w.core.cache_slot.unwrap();
    let word = body.cached_word(&w.km, slot);
    let at = (body.jamlets[w.j].x, body.jamlets[w.j].y);
    let header = Header {
        message_type: MessageType::ReadMemWordResp,
        send_type: SendType::Single,
        length: 2,
        source_x: at.0,
        source_y: at.1,
        target_x: w.requester.0,
        target_y: w.requester.1,
        ident: w.ident,
        ext: HeaderExt::ReadMemWord {
            tag: w.tag,
            element_index: w.element_index,
            ordered: false,
            parent_ident: 0,
            fault: false,
        },
    };
    body.jamlets[w.j].send_packet(Packet::new(header, vec![Flit::Data(word)]), ctx);
    w.done = true;
}

pub fn ready_read(w: &WaitingReadMemWord) -> bool {
    w.done
}

fn do_write(
    body: &mut KamletBody,
    j: usize,
    km: &KMAddr,
    slot: usize,
    data: &[u8],
    src_start: usize,
    dst_start: usize,
    n_bytes: usize,
) {
    let sram_addr = body.cache.sram_addr(slot, km);
    let params = body.params.clone();
    body.jamlets[j].sram_update_word(&params, sram_addr, data, src_start, dst_start, n_bytes);
    body.cache.mark_modified(slot);
}

pub fn handle_write_req(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let header = &packet.header;
    let (tag, dst_byte_in_word, n_bytes, ordered) = match &header.ext {
        HeaderExt::WriteMemWord { tag, dst_byte_in_word, n_bytes, ordered, .. } => {
            (*tag, *dst_byte_in_word, *n_bytes, *ordered)
        }
        ext => panic!("write request with {ext:?}"),
    };
    let km = match packet.payload[0].as_addr() {
        MemAddr::Vpu(km) => *km,
        MemAddr::Scalar(addr) => panic!("scalar write {addr:#x} routed to a jamlet"),
    };
    assert_eq!(km.k_index, body.k_index);
    assert_eq!(km.j_in_k_index, j);
    let data = packet.payload[1].as_data().to_vec();
    let at = (body.jamlets[j].x, body.jamlets[j].y);
    let source = (header.source_x, header.source_y);

    let parent = parent_ident(&body.params, header.ident, tag);
    let ring = body.params.max_response_tags as u32;
    let writeset = match witems.find_mod(parent, ring) {
        Some(parent_witem) => parent_witem.core().writeset_ident,
        None if ordered => parent,
        None => {
            debug!(
                "{}: jamlet ({}, {}): WRITE_MEM_WORD_REQ ident={} without parent {parent}, \
                 dropping",
                ctx.cycle, at.0, at.1, header.ident
            );
            let drop = resp_header(MessageType::WriteMemWordDrop, header, at, 1, false);
            body.jamlets[j].send_packet(Packet::header_only(drop), ctx);
            return;
        }
    };

    if let Some(existing) = witems.find_with_source(header.ident, source) {
        // Resend after RETRY: the slot is held, complete the write.
        let slot = existing.core().cache_slot.expect("retry sent without a slot");
        let Witem::WriteMemWord(wmw) = existing else {
            panic!("ident {} source {source:?} matched a different waiting-item kind", header.ident);
        };
        assert_eq!(wmw.state, ReceiveState::WaitingForRequest);
        wmw.state = ReceiveState::Complete;
        do_write(body, j, &km, slot, &data, tag, dst_byte_in_word, n_bytes);
        let resp = resp_header(MessageType::WriteMemWordResp, header, at, 1, false);
        body.jamlets[j].send_packet(Packet::header_only(resp), ctx);
        return;
    }
    if let Some(slot) = body.cache.can_access(&km, writeset) {
        do_write(body, j, &km, slot, &data, tag, dst_byte_in_word, n_bytes);
        let resp = resp_header(MessageType::WriteMemWordResp, header, at, 1, false);
        body.jamlets[j].send_packet(Packet::header_only(resp), ctx);
        return;
    }
    // Same case split as the read side: a line held by a clashing writeset
    // is DROPped without creating a waiting item or a holder; only a line
    // that is not yet fetched, or busy under our own writeset, parks a
    // waiting item for the RETRY handshake.
    let line_addr = body.cache.line_addr(&km);
    if witems.can_add() && !body.cache.line_held_by_other(line_addr, writeset) {
        let mut core = WitemCore::new(header.ident, writeset, None);
        core.line_addr = Some(line_addr);
        core.source = Some(source);
        witems.add(Witem::WriteMemWord(WaitingWriteMemWord {
            core,
            km,
            j,
            tag,
            requester: source,
            ident: header.ident,
            state: ReceiveState::NeedToAskForResend,
        }));
        debug!(
            "{}: jamlet ({}, {}): WRITE_MEM_WORD_REQ ident={} waits for line, will RETRY",
            ctx.cycle, at.0, at.1, header.ident
        );
    } else {
        let drop = resp_header(MessageType::WriteMemWordDrop, header, at, 1, false);
        body.jamlets[j].send_packet(Packet::header_only(drop), ctx);
    }
}

pub fn monitor_kamlet_write(w: &mut WaitingWriteMemWord, body: &mut KamletBody, ctx: &mut StepCtx) {
    if w.state != ReceiveState::NeedToAskForResend || !w.core.cache_is_avail {
        return;
    }
    if !body.jamlets[w.j].can_send(MessageType::WriteMemWordRetry) {
        return;
    }
    let at = (body.jamlets[w.j].x, body.jamlets[w.j].y);
    let header = Header {
        message_type: MessageType::WriteMemWordRetry,
        send_type: SendType::Single,
        length: 1,
        source_x: at.0,
        source_y: at.1,
        target_x: w.requester.0,
        target_y: w.requester.1,
        ident: w.ident,
        ext: HeaderExt::Tagged { tag: w.tag, mask: 0 },
    };
    body.jamlets[w.j].send_packet(Packet::header_only(header), ctx);
    w.state = ReceiveState::WaitingForRequest;
}

pub fn ready_write(w: &WaitingWriteMemWord) -> bool {
    w.state == ReceiveState::Complete
}

/// Route a response back to the parent waiting item of the child ident.
pub fn handle_resp(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let header = &packet.header;
    let parent = parent_ident(&body.params, header.ident, header.tag());
    let ring = body.params.max_response_tags as u32;
    let witem = witems
        .find_mod(parent, ring)
        .unwrap_or_else(|| panic!("response ident {} with no parent witem", header.ident));
    witem.process_response(body, j, packet, ctx);
}

pub fn handle_drop(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    let header = &packet.header;
    let parent = parent_ident(&body.params, header.ident, header.tag());
    let ring = body.params.max_response_tags as u32;
    let witem = witems
        .find_mod(parent, ring)
        .unwrap_or_else(|| panic!("drop ident {} with no parent witem", header.ident));
    witem.process_drop(body, j, packet, ctx);
}
