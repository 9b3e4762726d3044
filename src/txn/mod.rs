pub mod common;
pub mod gather;
pub mod indexed_element;
pub mod load_j2j;
pub mod mapping;
pub mod mem_word;
pub mod probes;
pub mod reg_gather;
pub mod scatter;
pub mod store_j2j;

use crate::kamlet::{KamletBody, StepCtx};
use crate::message::{MessageType, Packet};
use crate::witem::WitemTable;

/// Static handler dispatch for packets arriving at a jamlet.
pub fn handle_packet(
    body: &mut KamletBody,
    witems: &mut WitemTable,
    j: usize,
    packet: &Packet,
    ctx: &mut StepCtx,
) {
    match packet.header.message_type {
        MessageType::LoadJ2JWordsReq => load_j2j::handle_req(body, witems, j, packet, ctx),
        MessageType::LoadJ2JWordsResp => load_j2j::handle_resp(body, witems, j, packet, ctx),
        MessageType::LoadJ2JWordsDrop => load_j2j::handle_drop(body, witems, j, packet, ctx),
        MessageType::StoreJ2JWordsReq => store_j2j::handle_req(body, witems, j, packet, ctx),
        MessageType::StoreJ2JWordsResp => store_j2j::handle_resp(body, witems, j, packet, ctx),
        MessageType::StoreJ2JWordsDrop | MessageType::StoreJ2JWordsRetry => {
            store_j2j::handle_drop(body, witems, j, packet, ctx)
        }
        MessageType::ReadMemWordReq => mem_word::handle_read_req(body, witems, j, packet, ctx),
        MessageType::WriteMemWordReq => mem_word::handle_write_req(body, witems, j, packet, ctx),
        MessageType::ReadMemWordResp
        | MessageType::WriteMemWordResp => mem_word::handle_resp(body, witems, j, packet, ctx),
        MessageType::ReadMemWordDrop
        | MessageType::WriteMemWordDrop
        | MessageType::WriteMemWordRetry => mem_word::handle_drop(body, witems, j, packet, ctx),
        MessageType::ReadRegElementReq => reg_gather::handle_req(body, witems, j, packet, ctx),
        MessageType::ReadRegElementResp => reg_gather::handle_resp(body, witems, j, packet, ctx),
        MessageType::ReadRegElementDrop => reg_gather::handle_drop(body, witems, j, packet, ctx),
        other => panic!("no jamlet handler for {}", other.name()),
    }
}

/// Ident of the per-tag child transaction of a parent instruction.
pub fn child_ident(params: &crate::params::LamletParams, instr_ident: u32, tag: usize) -> u32 {
    (instr_ident + tag as u32 + 1) % params.max_response_tags as u32
}

/// Inverse of `child_ident`.
pub fn parent_ident(params: &crate::params::LamletParams, ident: u32, tag: usize) -> u32 {
    let n = params.max_response_tags as u32;
    (ident + n - (tag as u32 + 1) % n) % n
}

/// Barrier ident for the completion phase of a two-barrier operation.
/// Instruction idents are spaced so this never collides with another
/// operation's fault barrier.
pub fn completion_ident(_params: &crate::params::LamletParams, instr_ident: u32) -> u32 {
    instr_ident + 1
}
