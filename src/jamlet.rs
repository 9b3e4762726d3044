use std::collections::VecDeque;

use crate::addresses;
use crate::kamlet::StepCtx;
use crate::memlet;
use crate::message::{Direction, Flit, Header, MessageType, Packet};
use crate::params::LamletParams;
use crate::queue::Queue;
use crate::router::Router;
use crate::utils;

/// Message types a jamlet can originate, in queue-scan order.
const SENDABLE: [MessageType; 22] = [
    MessageType::ReadLine,
    MessageType::WriteLine,
    MessageType::WriteLineReadLine,
    MessageType::LoadJ2JWordsReq,
    MessageType::LoadJ2JWordsResp,
    MessageType::LoadJ2JWordsDrop,
    MessageType::StoreJ2JWordsReq,
    MessageType::StoreJ2JWordsResp,
    MessageType::StoreJ2JWordsDrop,
    MessageType::StoreJ2JWordsRetry,
    MessageType::ReadMemWordReq,
    MessageType::ReadMemWordResp,
    MessageType::ReadMemWordDrop,
    MessageType::WriteMemWordReq,
    MessageType::WriteMemWordResp,
    MessageType::WriteMemWordDrop,
    MessageType::WriteMemWordRetry,
    MessageType::ReadRegElementReq,
    MessageType::ReadRegElementResp,
    MessageType::ReadRegElementDrop,
    MessageType::LoadIndexedElementResp,
    MessageType::ReadBytesResp,
];

fn queue_index(message_type: MessageType) -> usize {
    // StoreIndexedElementResp shares the indexed-element response queue.
    let message_type = if message_type == MessageType::StoreIndexedElementResp {
        MessageType::LoadIndexedElementResp
    } else {
        message_type
    };
    SENDABLE
        .iter()
        .position(|t| *t == message_type)
        .unwrap_or_else(|| panic!("jamlet cannot send {}", message_type.name()))
}

#[derive(Debug)]
pub struct PartialPacket {
    pub header: Header,
    pub payload: Vec<Flit>,
}

impl PartialPacket {
    pub fn remaining(&self) -> usize {
        self.header.length - 1 - self.payload.len()
    }
}

/// A single lane of the processor: a register-file slice, a share of the
/// kamlet's cache SRAM, and one router per virtual channel.
pub struct Jamlet {
    pub x: i32,
    pub y: i32,
    pub k_index: usize,
    pub j_in_k_index: usize,
    /// Memlet router this jamlet's line traffic targets.
    pub mem_x: i32,
    pub mem_y: i32,
    pub rf_slice: Vec<u8>,
    pub sram: Vec<u8>,
    pub routers: Vec<Router>,
    pub assembling: Vec<Option<PartialPacket>>,
    send_queues: Vec<Queue<Packet>>,
    /// In-flight outgoing word streams: channel 0, and one shared sender
    /// for the request channels.
    sending0: Option<VecDeque<Flit>>,
    sending_hi: Option<(usize, VecDeque<Flit>)>,
    rr_start: usize,
}

impl Jamlet {
    pub fn new(params: &LamletParams, x: i32, y: i32) -> Self {
        let (k_index, j_in_k_index) = addresses::j_coords_to_k_indices(params, x, y);
        let (mem_x, mem_y) = memlet::jamlet_coords_to_m_router_coords(params, x, y);
        Jamlet {
            x,
            y,
            k_index,
            j_in_k_index,
            mem_x,
            mem_y,
            rf_slice: vec![0; params.rf_slice_bytes()],
            sram: vec![0; params.jamlet_sram_bytes],
            routers: (0..params.n_channels).map(|ch| Router::new(params, x, y, ch)).collect(),
            assembling: (0..params.n_channels).map(|_| None).collect(),
            send_queues: SENDABLE.iter().map(|_| Queue::new(2)).collect(),
            sending0: None,
            sending_hi: None,
            rr_start: 0,
        }
    }

    pub fn can_send(&self, message_type: MessageType) -> bool {
        self.send_queues[queue_index(message_type)].can_append()
    }

    /// Queue a packet for sending. Callers check `can_send` first (waiting
    /// items simply retry next cycle when the queue is full).
    pub fn send_packet(&mut self, packet: Packet, ctx: &mut StepCtx) {
        let header = &packet.header;
        debug!(
            "{}: jamlet ({}, {}): queueing {} target=({}, {})",
            ctx.cycle, self.x, self.y,
            header.message_type.name(), header.target_x, header.target_y
        );
        ctx.monitor.record_message_sent(
            ctx.cycle,
            header.message_type.name(),
            header.ident,
            (self.x, self.y),
            (header.target_x, header.target_y),
        );
        self.send_queues[queue_index(header.message_type)].append(packet);
    }

    /// Drive one word per cycle into the channel-0 router and one into the
    /// request channels, draining the send queues.
    pub fn step_send(&mut self) {
        if self.sending0.is_none() {
            for (i, t) in SENDABLE.iter().enumerate() {
                if t.channel() == 0 && !self.send_queues[i].is_empty() {
                    self.sending0 = Some(self.send_queues[i].pop().into_flits().collect());
                    break;
                }
            }
        }
        if let Some(flits) = &mut self.sending0 {
            let router = &mut self.routers[0];
            if router.has_input_room(Direction::H) {
                router.receive(Direction::H, flits.pop_front().unwrap());
            }
            if flits.is_empty() {
                self.sending0 = None;
            }
        }

        if self.sending_hi.is_none() {
            let n = SENDABLE.len();
            for offset in 0..n {
                let i = (self.rr_start + offset) % n;
                let channel = SENDABLE[i].channel();
                if channel != 0 && !self.send_queues[i].is_empty() {
                    self.sending_hi =
                        Some((channel, self.send_queues[i].pop().into_flits().collect()));
                    self.rr_start = (i + 1) % n;
                    break;
                }
            }
        }
        if let Some((channel, flits)) = &mut self.sending_hi {
            let router = &mut self.routers[*channel];
            if router.has_input_room(Direction::H) {
                router.receive(Direction::H, flits.pop_front().unwrap());
            }
            if flits.is_empty() {
                self.sending_hi = None;
            }
        }
    }

    pub fn update(&mut self) {
        for router in &mut self.routers {
            router.update();
        }
        for queue in &mut self.send_queues {
            queue.update();
        }
    }

    // --- register file and SRAM helpers ---

    pub fn rf_word(&self, params: &LamletParams, reg: usize) -> &[u8] {
        let wb = params.word_bytes;
        &self.rf_slice[reg * wb..(reg + 1) * wb]
    }

    pub fn rf_update_word(
        &mut self,
        params: &LamletParams,
        reg: usize,
        src: &[u8],
        src_start: usize,
        dst_start: usize,
        n_bytes: usize,
    ) {
        let wb = params.word_bytes;
        let old = self.rf_word(params, reg).to_vec();
        let new = utils::shift_and_update_word(&old, src, src_start, dst_start, n_bytes);
        self.rf_slice[reg * wb..(reg + 1) * wb].copy_from_slice(&new);
    }

    pub fn sram_word(&self, params: &LamletParams, sram_addr: usize) -> &[u8] {
        let wb = params.word_bytes;
        let base = sram_addr / wb * wb;
        &self.sram[base..base + wb]
    }

    pub fn sram_update_word(
        &mut self,
        params: &LamletParams,
        sram_addr: usize,
        src: &[u8],
        src_start: usize,
        dst_start: usize,
        n_bytes: usize,
    ) {
        let wb = params.word_bytes;
        let base = sram_addr / wb * wb;
        let old = self.sram[base..base + wb].to_vec();
        let new = utils::shift_and_update_word(&old, src, src_start, dst_start, n_bytes);
        self.sram[base..base + wb].copy_from_slice(&new);
    }

    /// Mask bit for an element this jamlet owns: bit `e / j_in_l` of the
    /// jamlet's mask-register word.
    pub fn mask_bit(&self, params: &LamletParams, mask_reg: usize, element: usize) -> bool {
        let bit_index = element / params.j_in_l();
        let word = self.rf_word(params, mask_reg);
        (word[bit_index / 8] >> (bit_index % 8)) & 1 == 1
    }

    /// Read element `e` of a register group laid out at `ew` on this jamlet.
    pub fn read_rf_element(
        &self,
        params: &LamletParams,
        base_reg: usize,
        element: usize,
        ew: usize,
    ) -> Vec<u8> {
        let eb = ew / 8;
        let epv = params.elements_in_vline(ew);
        let v = element / epv;
        let ve = element % epv;
        let we = ve / params.j_in_l();
        let word = self.rf_word(params, base_reg + v);
        word[we * eb..(we + 1) * eb].to_vec()
    }
}
