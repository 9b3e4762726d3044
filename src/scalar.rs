use std::collections::{HashMap, VecDeque};

use crate::clock::Promise;
use crate::jamlet::PartialPacket;
use crate::kamlet::StepCtx;
use crate::message::{
    Direction, Flit, Header, HeaderExt, MemAddr, MessageType, Packet, SendType,
};
use crate::params::LamletParams;
use crate::router::Router;

/// One access to scalar non-idempotent memory, in observation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarAccess {
    pub is_write: bool,
    pub addr: u64,
    pub n_bytes: usize,
}

/// A completed per-element response collected for the driver.
#[derive(Debug, Clone, Copy)]
pub struct ElementResp {
    pub element_index: usize,
    pub masked: bool,
    pub fault: bool,
}

/// Serialization state for one ordered operation.
struct GateState {
    next_expected: usize,
    pending: Vec<Packet>,
    aborted: bool,
}

/// The scalar front-end at router coordinates (0, -1): scalar memory,
/// the non-idempotent access log, the ordered-access gate, and the
/// injection point for kernel instruction packets.
pub struct ScalarFrontend {
    params: LamletParams,
    pub routers: Vec<Router>,
    assembling: Vec<Option<PartialPacket>>,
    mem: Vec<u8>,
    non_idemp_ranges: Vec<(u64, u64)>,
    pub non_idempotent_access_log: Vec<ScalarAccess>,
    element_resps: HashMap<u32, ElementResp>,
    read_bytes_promises: HashMap<u32, Promise<Vec<u8>>>,
    gates: HashMap<u32, GateState>,
    send_queue: VecDeque<Packet>,
    sending: Option<VecDeque<Flit>>,
}

impl ScalarFrontend {
    pub fn new(params: &LamletParams) -> Self {
        ScalarFrontend {
            params: params.clone(),
            routers: (0..params.n_channels).map(|ch| Router::new(params, 0, -1, ch)).collect(),
            assembling: (0..params.n_channels).map(|_| None).collect(),
            mem: Vec::new(),
            non_idemp_ranges: Vec::new(),
            non_idempotent_access_log: Vec::new(),
            element_resps: HashMap::new(),
            read_bytes_promises: HashMap::new(),
            gates: HashMap::new(),
            send_queue: VecDeque::new(),
            sending: None,
        }
    }

    /// Register a scalar page's backing range, noting idempotency.
    pub fn register_page(&mut self, local_base: u64, len: u64, non_idempotent: bool) {
        let end = (local_base + len) as usize;
        if self.mem.len() < end {
            self.mem.resize(end, 0);
        }
        if non_idempotent {
            self.non_idemp_ranges.push((local_base, local_base + len));
        }
    }

    fn is_non_idempotent(&self, addr: u64) -> bool {
        self.non_idemp_ranges.iter().any(|&(lo, hi)| addr >= lo && addr < hi)
    }

    pub fn write_scalar(&mut self, addr: u64, bytes: &[u8]) {
        let end = addr as usize + bytes.len();
        assert!(end <= self.mem.len(), "scalar write beyond allocated pages");
        self.mem[addr as usize..end].copy_from_slice(bytes);
    }

    pub fn read_scalar(&self, addr: u64, n_bytes: usize) -> Vec<u8> {
        let end = addr as usize + n_bytes;
        assert!(end <= self.mem.len(), "scalar read beyond allocated pages");
        self.mem[addr as usize..end].to_vec()
    }

    /// Queue an instruction packet (or any front-end packet) for sending.
    pub fn queue_packet(&mut self, packet: Packet) {
        self.send_queue.push_back(packet);
    }

    pub fn has_element_resp(&self, ident: u32) -> bool {
        self.element_resps.contains_key(&ident)
    }

    pub fn take_element_resp(&mut self, ident: u32) -> Option<ElementResp> {
        self.element_resps.remove(&ident)
    }

    /// Nothing queued or mid-flight on the outgoing side.
    pub fn is_quiet(&self) -> bool {
        self.send_queue.is_empty() && self.sending.is_none()
    }

    /// Register interest in a probe-read response; the returned cell is
    /// fulfilled when the packet arrives.
    pub fn expect_read_bytes(&mut self, ident: u32) -> Promise<Vec<u8>> {
        let promise = Promise::new();
        let replaced = self.read_bytes_promises.insert(ident, promise.clone());
        assert!(replaced.is_none(), "duplicate probe-read ident {ident}");
        promise
    }

    /// Open the ordered gate for a barrier ident at its first element.
    pub fn gate_open(&mut self, parent_ident: u32, start_element: usize) {
        let replaced = self.gates.insert(
            parent_ident,
            GateState { next_expected: start_element, pending: Vec::new(), aborted: false },
        );
        assert!(replaced.is_none() || replaced.unwrap().pending.is_empty());
    }

    fn packet_element_index(packet: &Packet) -> usize {
        match packet.header.ext {
            HeaderExt::ReadMemWord { element_index, .. }
            | HeaderExt::WriteMemWord { element_index, .. } => element_index,
            ref ext => panic!("ordered gate holds {ext:?}"),
        }
    }

    /// Advance the gate once an element's response has been seen; queued
    /// requests up to the new expected element become servable.
    pub fn gate_advance(&mut self, parent_ident: u32, next_element: usize, ctx_cycle: u64) {
        let Some(gate) = self.gates.get_mut(&parent_ident) else { return };
        gate.next_expected = gate.next_expected.max(next_element);
        let next_expected = gate.next_expected;
        let pending = std::mem::take(&mut gate.pending);
        let (ready, wait): (Vec<Packet>, Vec<Packet>) = pending
            .into_iter()
            .partition(|p| Self::packet_element_index(p) <= next_expected);
        gate.pending = wait;
        for packet in ready {
            self.serve_mem_request(packet, ctx_cycle);
        }
    }

    /// Fail all queued and future ordered requests for a barrier whose
    /// element faulted.
    pub fn gate_abort(&mut self, parent_ident: u32, ctx_cycle: u64) {
        let Some(gate) = self.gates.get_mut(&parent_ident) else { return };
        gate.aborted = true;
        let pending = std::mem::take(&mut gate.pending);
        for packet in pending {
            self.serve_mem_request(packet, ctx_cycle);
        }
    }

    pub fn gate_close(&mut self, parent_ident: u32) {
        if let Some(gate) = self.gates.remove(&parent_ident) {
            assert!(gate.pending.is_empty(), "ordered requests left at gate close");
        }
    }

    pub fn step(&mut self, ctx: &mut StepCtx) {
        for channel in 0..self.params.n_channels {
            if let Some(packet) = self.consume_word(channel, ctx) {
                self.handle_packet(packet, ctx);
            }
        }
        self.step_send();
    }

    pub fn step_routers(&mut self, cycle: u64) {
        for router in &mut self.routers {
            router.step(cycle);
        }
    }

    pub fn update(&mut self) {
        for router in &mut self.routers {
            router.update();
        }
    }

    fn consume_word(&mut self, channel: usize, ctx: &mut StepCtx) -> Option<Packet> {
        let router = &mut self.routers[channel];
        let slot = &mut self.assembling[channel];
        if slot.is_none() {
            let header = match router.output_head(Direction::H)? {
                Flit::Header(h) => h.clone(),
                other => panic!("front-end stream starts with {other:?}"),
            };
            router.pop_output(Direction::H);
            ctx.monitor.record_message_received(
                ctx.cycle,
                header.message_type.name(),
                header.ident,
                (0, -1),
            );
            if header.length == 1 {
                return Some(Packet::header_only(header));
            }
            *slot = Some(PartialPacket { header, payload: Vec::new() });
            return None;
        }
        if router.has_output(Direction::H) {
            let word = router.pop_output(Direction::H);
            let partial = slot.as_mut().unwrap();
            partial.payload.push(word);
            if partial.remaining() == 0 {
                let partial = slot.take().unwrap();
                return Some(Packet::new(partial.header, partial.payload));
            }
        }
        None
    }

    fn handle_packet(&mut self, packet: Packet, ctx: &mut StepCtx) {
        match packet.header.message_type {
            MessageType::ReadMemWordReq | MessageType::WriteMemWordReq => {
                self.handle_mem_request(packet, ctx.cycle);
            }
            MessageType::LoadIndexedElementResp | MessageType::StoreIndexedElementResp => {
                let (element_index, masked, fault) = match packet.header.ext {
                    HeaderExt::ElementIndex { element_index, masked, fault } => {
                        (element_index, masked, fault)
                    }
                    ref ext => panic!("element response with {ext:?}"),
                };
                self.element_resps
                    .insert(packet.header.ident, ElementResp { element_index, masked, fault });
            }
            MessageType::ReadBytesResp => {
                let mut bytes = Vec::new();
                for flit in &packet.payload {
                    bytes.extend_from_slice(flit.as_data());
                }
                let promise = self
                    .read_bytes_promises
                    .remove(&packet.header.ident)
                    .expect("probe-read response nobody expects");
                promise.set(bytes);
            }
            other => panic!("front-end received {}", other.name()),
        }
    }

    fn handle_mem_request(&mut self, packet: Packet, cycle: u64) {
        let (ordered, parent_ident, element_index) = match packet.header.ext {
            HeaderExt::ReadMemWord { ordered, parent_ident, element_index, .. } => {
                (ordered, parent_ident, element_index)
            }
            HeaderExt::WriteMemWord { ordered, parent_ident, element_index, .. } => {
                (ordered, parent_ident, element_index)
            }
            ref ext => panic!("memory request with {ext:?}"),
        };
        if ordered {
            let gate = self
                .gates
                .get_mut(&parent_ident)
                .expect("ordered request with no open gate");
            if !gate.aborted && element_index > gate.next_expected {
                gate.pending.push(packet);
                return;
            }
        }
        self.serve_mem_request(packet, cycle);
    }

    fn serve_mem_request(&mut self, packet: Packet, cycle: u64) {
        let header = &packet.header;
        let aborted = match header.ext {
            HeaderExt::ReadMemWord { ordered, parent_ident, .. }
            | HeaderExt::WriteMemWord { ordered, parent_ident, .. } => {
                ordered && self.gates.get(&parent_ident).map(|g| g.aborted).unwrap_or(false)
            }
            _ => false,
        };
        let addr = match packet.payload[0].as_addr() {
            MemAddr::Scalar(addr) => *addr,
            MemAddr::Vpu(km) => panic!("VPU address {km:?} routed to the front-end"),
        };
        let wb = self.params.word_bytes;
        match header.message_type {
            MessageType::ReadMemWordReq => {
                let (tag, element_index) = match header.ext {
                    HeaderExt::ReadMemWord { tag, element_index, .. } => (tag, element_index),
                    _ => unreachable!(),
                };
                let (length, payload) = if aborted {
                    (1, Vec::new())
                } else {
                    let n = wb.min(self.mem.len().saturating_sub(addr as usize));
                    let mut word = self.read_scalar(addr, n);
                    word.resize(wb, 0);
                    if self.is_non_idempotent(addr) {
                        self.non_idempotent_access_log.push(ScalarAccess {
                            is_write: false,
                            addr,
                            n_bytes: wb,
                        });
                    }
                    (2, vec![Flit::Data(word)])
                };
                debug!(
                    "{cycle}: front-end: scalar read {addr:#x} for ({}, {}) aborted={aborted}",
                    header.source_x, header.source_y
                );
                let resp = Header {
                    message_type: MessageType::ReadMemWordResp,
                    send_type: SendType::Single,
                    length,
                    source_x: 0,
                    source_y: -1,
                    target_x: header.source_x,
                    target_y: header.source_y,
                    ident: header.ident,
                    ext: HeaderExt::ReadMemWord {
                        tag,
                        element_index,
                        ordered: false,
                        parent_ident: 0,
                        fault: aborted,
                    },
                };
                self.send_queue.push_back(Packet::new(resp, payload));
            }
            MessageType::WriteMemWordReq => {
                let (tag, n_bytes) = match header.ext {
                    HeaderExt::WriteMemWord { tag, n_bytes, .. } => (tag, n_bytes),
                    _ => unreachable!(),
                };
                if aborted {
                    // An earlier element faulted: the write is suppressed
                    // but still acknowledged so the requester can retire.
                    debug!(
                        "{cycle}: front-end: suppressed scalar write {addr:#x} from ({}, {})",
                        header.source_x, header.source_y
                    );
                } else {
                    let data = packet.payload[1].as_data();
                    self.write_scalar(addr, &data[tag..tag + n_bytes]);
                    if self.is_non_idempotent(addr) {
                        self.non_idempotent_access_log.push(ScalarAccess {
                            is_write: true,
                            addr,
                            n_bytes,
                        });
                    }
                    debug!(
                        "{cycle}: front-end: scalar write {addr:#x} ({n_bytes} bytes) from \
                         ({}, {})",
                        header.source_x, header.source_y
                    );
                }
                let resp = Header {
                    message_type: MessageType::WriteMemWordResp,
                    send_type: SendType::Single,
                    length: 1,
                    source_x: 0,
                    source_y: -1,
                    target_x: header.source_x,
                    target_y: header.source_y,
                    ident: header.ident,
                    ext: HeaderExt::Tagged { tag, mask: 0 },
                };
                self.send_queue.push_back(Packet::header_only(resp));
            }
            _ => unreachable!(),
        }
    }

    fn step_send(&mut self) {
        if self.sending.is_none() {
            if let Some(packet) = self.send_queue.pop_front() {
                let channel = packet.header.message_type.channel();
                assert_eq!(channel, 0, "front-end sends on channel 0 only");
                self.sending = Some(packet.into_flits().collect());
            }
        }
        if let Some(flits) = &mut self.sending {
            let router = &mut self.routers[0];
            if router.has_input_room(Direction::H) {
                router.receive(Direction::H, flits.pop_front().unwrap());
            }
            if flits.is_empty() {
                self.sending = None;
            }
        }
    }
}
