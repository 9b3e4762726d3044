use std::collections::{HashMap, VecDeque};

use crate::addresses::k_indices_to_j_coords;
use crate::jamlet::PartialPacket;
use crate::kamlet::StepCtx;
use crate::message::{Direction, Flit, Header, HeaderExt, MessageType, Packet, SendType};
use crate::params::LamletParams;
use crate::router::Router;
use crate::utils;

/// Memlets line the west and east edges, one per kamlet: west for the left
/// half of the kamlet columns, east for the rest (all west when there is a
/// single column). Each occupies `j_rows` router rows beside its kamlet.
pub fn memlet_is_west(params: &LamletParams, k_index: usize) -> bool {
    let k_x = k_index % params.k_cols;
    k_x < (params.k_cols + 1) / 2
}

pub fn memlet_router_coords(params: &LamletParams, k_index: usize) -> Vec<(i32, i32)> {
    let k_y = k_index / params.k_cols;
    let x = if memlet_is_west(params, k_index) { -1 } else { params.grid_cols() as i32 };
    (0..params.j_rows)
        .map(|r| (x, (k_y * params.j_rows + r) as i32))
        .collect()
}

/// The memlet router a jamlet's line traffic targets: the one beside its
/// own grid row.
pub fn jamlet_coords_to_m_router_coords(params: &LamletParams, j_x: i32, j_y: i32) -> (i32, i32) {
    let k_x = j_x as usize / params.j_cols;
    let x = if k_x < (params.k_cols + 1) / 2 { -1 } else { params.grid_cols() as i32 };
    (x, j_y)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineServiceKind {
    Read,
    WriteRead,
    Write,
}

/// One line fetch/eviction being collected from a kamlet's jamlets.
struct LineService {
    ident: u32,
    kind: LineServiceKind,
    read_addr: u64,
    write_addr: u64,
    /// SRAM address the responses deliver into.
    sram_addr: u64,
    write_slices: Vec<Option<Vec<u8>>>,
    received: usize,
}

const N_LINE_SERVICES: usize = 4;

/// A memory-side tile giving one kamlet access to off-chip DRAM lines.
pub struct Memlet {
    params: LamletParams,
    pub k_index: usize,
    pub coords: Vec<(i32, i32)>,
    /// Routers indexed `[router][channel]`.
    pub routers: Vec<Vec<Router>>,
    assembling: Vec<Vec<Option<PartialPacket>>>,
    lines: HashMap<u64, Vec<u8>>,
    in_service: Vec<LineService>,
    send_queues: Vec<VecDeque<Packet>>,
    sending: Vec<Option<VecDeque<Flit>>>,
}

impl Memlet {
    pub fn new(params: &LamletParams, k_index: usize) -> Self {
        let coords = memlet_router_coords(params, k_index);
        Memlet {
            params: params.clone(),
            k_index,
            routers: coords
                .iter()
                .map(|&(x, y)| {
                    (0..params.n_channels).map(|ch| Router::new(params, x, y, ch)).collect()
                })
                .collect(),
            assembling: coords
                .iter()
                .map(|_| (0..params.n_channels).map(|_| None).collect())
                .collect(),
            coords,
            lines: HashMap::new(),
            in_service: Vec::new(),
            send_queues: (0..params.j_rows).map(|_| VecDeque::new()).collect(),
            sending: (0..params.j_rows).map(|_| None).collect(),
        }
    }

    fn write_line(&mut self, address: u64, data: Vec<u8>, cycle: u64) {
        assert_eq!(address % self.params.cache_line_bytes as u64, 0);
        debug!("{cycle}: memlet {}: writing line {address:#x}", self.k_index);
        self.lines.insert(address, data);
    }

    fn read_line(&mut self, address: u64, cycle: u64) -> Vec<u8> {
        assert_eq!(address % self.params.cache_line_bytes as u64, 0);
        debug!("{cycle}: memlet {}: reading line {address:#x}", self.k_index);
        self.lines
            .get(&address)
            .cloned()
            .unwrap_or_else(|| vec![0; self.params.cache_line_bytes])
    }

    pub fn step(&mut self, ctx: &mut StepCtx) {
        self.receive_phase(ctx);
        self.process_phase(ctx);
        self.send_phase();
    }

    pub fn step_routers(&mut self, cycle: u64) {
        for routers in &mut self.routers {
            for router in routers {
                router.step(cycle);
            }
        }
    }

    pub fn update(&mut self) {
        for routers in &mut self.routers {
            for router in routers {
                router.update();
            }
        }
    }

    fn receive_phase(&mut self, ctx: &mut StepCtx) {
        for r in 0..self.routers.len() {
            for channel in 0..self.params.n_channels {
                if let Some(packet) = self.consume_word(r, channel) {
                    self.handle_packet(packet, ctx);
                }
            }
        }
    }

    fn consume_word(&mut self, r: usize, channel: usize) -> Option<Packet> {
        let router = &mut self.routers[r][channel];
        let slot = &mut self.assembling[r][channel];
        if slot.is_none() {
            let header = match router.output_head(Direction::H)? {
                Flit::Header(h) => h.clone(),
                other => panic!("memlet stream starts with {other:?}"),
            };
            router.pop_output(Direction::H);
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

    fn source_j_in_k(&self, header: &Header) -> usize {
        let j_in_k_x = header.source_x as usize % self.params.j_cols;
        let j_in_k_y = header.source_y as usize % self.params.j_rows;
        j_in_k_y * self.params.j_cols + j_in_k_x
    }

    fn handle_packet(&mut self, packet: Packet, ctx: &mut StepCtx) {
        let header = packet.header.clone();
        let kind = match header.message_type {
            MessageType::ReadLine => LineServiceKind::Read,
            MessageType::WriteLineReadLine => LineServiceKind::WriteRead,
            MessageType::WriteLine => LineServiceKind::Write,
            other => panic!("memlet received {}", other.name()),
        };
        let j = self.source_j_in_k(&header);
        let sram_addr = match header.ext {
            HeaderExt::Address { address } => address,
            ref ext => panic!("line request with {ext:?}"),
        };
        if !self.in_service.iter().any(|s| s.ident == header.ident) {
            if self.in_service.len() >= N_LINE_SERVICES {
                // Only the write-read path has a drop message; the service
                // table is sized so the others never overflow.
                assert_eq!(kind, LineServiceKind::WriteRead, "memlet service table exhausted");
                self.queue_drop(&header);
                return;
            }
            let (write_addr, read_addr) = match kind {
                LineServiceKind::Read => (0, utils::word_to_u64(packet.payload[0].as_data())),
                LineServiceKind::WriteRead => (
                    utils::word_to_u64(packet.payload[0].as_data()),
                    utils::word_to_u64(packet.payload[1].as_data()),
                ),
                LineServiceKind::Write => (utils::word_to_u64(packet.payload[0].as_data()), 0),
            };
            self.in_service.push(LineService {
                ident: header.ident,
                kind,
                read_addr,
                write_addr,
                sram_addr,
                write_slices: vec![None; self.params.j_in_k()],
                received: 0,
            });
        }
        let service = self
            .in_service
            .iter_mut()
            .find(|s| s.ident == header.ident)
            .unwrap();
        assert_eq!(service.kind, kind);
        assert!(service.write_slices[j].is_none(), "duplicate line packet from jamlet {j}");
        let slice_words = match kind {
            LineServiceKind::Read => 1,
            LineServiceKind::WriteRead => 2,
            LineServiceKind::Write => 1,
        };
        let mut slice = Vec::new();
        for flit in &packet.payload[slice_words..] {
            slice.extend_from_slice(flit.as_data());
        }
        if kind != LineServiceKind::Read {
            assert_eq!(slice.len(), self.params.line_bytes_per_jamlet());
        }
        service.write_slices[j] = Some(slice);
        service.received += 1;
        debug!(
            "{}: memlet {}: {} from jamlet {j} ({}/{})",
            ctx.cycle, self.k_index, header.message_type.name(),
            service.received, self.params.j_in_k()
        );
    }

    fn queue_drop(&mut self, rcvd: &Header) {
        let r = (rcvd.source_y as usize) % self.params.j_rows;
        let (x, y) = self.coords[r];
        let header = Header {
            message_type: MessageType::WriteLineReadLineDrop,
            send_type: SendType::Single,
            length: 1,
            source_x: x,
            source_y: y,
            target_x: rcvd.source_x,
            target_y: rcvd.source_y,
            ident: rcvd.ident,
            ext: HeaderExt::Plain,
        };
        self.send_queues[r].push_back(Packet::header_only(header));
    }

    fn process_phase(&mut self, ctx: &mut StepCtx) {
        let params = self.params.clone();
        let j_in_k = params.j_in_k();
        let kvb = params.kamlet_vline_bytes();
        let wb = params.word_bytes;
        let done: Vec<usize> = self
            .in_service
            .iter()
            .enumerate()
            .filter(|(_, s)| s.received == j_in_k)
            .map(|(i, _)| i)
            .collect();
        for index in done.into_iter().rev() {
            let service = self.in_service.remove(index);
            // Aggregate the per-jamlet slices into the DRAM line.
            if service.kind != LineServiceKind::Read {
                let mut line = vec![0u8; params.cache_line_bytes];
                for (j, slice) in service.write_slices.iter().enumerate() {
                    let slice = slice.as_ref().unwrap();
                    for v in 0..params.vlines_in_cache_line() {
                        let dst = v * kvb + j * wb;
                        line[dst..dst + wb].copy_from_slice(&slice[v * wb..(v + 1) * wb]);
                    }
                }
                self.write_line(service.write_addr, line, ctx.cycle);
            }
            match service.kind {
                LineServiceKind::Write => {
                    // A single acknowledgement to the kamlet origin.
                    let (tx, ty) = k_indices_to_j_coords(&params, self.k_index, 0);
                    let (sx, sy) = self.coords[0];
                    let header = Header {
                        message_type: MessageType::WriteLineResp,
                        send_type: SendType::Single,
                        length: 1,
                        source_x: sx,
                        source_y: sy,
                        target_x: tx,
                        target_y: ty,
                        ident: service.ident,
                        ext: HeaderExt::Plain,
                    };
                    self.send_queues[0].push_back(Packet::header_only(header));
                }
                LineServiceKind::Read | LineServiceKind::WriteRead => {
                    let message_type = if service.kind == LineServiceKind::Read {
                        MessageType::ReadLineResp
                    } else {
                        MessageType::WriteLineReadLineResp
                    };
                    let line = self.read_line(service.read_addr, ctx.cycle);
                    for j in 0..j_in_k {
                        let payload: Vec<Flit> = (0..params.vlines_in_cache_line())
                            .map(|v| {
                                let src = v * kvb + j * wb;
                                Flit::Data(line[src..src + wb].to_vec())
                            })
                            .collect();
                        let (tx, ty) = k_indices_to_j_coords(&params, self.k_index, j);
                        let r = (ty as usize) % params.j_rows;
                        let (sx, sy) = self.coords[r];
                        let header = Header {
                            message_type,
                            send_type: SendType::Single,
                            length: 1 + payload.len(),
                            source_x: sx,
                            source_y: sy,
                            target_x: tx,
                            target_y: ty,
                            ident: service.ident,
                            ext: HeaderExt::Address { address: service.sram_addr },
                        };
                        self.send_queues[r].push_back(Packet::new(header, payload));
                    }
                }
            }
        }
    }

    fn send_phase(&mut self) {
        for r in 0..self.routers.len() {
            if self.sending[r].is_none() {
                if let Some(packet) = self.send_queues[r].pop_front() {
                    self.sending[r] = Some(packet.into_flits().collect());
                }
            }
            if let Some(flits) = &mut self.sending[r] {
                let router = &mut self.routers[r][0];
                if router.has_input_room(Direction::H) {
                    router.receive(Direction::H, flits.pop_front().unwrap());
                }
                if flits.is_empty() {
                    self.sending[r] = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memlet_placement_single_column() {
        let params = LamletParams::small();
        assert!(memlet_is_west(&params, 0));
        assert!(memlet_is_west(&params, 1));
        assert_eq!(memlet_router_coords(&params, 0), vec![(-1, 0)]);
        assert_eq!(memlet_router_coords(&params, 1), vec![(-1, 1)]);
        assert_eq!(jamlet_coords_to_m_router_coords(&params, 0, 1), (-1, 1));
    }

    #[test]
    fn test_memlet_placement_split_columns() {
        let params = LamletParams::square();
        assert!(memlet_is_west(&params, 0));
        assert!(!memlet_is_west(&params, 1));
        assert_eq!(memlet_router_coords(&params, 0), vec![(-1, 0)]);
        assert_eq!(memlet_router_coords(&params, 1), vec![(4, 0)]);
        assert_eq!(memlet_router_coords(&params, 2), vec![(-1, 1)]);
        assert_eq!(jamlet_coords_to_m_router_coords(&params, 3, 1), (4, 1));
    }
}
