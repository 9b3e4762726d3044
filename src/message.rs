use crate::addresses::KMAddr;
use crate::kinstr::KInstr;

/// Router port directions. `H` is the host port of the owning component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    N,
    S,
    E,
    W,
    H,
}

pub const DIRECTIONS: [Direction; 5] =
    [Direction::N, Direction::S, Direction::E, Direction::W, Direction::H];

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::N => 0,
            Direction::S => 1,
            Direction::E => 2,
            Direction::W => 3,
            Direction::H => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendType {
    Single,
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Coherence.
    ReadLine,
    ReadLineResp,
    WriteLine,
    WriteLineResp,
    WriteLineReadLine,
    WriteLineReadLineResp,
    WriteLineReadLineDrop,
    // Jamlet-to-jamlet vector transfer.
    LoadJ2JWordsReq,
    LoadJ2JWordsResp,
    LoadJ2JWordsDrop,
    StoreJ2JWordsReq,
    StoreJ2JWordsResp,
    StoreJ2JWordsDrop,
    StoreJ2JWordsRetry,
    // Memory word gather/scatter.
    ReadMemWordReq,
    ReadMemWordResp,
    ReadMemWordDrop,
    WriteMemWordReq,
    WriteMemWordResp,
    WriteMemWordDrop,
    WriteMemWordRetry,
    // Ordered per-element indexed.
    LoadIndexedElementResp,
    StoreIndexedElementResp,
    // Register-to-register gather.
    ReadRegElementReq,
    ReadRegElementResp,
    ReadRegElementDrop,
    // Control.
    Instructions,
    ReadBytesResp,
}

impl MessageType {
    /// Static virtual-channel binding. Channel 0 carries only messages the
    /// receiver can always consume without sending anything on channel 0.
    pub fn channel(self) -> usize {
        match self {
            MessageType::ReadLine
            | MessageType::WriteLine
            | MessageType::WriteLineReadLine
            | MessageType::LoadJ2JWordsReq
            | MessageType::StoreJ2JWordsReq
            | MessageType::ReadMemWordReq
            | MessageType::WriteMemWordReq
            | MessageType::ReadRegElementReq => 1,
            _ => 0,
        }
    }

    pub fn is_request(self) -> bool {
        self.channel() != 0
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::ReadLine => "READ_LINE",
            MessageType::ReadLineResp => "READ_LINE_RESP",
            MessageType::WriteLine => "WRITE_LINE",
            MessageType::WriteLineResp => "WRITE_LINE_RESP",
            MessageType::WriteLineReadLine => "WRITE_LINE_READ_LINE",
            MessageType::WriteLineReadLineResp => "WRITE_LINE_READ_LINE_RESP",
            MessageType::WriteLineReadLineDrop => "WRITE_LINE_READ_LINE_DROP",
            MessageType::LoadJ2JWordsReq => "LOAD_J2J_WORDS_REQ",
            MessageType::LoadJ2JWordsResp => "LOAD_J2J_WORDS_RESP",
            MessageType::LoadJ2JWordsDrop => "LOAD_J2J_WORDS_DROP",
            MessageType::StoreJ2JWordsReq => "STORE_J2J_WORDS_REQ",
            MessageType::StoreJ2JWordsResp => "STORE_J2J_WORDS_RESP",
            MessageType::StoreJ2JWordsDrop => "STORE_J2J_WORDS_DROP",
            MessageType::StoreJ2JWordsRetry => "STORE_J2J_WORDS_RETRY",
            MessageType::ReadMemWordReq => "READ_MEM_WORD_REQ",
            MessageType::ReadMemWordResp => "READ_MEM_WORD_RESP",
            MessageType::ReadMemWordDrop => "READ_MEM_WORD_DROP",
            MessageType::WriteMemWordReq => "WRITE_MEM_WORD_REQ",
            MessageType::WriteMemWordResp => "WRITE_MEM_WORD_RESP",
            MessageType::WriteMemWordDrop => "WRITE_MEM_WORD_DROP",
            MessageType::WriteMemWordRetry => "WRITE_MEM_WORD_RETRY",
            MessageType::LoadIndexedElementResp => "LOAD_INDEXED_ELEMENT_RESP",
            MessageType::StoreIndexedElementResp => "STORE_INDEXED_ELEMENT_RESP",
            MessageType::ReadRegElementReq => "READ_REG_ELEMENT_REQ",
            MessageType::ReadRegElementResp => "READ_REG_ELEMENT_RESP",
            MessageType::ReadRegElementDrop => "READ_REG_ELEMENT_DROP",
            MessageType::Instructions => "INSTRUCTIONS",
            MessageType::ReadBytesResp => "READ_BYTES_RESP",
        }
    }
}

/// Message-specific header fields, discriminated by `message_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderExt {
    Plain,
    Tagged {
        tag: usize,
        /// Per-payload-word predicate bits for store transfers.
        mask: u64,
    },
    /// Line messages: the SRAM address the response targets.
    Address { address: u64 },
    ElementIndex {
        element_index: usize,
        masked: bool,
        fault: bool,
    },
    ReadMemWord {
        tag: usize,
        element_index: usize,
        ordered: bool,
        parent_ident: u32,
        fault: bool,
    },
    WriteMemWord {
        tag: usize,
        dst_byte_in_word: usize,
        n_bytes: usize,
        element_index: usize,
        ordered: bool,
        parent_ident: u32,
    },
    RegElement {
        tag: usize,
        src_reg: usize,
        src_byte_offset: usize,
        n_bytes: usize,
    },
}

/// First word of every packet. Self-describing: the router reads routing
/// fields, receivers read the subtype fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub message_type: MessageType,
    pub send_type: SendType,
    /// Packet length in words, including this header.
    pub length: usize,
    pub source_x: i32,
    pub source_y: i32,
    pub target_x: i32,
    pub target_y: i32,
    pub ident: u32,
    pub ext: HeaderExt,
}

impl Header {
    pub fn tag(&self) -> usize {
        match &self.ext {
            HeaderExt::Tagged { tag, .. }
            | HeaderExt::ReadMemWord { tag, .. }
            | HeaderExt::WriteMemWord { tag, .. }
            | HeaderExt::RegElement { tag, .. } => *tag,
            _ => panic!("{} header carries no tag", self.message_type.name()),
        }
    }
}

/// A memory address carried as a payload word.
#[derive(Debug, Clone, PartialEq)]
pub enum MemAddr {
    Vpu(KMAddr),
    Scalar(u64),
}

/// One router word.
#[derive(Debug, Clone)]
pub enum Flit {
    Header(Header),
    Data(Vec<u8>),
    Addr(MemAddr),
    Instr(KInstr),
}

impl Flit {
    pub fn is_header(&self) -> bool {
        matches!(self, Flit::Header(_))
    }

    pub fn as_data(&self) -> &[u8] {
        match self {
            Flit::Data(bytes) => bytes,
            other => panic!("expected data word, got {other:?}"),
        }
    }

    pub fn as_addr(&self) -> &MemAddr {
        match self {
            Flit::Addr(addr) => addr,
            other => panic!("expected address word, got {other:?}"),
        }
    }
}

/// An assembled packet: header plus `length - 1` payload words.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<Flit>,
}

impl Packet {
    pub fn new(header: Header, payload: Vec<Flit>) -> Self {
        assert_eq!(header.length, payload.len() + 1, "header length mismatch");
        Packet { header, payload }
    }

    pub fn header_only(header: Header) -> Self {
        Packet::new(header, Vec::new())
    }

    /// The packet as the word sequence a router carries.
    pub fn into_flits(self) -> impl Iterator<Item = Flit> {
        std::iter::once(Flit::Header(self.header)).chain(self.payload)
    }
}
