use bytes::{Buf, BufMut};

/// Byte order of the link, independent of host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub(crate) fn put_u32(self, out: &mut impl BufMut, value: u32) {
        match self {
            Endianness::Big => out.put_u32(value),
            Endianness::Little => out.put_u32_le(value),
        }
    }

    pub(crate) fn get_u32(self, src: &mut impl Buf) -> u32 {
        match self {
            Endianness::Big => src.get_u32(),
            Endianness::Little => src.get_u32_le(),
        }
    }

    pub(crate) fn put_u64(self, out: &mut impl BufMut, value: u64) {
        match self {
            Endianness::Big => out.put_u64(value),
            Endianness::Little => out.put_u64_le(value),
        }
    }

    pub(crate) fn get_u64(self, src: &mut impl Buf) -> u64 {
        match self {
            Endianness::Big => src.get_u64(),
            Endianness::Little => src.get_u64_le(),
        }
    }
}

/// Protocol generation / header word width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChdrW {
    /// Legacy 32-bit VRT-derived framing: two 32-bit header words (flags +
    /// flat stream id), 12-bit sequence counter, no metadata words.
    W32,
    /// 64-bit CHDR framing: one 64-bit header word with a destination
    /// endpoint id, 16-bit sequence counter, up to 31 metadata words.
    W64,
}

impl ChdrW {
    /// Modulus mask of the sequence counter in this generation.
    pub fn seq_mask(self) -> u16 {
        match self {
            ChdrW::W32 => 0x0FFF,
            ChdrW::W64 => 0xFFFF,
        }
    }
}

/// CHDR packet type.
///
/// The legacy 32-bit framing encodes only the first four (2 bits on the
/// wire); `Mgmt` and `Error` exist only in the 64-bit generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    FlowCtrl,
    Ctrl,
    Response,
    Mgmt,
    Error,
}

impl PacketType {
    pub(crate) fn to_bits(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::FlowCtrl => 1,
            PacketType::Ctrl => 2,
            PacketType::Response => 3,
            PacketType::Mgmt => 4,
            PacketType::Error => 5,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::FlowCtrl),
            2 => Some(PacketType::Ctrl),
            3 => Some(PacketType::Response),
            4 => Some(PacketType::Mgmt),
            5 => Some(PacketType::Error),
            _ => None,
        }
    }
}

/// Routing identifier carried in the header; the variant follows the
/// protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstId {
    /// Flat 32-bit stream id (legacy framing).
    Sid(u32),
    /// 16-bit destination endpoint id (64-bit framing). Source endpoint ids
    /// ride in the typed payloads, not the header.
    Epid(u16),
}

impl DstId {
    pub fn sid(self) -> Option<u32> {
        match self {
            DstId::Sid(sid) => Some(sid),
            DstId::Epid(_) => None,
        }
    }

    pub fn epid(self) -> Option<u16> {
        match self {
            DstId::Epid(epid) => Some(epid),
            DstId::Sid(_) => None,
        }
    }
}

/// Parsed CHDR header.
///
/// `length` is the total packet length in bytes; it is computed by the codec
/// on pack and recovered on unpack — callers never fill it in themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChdrHeader {
    pub pkt_type: PacketType,
    /// End-of-burst flag.
    pub eob: bool,
    /// Error flag (64-bit generation only).
    pub error: bool,
    /// Sequence counter; wraps modulo the generation's counter width.
    pub seq_num: u16,
    /// Total packet length in bytes, header included.
    pub length: u16,
    pub dst: DstId,
}

impl ChdrHeader {
    pub fn new(pkt_type: PacketType, dst: DstId) -> Self {
        Self {
            pkt_type,
            eob: false,
            error: false,
            seq_num: 0,
            length: 0,
            dst,
        }
    }

    pub fn with_seq_num(mut self, seq_num: u16) -> Self {
        self.seq_num = seq_num;
        self
    }

    pub fn with_eob(mut self, eob: bool) -> Self {
        self.eob = eob;
        self
    }

    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }
}
