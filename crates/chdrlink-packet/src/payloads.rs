//! Typed payload codecs for the 64-bit CHDR generation.
//!
//! Control transactions, stream status (the flow-control acknowledgment
//! body), stream commands, and management transactions all serialize to
//! sequences of 64-bit words in link byte order. The bit layouts follow the
//! RFNoC wire format; field widths narrower than their Rust types are masked
//! on serialize and zero-extended on deserialize.

use crate::error::{ChdrError, Result};
use crate::header::{Endianness, PacketType};

fn mask(width: u32) -> u64 {
    (1u64 << width) - 1
}

fn field(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & mask(width)
}

fn write_words(dst: &mut [u8], words: &[u64], endianness: Endianness) -> Result<usize> {
    let nbytes = words.len() * 8;
    if nbytes > dst.len() {
        return Err(ChdrError::PayloadTooLarge {
            size: nbytes,
            max: dst.len(),
        });
    }
    let mut out = &mut dst[..];
    for &word in words {
        endianness.put_u64(&mut out, word);
    }
    Ok(nbytes)
}

fn read_word(src: &[u8], index: usize, endianness: Endianness) -> Result<u64> {
    let start = index * 8;
    if src.len() < start + 8 {
        return Err(ChdrError::MalformedPacket {
            reason: "payload shorter than its declared word count",
        });
    }
    Ok(endianness.get_u64(&mut &src[start..]))
}

//
// Control transaction payload
//

/// Operation code of a control transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlOpCode {
    Sleep,
    Write,
    Read,
    ReadWrite,
    BlockWrite,
    BlockRead,
    Poll,
    User1,
    User2,
    User3,
    User4,
    User5,
    User6,
}

impl CtrlOpCode {
    fn to_bits(self) -> u8 {
        match self {
            CtrlOpCode::Sleep => 0x0,
            CtrlOpCode::Write => 0x1,
            CtrlOpCode::Read => 0x2,
            CtrlOpCode::ReadWrite => 0x3,
            CtrlOpCode::BlockWrite => 0x4,
            CtrlOpCode::BlockRead => 0x5,
            CtrlOpCode::Poll => 0x6,
            CtrlOpCode::User1 => 0xA,
            CtrlOpCode::User2 => 0xB,
            CtrlOpCode::User3 => 0xC,
            CtrlOpCode::User4 => 0xD,
            CtrlOpCode::User5 => 0xE,
            CtrlOpCode::User6 => 0xF,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(CtrlOpCode::Sleep),
            0x1 => Some(CtrlOpCode::Write),
            0x2 => Some(CtrlOpCode::Read),
            0x3 => Some(CtrlOpCode::ReadWrite),
            0x4 => Some(CtrlOpCode::BlockWrite),
            0x5 => Some(CtrlOpCode::BlockRead),
            0x6 => Some(CtrlOpCode::Poll),
            0xA => Some(CtrlOpCode::User1),
            0xB => Some(CtrlOpCode::User2),
            0xC => Some(CtrlOpCode::User3),
            0xD => Some(CtrlOpCode::User4),
            0xE => Some(CtrlOpCode::User5),
            0xF => Some(CtrlOpCode::User6),
            _ => None,
        }
    }
}

/// Completion status reported by the responding endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlStatus {
    Okay,
    CmdErr,
    TsErr,
    Warning,
}

impl CtrlStatus {
    fn to_bits(self) -> u8 {
        match self {
            CtrlStatus::Okay => 0,
            CtrlStatus::CmdErr => 1,
            CtrlStatus::TsErr => 2,
            CtrlStatus::Warning => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => CtrlStatus::CmdErr,
            2 => CtrlStatus::TsErr,
            3 => CtrlStatus::Warning,
            _ => CtrlStatus::Okay,
        }
    }
}

/// Body of a control transaction packet (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlPayload {
    /// Destination port for the transaction (10 bits).
    pub dst_port: u16,
    /// Source port for the transaction (10 bits).
    pub src_port: u16,
    /// Transaction sequence number (6 bits).
    pub seq_num: u8,
    pub timestamp: Option<u64>,
    pub is_ack: bool,
    /// Endpoint id of the transaction's originator.
    pub src_epid: u16,
    /// Register address (20 bits).
    pub address: u32,
    /// Byte-enable mask (4 bits).
    pub byte_enable: u8,
    pub op_code: CtrlOpCode,
    pub status: CtrlStatus,
    /// Transaction data words; 1 to 15 entries.
    pub data: Vec<u32>,
}

impl Default for CtrlPayload {
    fn default() -> Self {
        Self {
            dst_port: 0,
            src_port: 0,
            seq_num: 0,
            timestamp: None,
            is_ack: false,
            src_epid: 0,
            address: 0,
            byte_enable: 0xF,
            op_code: CtrlOpCode::Sleep,
            status: CtrlStatus::Okay,
            data: vec![0],
        }
    }
}

impl CtrlPayload {
    pub fn packet_type(&self) -> PacketType {
        if self.is_ack {
            PacketType::Response
        } else {
            PacketType::Ctrl
        }
    }

    /// Serialized size in bytes.
    pub fn packed_nbytes(&self) -> usize {
        let operations = 1 + self.data.len();
        (1 + usize::from(self.timestamp.is_some()) + operations / 2 + operations % 2) * 8
    }

    pub fn serialize(&self, dst: &mut [u8], endianness: Endianness) -> Result<usize> {
        if self.data.is_empty() || self.data.len() > 15 {
            return Err(ChdrError::Unrepresentable {
                what: "control payload data word count outside 1..=15",
            });
        }

        let mut words = Vec::with_capacity(self.packed_nbytes() / 8);
        words.push(
            (u64::from(self.dst_port) & mask(10))
                | ((u64::from(self.src_port) & mask(10)) << 10)
                | ((self.data.len() as u64) << 20)
                | ((u64::from(self.seq_num) & mask(6)) << 24)
                | (u64::from(self.timestamp.is_some()) << 30)
                | (u64::from(self.is_ack) << 31)
                | (u64::from(self.src_epid) << 32),
        );
        if let Some(ts) = self.timestamp {
            words.push(ts);
        }
        words.push(
            (u64::from(self.address) & mask(20))
                | ((u64::from(self.byte_enable) & mask(4)) << 20)
                | (u64::from(self.op_code.to_bits()) << 24)
                | (u64::from(self.status.to_bits()) << 30)
                | (u64::from(self.data[0]) << 32),
        );
        let mut i = 1;
        while i < self.data.len() {
            let hi = self.data.get(i + 1).copied().unwrap_or(0);
            words.push(u64::from(self.data[i]) | (u64::from(hi) << 32));
            i += 2;
        }

        write_words(dst, &words, endianness)
    }

    pub fn deserialize(src: &[u8], endianness: Endianness) -> Result<Self> {
        let word0 = read_word(src, 0, endianness)?;
        let num_data = field(word0, 20, 4) as usize;
        if num_data == 0 {
            return Err(ChdrError::MalformedPacket {
                reason: "control payload with zero data words",
            });
        }
        let has_time = field(word0, 30, 1) != 0;

        let mut index = 1;
        let timestamp = if has_time {
            let ts = read_word(src, index, endianness)?;
            index += 1;
            Some(ts)
        } else {
            None
        };

        let op_word = read_word(src, index, endianness)?;
        index += 1;
        let op_code = CtrlOpCode::from_bits(field(op_word, 24, 4) as u8).ok_or(
            ChdrError::MalformedPacket {
                reason: "undefined control opcode",
            },
        )?;

        let mut data = vec![0u32; num_data];
        data[0] = field(op_word, 32, 32) as u32;
        let mut i = 1;
        while i < num_data {
            let word = read_word(src, index, endianness)?;
            index += 1;
            data[i] = field(word, 0, 32) as u32;
            if i + 1 < num_data {
                data[i + 1] = field(word, 32, 32) as u32;
            }
            i += 2;
        }

        Ok(Self {
            dst_port: field(word0, 0, 10) as u16,
            src_port: field(word0, 10, 10) as u16,
            seq_num: field(word0, 24, 6) as u8,
            timestamp,
            is_ack: field(word0, 31, 1) != 0,
            src_epid: field(word0, 32, 16) as u16,
            address: field(op_word, 0, 20) as u32,
            byte_enable: field(op_word, 20, 4) as u8,
            op_code,
            status: CtrlStatus::from_bits(field(op_word, 30, 2) as u8),
            data,
        })
    }
}

//
// Stream status payload (flow-control acknowledgment body)
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrsStatus {
    Okay,
    CmdErr,
    SeqErr,
    DataErr,
    RouteErr,
}

impl StrsStatus {
    fn to_bits(self) -> u8 {
        match self {
            StrsStatus::Okay => 0,
            StrsStatus::CmdErr => 1,
            StrsStatus::SeqErr => 2,
            StrsStatus::DataErr => 3,
            StrsStatus::RouteErr => 4,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(StrsStatus::Okay),
            1 => Some(StrsStatus::CmdErr),
            2 => Some(StrsStatus::SeqErr),
            3 => Some(StrsStatus::DataErr),
            4 => Some(StrsStatus::RouteErr),
            _ => None,
        }
    }
}

/// Body of a stream status packet: the receiving endpoint's view of its
/// buffer capacity and running transfer counts. This is what a sender's
/// flow-control window consumes as acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrsPayload {
    pub src_epid: u16,
    pub status: StrsStatus,
    /// Downstream buffer capacity in bytes (40 bits).
    pub capacity_bytes: u64,
    /// Downstream buffer capacity in packets (24 bits).
    pub capacity_pkts: u32,
    /// Running transfer count in bytes.
    pub xfer_count_bytes: u64,
    /// Running transfer count in packets (40 bits).
    pub xfer_count_pkts: u64,
    pub buff_info: u16,
    /// Extended status info (48 bits).
    pub status_info: u64,
}

impl Default for StrsStatus {
    fn default() -> Self {
        StrsStatus::Okay
    }
}

impl StrsPayload {
    pub const PACKED_NBYTES: usize = 4 * 8;

    pub fn packet_type(&self) -> PacketType {
        PacketType::FlowCtrl
    }

    pub fn serialize(&self, dst: &mut [u8], endianness: Endianness) -> Result<usize> {
        let words = [
            u64::from(self.src_epid)
                | (u64::from(self.status.to_bits()) << 16)
                | ((self.capacity_bytes & mask(40)) << 24),
            (u64::from(self.capacity_pkts) & mask(24)) | ((self.xfer_count_pkts & mask(40)) << 24),
            self.xfer_count_bytes,
            u64::from(self.buff_info) | ((self.status_info & mask(48)) << 16),
        ];
        write_words(dst, &words, endianness)
    }

    pub fn deserialize(src: &[u8], endianness: Endianness) -> Result<Self> {
        let word0 = read_word(src, 0, endianness)?;
        let word1 = read_word(src, 1, endianness)?;
        let word2 = read_word(src, 2, endianness)?;
        let word3 = read_word(src, 3, endianness)?;

        Ok(Self {
            src_epid: field(word0, 0, 16) as u16,
            status: StrsStatus::from_bits(field(word0, 16, 4) as u8).ok_or(
                ChdrError::MalformedPacket {
                    reason: "undefined stream status",
                },
            )?,
            capacity_bytes: field(word0, 24, 40),
            capacity_pkts: field(word1, 0, 24) as u32,
            xfer_count_pkts: field(word1, 24, 40),
            xfer_count_bytes: word2,
            buff_info: field(word3, 0, 16) as u16,
            status_info: field(word3, 16, 48),
        })
    }
}

//
// Stream command payload
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrcOpCode {
    /// Initialize the stream and its flow-control state.
    Init,
    /// Solicit a stream status response.
    Ping,
    /// Re-synchronize flow-control counts.
    Resync,
}

impl StrcOpCode {
    fn to_bits(self) -> u8 {
        match self {
            StrcOpCode::Init => 0,
            StrcOpCode::Ping => 1,
            StrcOpCode::Resync => 2,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(StrcOpCode::Init),
            1 => Some(StrcOpCode::Ping),
            2 => Some(StrcOpCode::Resync),
            _ => None,
        }
    }
}

/// Body of a stream command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrcPayload {
    pub src_epid: u16,
    pub op_code: StrcOpCode,
    /// Data associated with the operation (4 bits).
    pub op_data: u8,
    /// Packet count argument (40 bits).
    pub num_pkts: u64,
    pub num_bytes: u64,
}

impl StrcPayload {
    pub const PACKED_NBYTES: usize = 2 * 8;

    pub fn packet_type(&self) -> PacketType {
        PacketType::FlowCtrl
    }

    pub fn serialize(&self, dst: &mut [u8], endianness: Endianness) -> Result<usize> {
        let words = [
            u64::from(self.src_epid)
                | (u64::from(self.op_code.to_bits()) << 16)
                | ((u64::from(self.op_data) & mask(4)) << 20)
                | ((self.num_pkts & mask(40)) << 24),
            self.num_bytes,
        ];
        write_words(dst, &words, endianness)
    }

    pub fn deserialize(src: &[u8], endianness: Endianness) -> Result<Self> {
        let word0 = read_word(src, 0, endianness)?;
        let word1 = read_word(src, 1, endianness)?;

        Ok(Self {
            src_epid: field(word0, 0, 16) as u16,
            op_code: StrcOpCode::from_bits(field(word0, 16, 4) as u8).ok_or(
                ChdrError::MalformedPacket {
                    reason: "undefined stream command opcode",
                },
            )?,
            op_data: field(word0, 20, 4) as u8,
            num_pkts: field(word0, 24, 40),
            num_bytes: word1,
        })
    }
}

//
// Management transaction payload
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtOpCode {
    Nop,
    Advertise,
    SelDest,
    Return,
    InfoReq,
    InfoResp,
    CfgWrReq,
    CfgRdReq,
    CfgRdResp,
}

impl MgmtOpCode {
    fn to_bits(self) -> u8 {
        match self {
            MgmtOpCode::Nop => 0,
            MgmtOpCode::Advertise => 1,
            MgmtOpCode::SelDest => 2,
            MgmtOpCode::Return => 3,
            MgmtOpCode::InfoReq => 4,
            MgmtOpCode::InfoResp => 5,
            MgmtOpCode::CfgWrReq => 6,
            MgmtOpCode::CfgRdReq => 7,
            MgmtOpCode::CfgRdResp => 8,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(MgmtOpCode::Nop),
            1 => Some(MgmtOpCode::Advertise),
            2 => Some(MgmtOpCode::SelDest),
            3 => Some(MgmtOpCode::Return),
            4 => Some(MgmtOpCode::InfoReq),
            5 => Some(MgmtOpCode::InfoResp),
            6 => Some(MgmtOpCode::CfgWrReq),
            7 => Some(MgmtOpCode::CfgRdReq),
            8 => Some(MgmtOpCode::CfgRdResp),
            _ => None,
        }
    }
}

/// One management operation: an opcode plus a 48-bit operation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtOp {
    pub op_code: MgmtOpCode,
    pub op_payload: u64,
}

impl MgmtOp {
    pub fn new(op_code: MgmtOpCode, op_payload: u64) -> Self {
        Self { op_code, op_payload }
    }
}

/// Operations executed by one node along the management route. Ops run in
/// FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MgmtHop {
    pub ops: Vec<MgmtOp>,
}

impl MgmtHop {
    pub fn new(ops: Vec<MgmtOp>) -> Self {
        Self { ops }
    }
}

/// Body of a management packet: a multi-hop transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MgmtPayload {
    pub src_epid: u16,
    pub protover: u16,
    pub hops: Vec<MgmtHop>,
}

impl MgmtPayload {
    pub fn packet_type(&self) -> PacketType {
        PacketType::Mgmt
    }

    pub fn packed_nbytes(&self) -> usize {
        (1 + self.hops.iter().map(|hop| hop.ops.len()).sum::<usize>()) * 8
    }

    pub fn serialize(&self, dst: &mut [u8], endianness: Endianness) -> Result<usize> {
        if self.hops.len() > 0x3FF {
            return Err(ChdrError::Unrepresentable {
                what: "more than 1023 management hops",
            });
        }

        let mut words = Vec::with_capacity(self.packed_nbytes() / 8);
        words.push(
            u64::from(self.src_epid)
                | ((self.hops.len() as u64) << 16)
                | (u64::from(self.protover) << 48),
        );
        for hop in &self.hops {
            if hop.ops.is_empty() {
                return Err(ChdrError::Unrepresentable {
                    what: "management hop with no operations",
                });
            }
            for (i, op) in hop.ops.iter().enumerate() {
                let ops_remaining = (hop.ops.len() - i - 1) as u64;
                words.push(
                    (ops_remaining & mask(8))
                        | (u64::from(op.op_code.to_bits()) << 8)
                        | ((op.op_payload & mask(48)) << 16),
                );
            }
        }

        write_words(dst, &words, endianness)
    }

    pub fn deserialize(src: &[u8], endianness: Endianness) -> Result<Self> {
        let word0 = read_word(src, 0, endianness)?;
        let num_hops = field(word0, 16, 10) as usize;

        let mut index = 1;
        let mut hops = Vec::with_capacity(num_hops);
        for _ in 0..num_hops {
            let mut ops = Vec::new();
            loop {
                let op_word = read_word(src, index, endianness)?;
                index += 1;
                let op_code = MgmtOpCode::from_bits(field(op_word, 8, 8) as u8).ok_or(
                    ChdrError::MalformedPacket {
                        reason: "undefined management opcode",
                    },
                )?;
                ops.push(MgmtOp::new(op_code, field(op_word, 16, 48)));
                if field(op_word, 0, 8) == 0 {
                    break;
                }
            }
            hops.push(MgmtHop::new(ops));
        }

        Ok(Self {
            src_epid: field(word0, 0, 16) as u16,
            protover: field(word0, 48, 16) as u16,
            hops,
        })
    }
}
