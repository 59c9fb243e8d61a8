use crate::error::{ChdrError, Result};
use crate::header::{ChdrHeader, ChdrW, DstId, Endianness, PacketType};

/// Size of the fixed header in bytes: one 64-bit word, or two 32-bit words
/// in the legacy generation.
pub const HEADER_NBYTES: usize = 8;

/// Size of the optional timestamp in bytes.
pub const TIMESTAMP_NBYTES: usize = 8;

/// Largest metadata word count the 5-bit field can carry.
pub const MAX_MDATA_WORDS: usize = 31;

// 64-bit generation header word layout.
const W64_PKT_TYPE_OFFSET: u32 = 61;
const W64_HAS_TIME_OFFSET: u32 = 60;
const W64_EOB_OFFSET: u32 = 59;
const W64_ERROR_OFFSET: u32 = 58;
const W64_NUM_MDATA_OFFSET: u32 = 53;
const W64_SEQ_NUM_OFFSET: u32 = 32;
const W64_LENGTH_OFFSET: u32 = 16;
const W64_DST_EPID_OFFSET: u32 = 0;

// Legacy 32-bit generation, first header word layout. The second word is the
// flat stream id.
const W32_PKT_TYPE_OFFSET: u32 = 30;
const W32_HAS_TIME_OFFSET: u32 = 29;
const W32_EOB_OFFSET: u32 = 28;
const W32_SEQ_NUM_OFFSET: u32 = 16;
const W32_LENGTH_OFFSET: u32 = 0;

fn mask(width: u32) -> u64 {
    (1u64 << width) - 1
}

fn field(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & mask(width)
}

/// A decoded packet borrowing its payload from the source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChdrPacketRef<'a> {
    pub header: ChdrHeader,
    pub timestamp: Option<u64>,
    pub mdata: Vec<u64>,
    pub payload: &'a [u8],
}

/// Stateless CHDR packet codec for one link's byte order and header
/// generation.
///
/// All length fields are computed on pack and validated on unpack; a failed
/// unpack never partially mutates caller state.
#[derive(Debug, Clone, Copy)]
pub struct ChdrCodec {
    endianness: Endianness,
    chdr_w: ChdrW,
}

impl ChdrCodec {
    pub fn new(endianness: Endianness, chdr_w: ChdrW) -> Self {
        Self { endianness, chdr_w }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn chdr_w(&self) -> ChdrW {
        self.chdr_w
    }

    /// Total serialized size of a packet with the given optional fields.
    pub fn packed_nbytes(has_time: bool, num_mdata: usize, payload_len: usize) -> usize {
        HEADER_NBYTES
            + if has_time { TIMESTAMP_NBYTES } else { 0 }
            + num_mdata * 8
            + payload_len
    }

    /// Serialize a packet into `dst`, returning the number of bytes written.
    ///
    /// The header's `length` field is ignored on input; the total length is
    /// derived from the optional fields and payload.
    pub fn pack(
        &self,
        header: &ChdrHeader,
        timestamp: Option<u64>,
        mdata: &[u64],
        payload: &[u8],
        dst: &mut [u8],
    ) -> Result<usize> {
        let total = Self::packed_nbytes(timestamp.is_some(), mdata.len(), payload.len());
        if total > u16::MAX as usize {
            return Err(ChdrError::PayloadTooLarge {
                size: total,
                max: u16::MAX as usize,
            });
        }
        if total > dst.len() {
            return Err(ChdrError::PayloadTooLarge {
                size: total,
                max: dst.len(),
            });
        }

        match self.chdr_w {
            ChdrW::W32 => self.pack_w32(header, timestamp, mdata, payload, dst, total as u16),
            ChdrW::W64 => self.pack_w64(header, timestamp, mdata, payload, dst, total as u16),
        }
    }

    fn pack_w32(
        &self,
        header: &ChdrHeader,
        timestamp: Option<u64>,
        mdata: &[u64],
        payload: &[u8],
        dst: &mut [u8],
        total: u16,
    ) -> Result<usize> {
        if !mdata.is_empty() {
            return Err(ChdrError::Unrepresentable {
                what: "metadata words in the legacy 32-bit framing",
            });
        }
        if header.error {
            return Err(ChdrError::Unrepresentable {
                what: "error flag in the legacy 32-bit framing",
            });
        }
        let type_bits = header.pkt_type.to_bits();
        if type_bits > 3 {
            return Err(ChdrError::Unrepresentable {
                what: "packet type outside the legacy 2-bit space",
            });
        }
        let sid = match header.dst {
            DstId::Sid(sid) => sid,
            DstId::Epid(_) => {
                return Err(ChdrError::Unrepresentable {
                    what: "endpoint addressing in the legacy 32-bit framing",
                });
            }
        };

        let word0 = (u32::from(type_bits) << W32_PKT_TYPE_OFFSET)
            | (u32::from(timestamp.is_some()) << W32_HAS_TIME_OFFSET)
            | (u32::from(header.eob) << W32_EOB_OFFSET)
            | (u32::from(header.seq_num & ChdrW::W32.seq_mask()) << W32_SEQ_NUM_OFFSET)
            | (u32::from(total) << W32_LENGTH_OFFSET);

        let mut out = &mut dst[..];
        self.endianness.put_u32(&mut out, word0);
        self.endianness.put_u32(&mut out, sid);
        if let Some(ts) = timestamp {
            self.endianness.put_u64(&mut out, ts);
        }
        dst[usize::from(total) - payload.len()..usize::from(total)].copy_from_slice(payload);
        Ok(usize::from(total))
    }

    fn pack_w64(
        &self,
        header: &ChdrHeader,
        timestamp: Option<u64>,
        mdata: &[u64],
        payload: &[u8],
        dst: &mut [u8],
        total: u16,
    ) -> Result<usize> {
        if mdata.len() > MAX_MDATA_WORDS {
            return Err(ChdrError::Unrepresentable {
                what: "more than 31 metadata words",
            });
        }
        let epid = match header.dst {
            DstId::Epid(epid) => epid,
            DstId::Sid(_) => {
                return Err(ChdrError::Unrepresentable {
                    what: "flat stream id in the 64-bit framing",
                });
            }
        };

        let word = (u64::from(header.pkt_type.to_bits()) << W64_PKT_TYPE_OFFSET)
            | (u64::from(timestamp.is_some()) << W64_HAS_TIME_OFFSET)
            | (u64::from(header.eob) << W64_EOB_OFFSET)
            | (u64::from(header.error) << W64_ERROR_OFFSET)
            | ((mdata.len() as u64) << W64_NUM_MDATA_OFFSET)
            | (u64::from(header.seq_num) << W64_SEQ_NUM_OFFSET)
            | (u64::from(total) << W64_LENGTH_OFFSET)
            | (u64::from(epid) << W64_DST_EPID_OFFSET);

        let mut out = &mut dst[..];
        self.endianness.put_u64(&mut out, word);
        if let Some(ts) = timestamp {
            self.endianness.put_u64(&mut out, ts);
        }
        for &word in mdata {
            self.endianness.put_u64(&mut out, word);
        }
        dst[usize::from(total) - payload.len()..usize::from(total)].copy_from_slice(payload);
        Ok(usize::from(total))
    }

    /// Deserialize a packet from `src`.
    ///
    /// Validates that the declared total length is consistent with the
    /// optional-field flags and fits the buffer; any inconsistency is a
    /// [`ChdrError::MalformedPacket`].
    pub fn unpack<'a>(&self, src: &'a [u8]) -> Result<ChdrPacketRef<'a>> {
        if src.len() < HEADER_NBYTES {
            return Err(ChdrError::MalformedPacket {
                reason: "buffer shorter than the packet header",
            });
        }
        match self.chdr_w {
            ChdrW::W32 => self.unpack_w32(src),
            ChdrW::W64 => self.unpack_w64(src),
        }
    }

    fn unpack_w32<'a>(&self, src: &'a [u8]) -> Result<ChdrPacketRef<'a>> {
        let mut cursor = src;
        let word0 = u64::from(self.endianness.get_u32(&mut cursor));
        let sid = self.endianness.get_u32(&mut cursor);

        let has_time = field(word0, W32_HAS_TIME_OFFSET, 1) != 0;
        let total = field(word0, W32_LENGTH_OFFSET, 16) as usize;
        let hdr_nbytes = HEADER_NBYTES + if has_time { TIMESTAMP_NBYTES } else { 0 };
        if total > src.len() {
            return Err(ChdrError::MalformedPacket {
                reason: "declared length exceeds buffer bounds",
            });
        }
        if total < hdr_nbytes {
            return Err(ChdrError::MalformedPacket {
                reason: "declared length shorter than the header",
            });
        }

        let timestamp = has_time.then(|| self.endianness.get_u64(&mut cursor));
        let pkt_type = PacketType::from_bits(field(word0, W32_PKT_TYPE_OFFSET, 2) as u8)
            .unwrap_or(PacketType::Data);

        Ok(ChdrPacketRef {
            header: ChdrHeader {
                pkt_type,
                eob: field(word0, W32_EOB_OFFSET, 1) != 0,
                error: false,
                seq_num: field(word0, W32_SEQ_NUM_OFFSET, 12) as u16,
                length: total as u16,
                dst: DstId::Sid(sid),
            },
            timestamp,
            mdata: Vec::new(),
            payload: &src[hdr_nbytes..total],
        })
    }

    fn unpack_w64<'a>(&self, src: &'a [u8]) -> Result<ChdrPacketRef<'a>> {
        let mut cursor = src;
        let word = self.endianness.get_u64(&mut cursor);

        let pkt_type = PacketType::from_bits(field(word, W64_PKT_TYPE_OFFSET, 3) as u8).ok_or(
            ChdrError::MalformedPacket {
                reason: "undefined packet type",
            },
        )?;
        let has_time = field(word, W64_HAS_TIME_OFFSET, 1) != 0;
        let num_mdata = field(word, W64_NUM_MDATA_OFFSET, 5) as usize;
        let total = field(word, W64_LENGTH_OFFSET, 16) as usize;

        let hdr_nbytes =
            HEADER_NBYTES + if has_time { TIMESTAMP_NBYTES } else { 0 } + num_mdata * 8;
        if total > src.len() {
            return Err(ChdrError::MalformedPacket {
                reason: "declared length exceeds buffer bounds",
            });
        }
        if total < hdr_nbytes {
            return Err(ChdrError::MalformedPacket {
                reason: "declared length shorter than header and optional fields",
            });
        }

        let timestamp = has_time.then(|| self.endianness.get_u64(&mut cursor));
        let mut mdata = Vec::with_capacity(num_mdata);
        for _ in 0..num_mdata {
            mdata.push(self.endianness.get_u64(&mut cursor));
        }

        Ok(ChdrPacketRef {
            header: ChdrHeader {
                pkt_type,
                eob: field(word, W64_EOB_OFFSET, 1) != 0,
                error: field(word, W64_ERROR_OFFSET, 1) != 0,
                seq_num: field(word, W64_SEQ_NUM_OFFSET, 16) as u16,
                length: total as u16,
                dst: DstId::Epid(field(word, W64_DST_EPID_OFFSET, 16) as u16),
            },
            timestamp,
            mdata,
            payload: &src[hdr_nbytes..total],
        })
    }

    /// Read only the packet type from a serialized packet. Used by session
    /// filters that must classify a frame without a full decode.
    pub fn peek_pkt_type(&self, src: &[u8]) -> Result<PacketType> {
        match self.chdr_w {
            ChdrW::W32 => {
                if src.len() < 4 {
                    return Err(ChdrError::MalformedPacket {
                        reason: "buffer shorter than the packet header",
                    });
                }
                let word0 = self.endianness.get_u32(&mut &src[..]);
                Ok(
                    PacketType::from_bits(field(u64::from(word0), W32_PKT_TYPE_OFFSET, 2) as u8)
                        .unwrap_or(PacketType::Data),
                )
            }
            ChdrW::W64 => {
                if src.len() < 8 {
                    return Err(ChdrError::MalformedPacket {
                        reason: "buffer shorter than the packet header",
                    });
                }
                let word = self.endianness.get_u64(&mut &src[..]);
                PacketType::from_bits(field(word, W64_PKT_TYPE_OFFSET, 3) as u8).ok_or(
                    ChdrError::MalformedPacket {
                        reason: "undefined packet type",
                    },
                )
            }
        }
    }

    /// Read only the routing identifier from a serialized packet.
    pub fn peek_dst(&self, src: &[u8]) -> Result<DstId> {
        if src.len() < HEADER_NBYTES {
            return Err(ChdrError::MalformedPacket {
                reason: "buffer shorter than the packet header",
            });
        }
        match self.chdr_w {
            ChdrW::W32 => {
                let sid = self.endianness.get_u32(&mut &src[4..]);
                Ok(DstId::Sid(sid))
            }
            ChdrW::W64 => {
                let word = self.endianness.get_u64(&mut &src[..]);
                Ok(DstId::Epid(field(word, W64_DST_EPID_OFFSET, 16) as u16))
            }
        }
    }

    /// Rewrite the sequence counter of an already-serialized packet in
    /// place. Send paths stamp the final sequence number this way just
    /// before the frame goes to the wire.
    pub fn set_seq_num(&self, frame: &mut [u8], seq_num: u16) -> Result<()> {
        match self.chdr_w {
            ChdrW::W32 => {
                if frame.len() < 4 {
                    return Err(ChdrError::MalformedPacket {
                        reason: "buffer shorter than the packet header",
                    });
                }
                let word0 = self.endianness.get_u32(&mut &frame[..]);
                let word0 = (word0 & !((mask(12) as u32) << W32_SEQ_NUM_OFFSET))
                    | (u32::from(seq_num & ChdrW::W32.seq_mask()) << W32_SEQ_NUM_OFFSET);
                self.endianness.put_u32(&mut &mut frame[..], word0);
                Ok(())
            }
            ChdrW::W64 => {
                if frame.len() < 8 {
                    return Err(ChdrError::MalformedPacket {
                        reason: "buffer shorter than the packet header",
                    });
                }
                let word = self.endianness.get_u64(&mut &frame[..]);
                let word = (word & !(mask(16) << W64_SEQ_NUM_OFFSET))
                    | (u64::from(seq_num) << W64_SEQ_NUM_OFFSET);
                self.endianness.put_u64(&mut &mut frame[..], word);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDIANNESSES: [Endianness; 2] = [Endianness::Big, Endianness::Little];

    fn pack_to_vec(
        codec: &ChdrCodec,
        header: &ChdrHeader,
        timestamp: Option<u64>,
        mdata: &[u64],
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = codec.pack(header, timestamp, mdata, payload, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn w32_roundtrip_all_optional_combinations() {
        for endianness in ENDIANNESSES {
            let codec = ChdrCodec::new(endianness, ChdrW::W32);
            for timestamp in [None, Some(0xDEAD_BEEF_0123_4567)] {
                for payload_len in [0usize, 1, 17, 256] {
                    let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
                    let header = ChdrHeader::new(PacketType::Ctrl, DstId::Sid(0x0102_0304))
                        .with_seq_num(0x0ABC)
                        .with_eob(true);

                    let wire = pack_to_vec(&codec, &header, timestamp, &[], &payload);
                    assert_eq!(
                        wire.len(),
                        ChdrCodec::packed_nbytes(timestamp.is_some(), 0, payload_len)
                    );

                    let unpacked = codec.unpack(&wire).unwrap();
                    assert_eq!(unpacked.header.pkt_type, header.pkt_type);
                    assert_eq!(unpacked.header.eob, header.eob);
                    assert_eq!(unpacked.header.seq_num, header.seq_num);
                    assert_eq!(unpacked.header.dst, header.dst);
                    assert_eq!(unpacked.header.length as usize, wire.len());
                    assert_eq!(unpacked.timestamp, timestamp);
                    assert!(unpacked.mdata.is_empty());
                    assert_eq!(unpacked.payload, payload.as_slice());
                }
            }
        }
    }

    #[test]
    fn w64_roundtrip_all_optional_combinations() {
        for endianness in ENDIANNESSES {
            let codec = ChdrCodec::new(endianness, ChdrW::W64);
            for timestamp in [None, Some(1u64)] {
                for mdata in [&[][..], &[0x1111_2222_3333_4444, 0x5555_6666_7777_8888][..]] {
                    for payload_len in [0usize, 95] {
                        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
                        let header = ChdrHeader::new(PacketType::Data, DstId::Epid(0xBEEF))
                            .with_seq_num(0xFFFF)
                            .with_eob(true)
                            .with_error(true);

                        let wire = pack_to_vec(&codec, &header, timestamp, mdata, &payload);
                        assert_eq!(
                            wire.len(),
                            ChdrCodec::packed_nbytes(timestamp.is_some(), mdata.len(), payload_len)
                        );

                        let unpacked = codec.unpack(&wire).unwrap();
                        assert_eq!(unpacked.header.pkt_type, header.pkt_type);
                        assert_eq!(unpacked.header.eob, header.eob);
                        assert_eq!(unpacked.header.error, header.error);
                        assert_eq!(unpacked.header.seq_num, header.seq_num);
                        assert_eq!(unpacked.header.dst, header.dst);
                        assert_eq!(unpacked.timestamp, timestamp);
                        assert_eq!(unpacked.mdata, mdata);
                        assert_eq!(unpacked.payload, payload.as_slice());
                    }
                }
            }
        }
    }

    #[test]
    fn legacy_data_packet_example_scenario() {
        // DATA packet, seq 7, timestamped, addressed by flat stream id.
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W32);
        let payload: Vec<u8> = (0x00..=0x5E).collect();
        assert_eq!(payload.len(), 95);

        let header =
            ChdrHeader::new(PacketType::Data, DstId::Sid(0xAABB_CCDD)).with_seq_num(7);
        let wire = pack_to_vec(&codec, &header, Some(0x1234_5678_90AB_CDEF), &[], &payload);
        assert_eq!(wire.len(), 8 + 8 + 95);

        // Wire-stable header bytes: flags+seq+length word, then the sid.
        assert_eq!(&wire[..4], &[0x20, 0x07, 0x00, 0x6F]);
        assert_eq!(&wire[4..8], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&wire[8..16], &[0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF]);

        let unpacked = codec.unpack(&wire).unwrap();
        assert_eq!(unpacked.header.pkt_type, PacketType::Data);
        assert_eq!(unpacked.header.seq_num, 7);
        assert_eq!(unpacked.header.dst, DstId::Sid(0xAABB_CCDD));
        assert_eq!(unpacked.timestamp, Some(0x1234_5678_90AB_CDEF));
        assert_eq!(unpacked.payload, payload.as_slice());
    }

    #[test]
    fn w64_known_wire_bytes_big_endian() {
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W64);
        let header = ChdrHeader::new(PacketType::Data, DstId::Epid(0x00AA))
            .with_seq_num(0x0102)
            .with_eob(true);
        let wire = pack_to_vec(&codec, &header, None, &[], &[1, 2, 3, 4]);
        assert_eq!(&wire[..8], &[0x08, 0x00, 0x01, 0x02, 0x00, 0x0C, 0x00, 0xAA]);
        assert_eq!(&wire[8..], &[1, 2, 3, 4]);
    }

    #[test]
    fn endianness_changes_the_wire_not_the_packet() {
        let header = ChdrHeader::new(PacketType::Ctrl, DstId::Epid(0x1234)).with_seq_num(9);
        let be = pack_to_vec(
            &ChdrCodec::new(Endianness::Big, ChdrW::W64),
            &header,
            None,
            &[],
            b"xyz",
        );
        let le = pack_to_vec(
            &ChdrCodec::new(Endianness::Little, ChdrW::W64),
            &header,
            None,
            &[],
            b"xyz",
        );
        assert_ne!(be, le);
        assert_eq!(&be[..8], &le[..8].iter().rev().copied().collect::<Vec<_>>()[..]);
    }

    #[test]
    fn truncation_always_yields_malformed() {
        for chdr_w in [ChdrW::W32, ChdrW::W64] {
            let codec = ChdrCodec::new(Endianness::Little, chdr_w);
            let dst = match chdr_w {
                ChdrW::W32 => DstId::Sid(42),
                ChdrW::W64 => DstId::Epid(42),
            };
            let header = ChdrHeader::new(PacketType::Data, dst).with_seq_num(1);
            let wire = pack_to_vec(&codec, &header, Some(77), &[], &[0xAB; 23]);

            for cut in 1..wire.len() {
                let err = codec.unpack(&wire[..wire.len() - cut]).unwrap_err();
                assert!(
                    matches!(err, ChdrError::MalformedPacket { .. }),
                    "cut={cut} gave {err:?}"
                );
            }
        }
    }

    #[test]
    fn declared_length_shorter_than_header_rejected() {
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W64);
        // has_time set but length says header-only.
        let word: u64 = (1 << W64_HAS_TIME_OFFSET) | (8 << W64_LENGTH_OFFSET);
        let wire = word.to_be_bytes();
        let err = codec.unpack(&wire).unwrap_err();
        assert!(matches!(err, ChdrError::MalformedPacket { .. }));
    }

    #[test]
    fn undefined_w64_packet_type_rejected() {
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W64);
        let word: u64 = (7 << W64_PKT_TYPE_OFFSET) | (8 << W64_LENGTH_OFFSET);
        let err = codec.unpack(&word.to_be_bytes()).unwrap_err();
        assert!(matches!(err, ChdrError::MalformedPacket { .. }));
    }

    #[test]
    fn w32_rejects_w64_only_features() {
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W32);
        let mut buf = [0u8; 64];

        let header = ChdrHeader::new(PacketType::Data, DstId::Sid(1));
        let err = codec.pack(&header, None, &[1], &[], &mut buf).unwrap_err();
        assert!(matches!(err, ChdrError::Unrepresentable { .. }));

        let header = ChdrHeader::new(PacketType::Mgmt, DstId::Sid(1));
        let err = codec.pack(&header, None, &[], &[], &mut buf).unwrap_err();
        assert!(matches!(err, ChdrError::Unrepresentable { .. }));

        let header = ChdrHeader::new(PacketType::Data, DstId::Sid(1)).with_error(true);
        let err = codec.pack(&header, None, &[], &[], &mut buf).unwrap_err();
        assert!(matches!(err, ChdrError::Unrepresentable { .. }));

        let header = ChdrHeader::new(PacketType::Data, DstId::Epid(1));
        let err = codec.pack(&header, None, &[], &[], &mut buf).unwrap_err();
        assert!(matches!(err, ChdrError::Unrepresentable { .. }));
    }

    #[test]
    fn w64_rejects_sid_addressing() {
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W64);
        let mut buf = [0u8; 64];
        let header = ChdrHeader::new(PacketType::Data, DstId::Sid(1));
        let err = codec.pack(&header, None, &[], &[], &mut buf).unwrap_err();
        assert!(matches!(err, ChdrError::Unrepresentable { .. }));
    }

    #[test]
    fn pack_into_undersized_frame_rejected() {
        let codec = ChdrCodec::new(Endianness::Little, ChdrW::W64);
        let mut buf = [0u8; 16];
        let header = ChdrHeader::new(PacketType::Data, DstId::Epid(1));
        let err = codec
            .pack(&header, None, &[], &[0u8; 32], &mut buf)
            .unwrap_err();
        assert!(matches!(err, ChdrError::PayloadTooLarge { size: 40, max: 16 }));
    }

    #[test]
    fn w32_sequence_wraps_modulo_12_bits() {
        let codec = ChdrCodec::new(Endianness::Little, ChdrW::W32);
        let header = ChdrHeader::new(PacketType::Data, DstId::Sid(5)).with_seq_num(0x1FFF);
        let wire = pack_to_vec(&codec, &header, None, &[], &[]);
        let unpacked = codec.unpack(&wire).unwrap();
        assert_eq!(unpacked.header.seq_num, 0x0FFF);
    }

    #[test]
    fn peek_helpers_match_full_unpack() {
        let codec = ChdrCodec::new(Endianness::Big, ChdrW::W64);
        let header = ChdrHeader::new(PacketType::Mgmt, DstId::Epid(0x0BAD)).with_seq_num(3);
        let wire = pack_to_vec(&codec, &header, None, &[], b"ops");

        assert_eq!(codec.peek_pkt_type(&wire).unwrap(), PacketType::Mgmt);
        assert_eq!(codec.peek_dst(&wire).unwrap(), DstId::Epid(0x0BAD));

        let legacy = ChdrCodec::new(Endianness::Big, ChdrW::W32);
        let header = ChdrHeader::new(PacketType::FlowCtrl, DstId::Sid(0xA5A5_5A5A));
        let wire = pack_to_vec(&legacy, &header, None, &[], &[]);
        assert_eq!(legacy.peek_pkt_type(&wire).unwrap(), PacketType::FlowCtrl);
        assert_eq!(legacy.peek_dst(&wire).unwrap(), DstId::Sid(0xA5A5_5A5A));

        assert!(legacy.peek_dst(&wire[..7]).is_err());
        assert!(legacy.peek_pkt_type(&wire[..3]).is_err());
    }

    #[test]
    fn set_seq_num_patches_in_place() {
        for chdr_w in [ChdrW::W32, ChdrW::W64] {
            let codec = ChdrCodec::new(Endianness::Big, chdr_w);
            let dst = match chdr_w {
                ChdrW::W32 => DstId::Sid(11),
                ChdrW::W64 => DstId::Epid(11),
            };
            let header = ChdrHeader::new(PacketType::Data, dst).with_seq_num(0);
            let mut wire = pack_to_vec(&codec, &header, Some(1), &[], b"payload");

            codec.set_seq_num(&mut wire, 0x0123).unwrap();
            let unpacked = codec.unpack(&wire).unwrap();
            assert_eq!(unpacked.header.seq_num, 0x0123);
            // Nothing else moved.
            assert_eq!(unpacked.header.dst, dst);
            assert_eq!(unpacked.timestamp, Some(1));
            assert_eq!(unpacked.payload, b"payload");
        }
    }
}
