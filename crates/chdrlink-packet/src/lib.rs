//! CHDR wire packet codec.
//!
//! Stateless pack/unpack of the CHDR packet format: a bit-packed header,
//! an optional 64-bit timestamp, optional 64-bit metadata words, and payload
//! bytes, in either link byte order and in both protocol generations (the
//! legacy 32-bit VRT-derived framing and the 64-bit CHDR framing).
//!
//! Nothing here touches links or buffers beyond the byte slices handed in:
//! this layer is a pure transformation and the natural place for every
//! length-consistency check the wire format demands.

pub mod codec;
pub mod error;
pub mod header;
pub mod payloads;

pub use codec::{ChdrCodec, ChdrPacketRef, HEADER_NBYTES, MAX_MDATA_WORDS, TIMESTAMP_NBYTES};
pub use error::{ChdrError, Result};
pub use header::{ChdrHeader, ChdrW, DstId, Endianness, PacketType};
pub use payloads::{
    CtrlOpCode, CtrlPayload, CtrlStatus, MgmtHop, MgmtOp, MgmtOpCode, MgmtPayload, StrcOpCode,
    StrcPayload, StrsPayload, StrsStatus,
};
