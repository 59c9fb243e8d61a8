//! I/O scheduling for CHDR links.
//!
//! Two interchangeable strategies implement the [`IoService`] contract:
//!
//! - [`InlineIoService`] — the calling thread drives the link directly, with
//!   a link-sharing mux so several logical sessions can share one physical
//!   link without a dedicated thread.
//! - [`OffloadIoService`] — a dedicated worker thread owns the links and
//!   hands frames to clients over bounded queues, polling or blocking.
//!
//! The crate also holds the legacy stream-id [`RecvDemuxer`] and the
//! zero-copy flow-control wrappers ([`FcSend`], [`FcRecv`], [`FcWindow`]).

pub mod demux;
pub mod error;
pub mod fc;
pub mod inline;
pub mod offload;
pub mod service;

pub use demux::RecvDemuxer;
pub use error::{IoError, Result};
pub use fc::{FcPolicy, FcRecv, FcResponder, FcSend, FcWindow};
pub use inline::InlineIoService;
pub use offload::{ClientType, OffloadArgs, OffloadIoService, WaitMode};
pub use service::{
    CallbackResult, IoService, RecvCallback, RecvFcCallback, RecvIo, SendCallback, SendFc, SendIo,
};
