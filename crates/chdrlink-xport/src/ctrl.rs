use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chdrlink_io::{
    CallbackResult, IoService, RecvCallback, RecvIo, SendCallback, SendIo,
};
use chdrlink_link::{FrameBuff, RecvLink, SendLink};
use chdrlink_packet::{
    ChdrCodec, ChdrHeader, ChdrW, CtrlPayload, DstId, PacketType,
};
use tracing::{debug, warn};

use crate::args::XportArgs;
use crate::error::{Result, XportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    send_io: Box<dyn SendIo>,
    ctrl_io: Box<dyn RecvIo>,
    mgmt_io: Box<dyn RecvIo>,
}

/// Control/management session for one endpoint id on a shared physical
/// link.
///
/// Registers two receive filters (control-class and management-class
/// packets addressed to this endpoint) and one send client whose hook
/// stamps outgoing sequence counts. Frames of other types, or addressed to
/// other endpoints, are never surfaced here — the I/O service routes or
/// recycles them.
///
/// All public operations are serialized by one session-wide lock: the
/// underlying I/O service is not reentrant for one link from multiple
/// threads, so concurrent calls on the same session are safe but execute
/// one at a time.
pub struct CtrlXport {
    epid: u16,
    codec: ChdrCodec,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CtrlXport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlXport")
            .field("epid", &self.epid)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl CtrlXport {
    /// Connect a session onto `io_srv`. Both links must already be attached
    /// to the service; the session reserves its frames from their pools and
    /// returns them when dropped.
    pub fn new(
        io_srv: &dyn IoService,
        send_link: Arc<dyn SendLink>,
        recv_link: Arc<dyn RecvLink>,
        codec: ChdrCodec,
        args: XportArgs,
    ) -> Result<Self> {
        if codec.chdr_w() != ChdrW::W64 {
            return Err(XportError::Io(chdrlink_io::IoError::Configuration(
                "control sessions require the endpoint-addressed 64-bit framing".to_string(),
            )));
        }
        let epid = args.epid;

        let ctrl_codec = codec;
        let ctrl_cb: RecvCallback = Box::new(move |frame, _link| {
            match (
                ctrl_codec.peek_pkt_type(frame.data()),
                ctrl_codec.peek_dst(frame.data()),
            ) {
                (Ok(pkt_type), Ok(DstId::Epid(dst)))
                    if dst == epid
                        && matches!(pkt_type, PacketType::Ctrl | PacketType::Response) =>
                {
                    CallbackResult::Matched(frame)
                }
                _ => CallbackResult::NotMine(frame),
            }
        });
        let ctrl_io = io_srv.make_recv_client(
            Arc::clone(&recv_link),
            args.num_ctrl_frames,
            ctrl_cb,
            None,
        )?;

        let mgmt_codec = codec;
        let mgmt_cb: RecvCallback = Box::new(move |frame, _link| {
            match (
                mgmt_codec.peek_pkt_type(frame.data()),
                mgmt_codec.peek_dst(frame.data()),
            ) {
                (Ok(PacketType::Mgmt), Ok(DstId::Epid(dst))) if dst == epid => {
                    CallbackResult::Matched(frame)
                }
                _ => CallbackResult::NotMine(frame),
            }
        });
        let mgmt_io = io_srv.make_recv_client(recv_link, args.num_mgmt_frames, mgmt_cb, None)?;

        let send_codec = codec;
        let mut seq_num: u16 = 0;
        let send_cb: SendCallback = Box::new(move |mut frame, link: &dyn SendLink| {
            if !frame.is_empty() {
                match send_codec.set_seq_num(frame.data_mut(), seq_num) {
                    Ok(()) => {
                        seq_num = seq_num.wrapping_add(1) & send_codec.chdr_w().seq_mask();
                    }
                    Err(err) => warn!(%err, "failed to stamp sequence count"),
                }
            }
            if let Err(err) = link.release_send(frame) {
                warn!(%err, "failed to release send frame");
            }
            None
        });
        let send_io = io_srv.make_send_client(send_link, args.num_send_frames, send_cb, None)?;

        debug!(epid, "control transport session connected");
        Ok(Self {
            epid,
            codec,
            inner: Mutex::new(Inner {
                send_io,
                ctrl_io,
                mgmt_io,
            }),
        })
    }

    pub fn epid(&self) -> u16 {
        self.epid
    }

    pub fn codec(&self) -> ChdrCodec {
        self.codec
    }

    /// An empty send frame, or `None` when the pool stayed dry past the
    /// timeout.
    pub fn get_send_buff(&self, timeout: Option<Duration>) -> Option<FrameBuff> {
        lock(&self.inner).send_io.get_send_buff(timeout)
    }

    /// Commit a filled frame to the wire. The session's send hook stamps the
    /// sequence count just before transmission.
    pub fn release_send_buff(&self, frame: FrameBuff) {
        lock(&self.inner).send_io.release_send_buff(frame);
    }

    /// Next control-class packet addressed to this endpoint.
    pub fn get_recv_buff(&self, timeout: Option<Duration>) -> Option<FrameBuff> {
        lock(&self.inner).ctrl_io.get_recv_buff(timeout)
    }

    pub fn release_recv_buff(&self, frame: FrameBuff) {
        lock(&self.inner).ctrl_io.release_recv_buff(frame);
    }

    /// Next management-class packet addressed to this endpoint.
    pub fn get_mgmt_buff(&self, timeout: Option<Duration>) -> Option<FrameBuff> {
        lock(&self.inner).mgmt_io.get_recv_buff(timeout)
    }

    pub fn release_mgmt_buff(&self, frame: FrameBuff) {
        lock(&self.inner).mgmt_io.release_recv_buff(frame);
    }

    /// Pack and send one control transaction to `dst_epid`. Returns false
    /// when no send frame freed up within the timeout.
    pub fn send_ctrl(
        &self,
        dst_epid: u16,
        payload: &CtrlPayload,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = lock(&self.inner);
        let Some(mut frame) = inner.send_io.get_send_buff(timeout) else {
            return Ok(false);
        };

        // Control transactions are not performance critical; serializing the
        // body through a scratch buffer keeps the codec interfaces simple.
        let mut body = vec![0u8; payload.packed_nbytes()];
        if let Err(err) = payload.serialize(&mut body, self.codec.endianness()) {
            frame.set_len(0);
            inner.send_io.release_send_buff(frame);
            return Err(err.into());
        }

        let header = ChdrHeader::new(payload.packet_type(), DstId::Epid(dst_epid));
        match self.codec.pack(&header, None, &[], &body, frame.region_mut()) {
            Ok(nbytes) => {
                frame.set_len(nbytes);
                inner.send_io.release_send_buff(frame);
                Ok(true)
            }
            Err(err) => {
                frame.set_len(0);
                inner.send_io.release_send_buff(frame);
                Err(err.into())
            }
        }
    }

    /// Receive and decode one control transaction addressed to this
    /// endpoint. Returns `Ok(None)` when nothing arrived within the timeout.
    pub fn recv_ctrl(&self, timeout: Option<Duration>) -> Result<Option<CtrlPayload>> {
        let mut inner = lock(&self.inner);
        let Some(frame) = inner.ctrl_io.get_recv_buff(timeout) else {
            return Ok(None);
        };

        let decoded = self
            .codec
            .unpack(frame.data())
            .and_then(|packet| CtrlPayload::deserialize(packet.payload, self.codec.endianness()));
        inner.ctrl_io.release_recv_buff(frame);
        Ok(Some(decoded?))
    }
}
