//! Legacy bulk-data demultiplexing by stream id.
//!
//! Several logical streams share one receive link; whichever session polls
//! first routes frames for the others onto their per-id FIFOs. A frame
//! tagged with a known-but-different id is expected multiplexing and gets
//! queued; a frame tagged with an id nobody registered is an unexpected
//! peer, logged and recycled without ever surfacing to a caller. The two
//! branches are deliberately asymmetric.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chdrlink_link::{FrameBuff, RecvLink};
use chdrlink_packet::{ChdrCodec, DstId};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Demultiplexes one receive link onto per-stream-id queues.
pub struct RecvDemuxer {
    link: Arc<dyn RecvLink>,
    codec: ChdrCodec,
    queues: Mutex<HashMap<u32, VecDeque<FrameBuff>>>,
}

impl RecvDemuxer {
    pub fn new(link: Arc<dyn RecvLink>, codec: ChdrCodec) -> Self {
        Self {
            link,
            codec,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Register a stream id, or re-register it after the stream was torn
    /// down and set up again. Any frames queued before the call are stale
    /// and go back to the link: a `pop` issued afterwards never returns
    /// content that predates the realloc.
    pub fn realloc_sid(&self, sid: u32) {
        let stale = {
            let mut queues = lock(&self.queues);
            queues.insert(sid, VecDeque::new())
        };
        if let Some(stale) = stale {
            debug!(sid, count = stale.len(), "discarding stale frames on realloc");
            for frame in stale {
                self.recycle(frame);
            }
        }
    }

    /// Remove a stream id, recycling anything still queued for it.
    pub fn unregister_sid(&self, sid: u32) {
        let stale = lock(&self.queues).remove(&sid);
        for frame in stale.into_iter().flatten() {
            self.recycle(frame);
        }
    }

    /// Next frame for `sid`: first from its queue, then by driving the link
    /// within the remaining deadline. Frames for other registered ids are
    /// queued for their owners along the way. Returns `None` when nothing
    /// arrived for `sid` within the timeout — that is "no data", not an
    /// error.
    pub fn pop(&self, sid: u32, timeout: Option<Duration>) -> Option<FrameBuff> {
        {
            let mut queues = lock(&self.queues);
            match queues.get_mut(&sid) {
                Some(queue) => {
                    if let Some(frame) = queue.pop_front() {
                        return Some(frame);
                    }
                }
                None => {
                    warn!(sid, "pop on unregistered stream id");
                    return None;
                }
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let link_timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some(frame) = self.link.acquire_recv(link_timeout) else {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return None;
                    }
                }
                continue;
            };

            match self.frame_sid(&frame) {
                Some(frame_sid) if frame_sid == sid => return Some(frame),
                Some(frame_sid) => {
                    let mut queues = lock(&self.queues);
                    match queues.get_mut(&frame_sid) {
                        Some(queue) => queue.push_back(frame),
                        None => {
                            // Unknown peer: absorbed here so one bad sender
                            // cannot stall unrelated sessions.
                            drop(queues);
                            warn!(sid = frame_sid, "dropping frame for unknown stream id");
                            self.recycle(frame);
                        }
                    }
                }
                None => {
                    warn!("dropping frame with unreadable stream id");
                    self.recycle(frame);
                }
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    // One last look in case another thread queued for us.
                    return lock(&self.queues).get_mut(&sid)?.pop_front();
                }
            }
        }
    }

    fn frame_sid(&self, frame: &FrameBuff) -> Option<u32> {
        match self.codec.peek_dst(frame.data()).ok()? {
            DstId::Sid(sid) => Some(sid),
            DstId::Epid(epid) => Some(u32::from(epid)),
        }
    }

    fn recycle(&self, frame: FrameBuff) {
        if let Err(err) = self.link.release_recv(frame) {
            warn!(link = %self.link.link_id(), %err, "failed to recycle frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chdrlink_link::{MemLinkParams, MemRecvLink};
    use chdrlink_packet::{ChdrHeader, ChdrW, Endianness, PacketType};

    fn make_link(num_frames: usize) -> Arc<MemRecvLink> {
        Arc::new(MemRecvLink::new(MemLinkParams {
            num_frames,
            frame_size: 256,
        }))
    }

    fn codec() -> ChdrCodec {
        ChdrCodec::new(Endianness::Big, ChdrW::W32)
    }

    fn push_packet(link: &MemRecvLink, sid: u32, marker: u8) {
        let header = ChdrHeader::new(PacketType::Data, DstId::Sid(sid));
        let mut buf = [0u8; 64];
        let n = codec()
            .pack(&header, None, &[], &[marker], &mut buf)
            .unwrap();
        assert!(link.push_input(&buf[..n], Some(Duration::ZERO)));
    }

    fn marker_of(codec: &ChdrCodec, frame: &FrameBuff) -> u8 {
        codec.unpack(frame.data()).unwrap().payload[0]
    }

    #[test]
    fn isolates_interleaved_streams_in_arrival_order() {
        let link = make_link(8);
        let demux = RecvDemuxer::new(link.clone(), codec());
        demux.realloc_sid(0xA);
        demux.realloc_sid(0xB);

        push_packet(&link, 0xA, 1);
        push_packet(&link, 0xB, 101);
        push_packet(&link, 0xA, 2);
        push_packet(&link, 0xB, 102);
        push_packet(&link, 0xA, 3);

        let c = codec();
        for expected in [1u8, 2, 3] {
            let frame = demux.pop(0xA, Some(Duration::from_millis(100))).unwrap();
            assert_eq!(marker_of(&c, &frame), expected);
            link.release_recv(frame).unwrap();
        }
        for expected in [101u8, 102] {
            let frame = demux.pop(0xB, Some(Duration::ZERO)).unwrap();
            assert_eq!(marker_of(&c, &frame), expected);
            link.release_recv(frame).unwrap();
        }
        assert_eq!(link.available_frames(), 8);
    }

    #[test]
    fn realloc_discards_stale_frames() {
        let link = make_link(4);
        let demux = RecvDemuxer::new(link.clone(), codec());
        demux.realloc_sid(0xA);
        demux.realloc_sid(0xB);

        // Queue two frames for B by popping on A.
        push_packet(&link, 0xB, 1);
        push_packet(&link, 0xB, 2);
        assert!(demux.pop(0xA, Some(Duration::from_millis(20))).is_none());

        demux.realloc_sid(0xB);
        // Stale frames are gone and back in the pool.
        assert!(demux.pop(0xB, Some(Duration::ZERO)).is_none());
        assert_eq!(link.available_frames(), 4);

        // New traffic still flows.
        push_packet(&link, 0xB, 3);
        let c = codec();
        let frame = demux.pop(0xB, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(marker_of(&c, &frame), 3);
        link.release_recv(frame).unwrap();
    }

    #[test]
    fn unknown_stream_id_is_absorbed() {
        let link = make_link(4);
        let demux = RecvDemuxer::new(link.clone(), codec());
        demux.realloc_sid(0xA);

        push_packet(&link, 0xDEAD, 9);
        assert!(demux.pop(0xA, Some(Duration::from_millis(20))).is_none());
        assert_eq!(link.available_frames(), 4);
    }

    #[test]
    fn pop_on_unregistered_id_returns_no_data() {
        let link = make_link(2);
        let demux = RecvDemuxer::new(link.clone(), codec());
        assert!(demux.pop(0x1, Some(Duration::ZERO)).is_none());
    }

    #[test]
    fn unregister_recycles_queued_frames() {
        let link = make_link(2);
        let demux = RecvDemuxer::new(link.clone(), codec());
        demux.realloc_sid(0xA);
        demux.realloc_sid(0xB);

        push_packet(&link, 0xB, 1);
        assert!(demux.pop(0xA, Some(Duration::from_millis(20))).is_none());
        demux.unregister_sid(0xB);
        assert_eq!(link.available_frames(), 2);
        assert!(demux.pop(0xB, Some(Duration::ZERO)).is_none());
    }

    #[test]
    fn garbage_frames_are_recycled() {
        let link = make_link(2);
        let demux = RecvDemuxer::new(link.clone(), codec());
        demux.realloc_sid(0xA);

        assert!(link.push_input(&[0xFF, 0x01], Some(Duration::ZERO)));
        assert!(demux.pop(0xA, Some(Duration::from_millis(20))).is_none());
        assert_eq!(link.available_frames(), 2);
    }
}
