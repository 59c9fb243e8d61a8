//! Inline I/O service: the calling thread drives the link.
//!
//! Every receive link gets a mux. The first caller to observe a frame
//! belonging to another client queues it on that client's FIFO instead of
//! requiring a dedicated thread per session; frames matching no registered
//! filter are logged and recycled. No lock is ever held across a blocking
//! link call — only across an enqueue, a dequeue, or a filter dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chdrlink_link::{FrameBuff, LinkId, RecvLink, SendLink};
use tracing::{debug, warn};

use crate::error::{IoError, Result};
use crate::service::{
    CallbackResult, IoService, RecvCallback, RecvFcCallback, RecvIo, SendCallback, SendFc, SendIo,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MuxClient {
    id: u64,
    cb: RecvCallback,
    queue: VecDeque<FrameBuff>,
}

struct MuxState {
    clients: Vec<MuxClient>,
    next_client_id: u64,
}

/// Shares one receive link between several logical sessions. Whoever drives
/// the link dispatches each frame through every registered filter and queues
/// it for the session it matched.
struct RecvMux {
    link: Arc<dyn RecvLink>,
    state: Mutex<MuxState>,
}

impl RecvMux {
    fn new(link: Arc<dyn RecvLink>) -> Self {
        Self {
            link,
            state: Mutex::new(MuxState {
                clients: Vec::new(),
                next_client_id: 0,
            }),
        }
    }

    fn connect(&self, cb: RecvCallback) -> u64 {
        let mut state = lock(&self.state);
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.push(MuxClient {
            id,
            cb,
            queue: VecDeque::new(),
        });
        id
    }

    fn disconnect(&self, client_id: u64) {
        let stale = {
            let mut state = lock(&self.state);
            match state.clients.iter().position(|c| c.id == client_id) {
                Some(index) => state.clients.remove(index).queue,
                None => VecDeque::new(),
            }
        };
        for frame in stale {
            if let Err(err) = self.link.release_recv(frame) {
                warn!(link = %self.link.link_id(), %err, "failed to recycle queued frame");
            }
        }
    }

    fn recv(&self, client_id: u64, timeout: Option<Duration>) -> Option<FrameBuff> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Fast path: something already queued for us, possibly by
            // another session's drive of the link.
            {
                let mut state = lock(&self.state);
                if let Some(client) = state.clients.iter_mut().find(|c| c.id == client_id) {
                    if let Some(frame) = client.queue.pop_front() {
                        return Some(frame);
                    }
                } else {
                    return None;
                }
            }

            let link_timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some(frame) = self.link.acquire_recv(link_timeout) else {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return None;
                    }
                }
                continue;
            };

            // Dispatch under the state lock; filters classify, they never
            // block.
            let unclaimed = {
                let mut state = lock(&self.state);
                let mut offered = Some(frame);
                let mut verdict = None;
                for client in state.clients.iter_mut() {
                    let Some(frame) = offered.take() else { break };
                    match (client.cb)(frame, &*self.link) {
                        CallbackResult::Matched(frame) => {
                            verdict = Some((client.id, Some(frame)));
                            break;
                        }
                        CallbackResult::Consumed => {
                            verdict = Some((client.id, None));
                            break;
                        }
                        CallbackResult::NotMine(frame) => {
                            offered = Some(frame);
                        }
                    }
                }
                match verdict {
                    Some((winner, Some(frame))) => {
                        if winner == client_id {
                            return Some(frame);
                        }
                        if let Some(client) = state.clients.iter_mut().find(|c| c.id == winner) {
                            // Cannot overflow: every queue can hold the
                            // link's full frame count.
                            client.queue.push_back(frame);
                        }
                        None
                    }
                    Some((_, None)) => None,
                    None => offered,
                }
            };

            if let Some(frame) = unclaimed {
                warn!(link = %self.link.link_id(), "dropping packet with no receiver");
                if let Err(err) = self.link.release_recv(frame) {
                    warn!(link = %self.link.link_id(), %err, "failed to recycle dropped frame");
                }
            }
        }
    }
}

struct RecvEntry {
    mux: Arc<RecvMux>,
    reserved: usize,
}

struct SendEntry {
    link: Arc<dyn SendLink>,
    reserved: usize,
}

struct Inner {
    recv_links: Mutex<HashMap<LinkId, RecvEntry>>,
    send_links: Mutex<HashMap<LinkId, SendEntry>>,
}

impl Inner {
    fn reserve_recv(&self, link_id: LinkId, num_frames: usize) -> Result<Arc<RecvMux>> {
        let mut table = lock(&self.recv_links);
        let entry = table.get_mut(&link_id).ok_or(IoError::NotAttached)?;
        let capacity = entry.mux.link.num_recv_frames();
        if entry.reserved + num_frames > capacity {
            return Err(IoError::ResourceExhausted {
                requested: entry.reserved + num_frames,
                available: capacity,
            });
        }
        entry.reserved += num_frames;
        Ok(Arc::clone(&entry.mux))
    }

    fn unreserve_recv(&self, link_id: LinkId, num_frames: usize) {
        if let Some(entry) = lock(&self.recv_links).get_mut(&link_id) {
            entry.reserved = entry.reserved.saturating_sub(num_frames);
        }
    }

    fn reserve_send(&self, link_id: LinkId, num_frames: usize) -> Result<Arc<dyn SendLink>> {
        let mut table = lock(&self.send_links);
        let entry = table.get_mut(&link_id).ok_or(IoError::NotAttached)?;
        let capacity = entry.link.num_send_frames();
        if entry.reserved + num_frames > capacity {
            return Err(IoError::ResourceExhausted {
                requested: entry.reserved + num_frames,
                available: capacity,
            });
        }
        entry.reserved += num_frames;
        Ok(Arc::clone(&entry.link))
    }

    fn unreserve_send(&self, link_id: LinkId, num_frames: usize) {
        if let Some(entry) = lock(&self.send_links).get_mut(&link_id) {
            entry.reserved = entry.reserved.saturating_sub(num_frames);
        }
    }
}

/// I/O service without worker threads: every operation executes on the
/// calling thread.
#[derive(Clone)]
pub struct InlineIoService {
    inner: Arc<Inner>,
}

impl InlineIoService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                recv_links: Mutex::new(HashMap::new()),
                send_links: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for InlineIoService {
    fn default() -> Self {
        Self::new()
    }
}

impl IoService for InlineIoService {
    fn attach_recv_link(&self, link: Arc<dyn RecvLink>) -> Result<()> {
        let link_id = link.link_id();
        let mut table = lock(&self.inner.recv_links);
        if table.contains_key(&link_id) {
            return Err(IoError::AlreadyAttached);
        }
        debug!(link = %link_id, "attaching recv link");
        table.insert(
            link_id,
            RecvEntry {
                mux: Arc::new(RecvMux::new(link)),
                reserved: 0,
            },
        );
        Ok(())
    }

    fn attach_send_link(&self, link: Arc<dyn SendLink>) -> Result<()> {
        let link_id = link.link_id();
        let mut table = lock(&self.inner.send_links);
        if table.contains_key(&link_id) {
            return Err(IoError::AlreadyAttached);
        }
        debug!(link = %link_id, "attaching send link");
        table.insert(link_id, SendEntry { link, reserved: 0 });
        Ok(())
    }

    fn detach_recv_link(&self, link_id: LinkId) -> Result<()> {
        let mut table = lock(&self.inner.recv_links);
        let entry = table.get(&link_id).ok_or(IoError::NotAttached)?;
        if entry.reserved != 0 {
            return Err(IoError::Configuration(format!(
                "cannot detach {link_id}: {} frames still reserved",
                entry.reserved
            )));
        }
        debug!(link = %link_id, "detaching recv link");
        table.remove(&link_id);
        Ok(())
    }

    fn detach_send_link(&self, link_id: LinkId) -> Result<()> {
        let mut table = lock(&self.inner.send_links);
        let entry = table.get(&link_id).ok_or(IoError::NotAttached)?;
        if entry.reserved != 0 {
            return Err(IoError::Configuration(format!(
                "cannot detach {link_id}: {} frames still reserved",
                entry.reserved
            )));
        }
        debug!(link = %link_id, "detaching send link");
        table.remove(&link_id);
        Ok(())
    }

    fn make_recv_client(
        &self,
        recv_link: Arc<dyn RecvLink>,
        num_recv_frames: usize,
        recv_cb: RecvCallback,
        fc_cb: Option<RecvFcCallback>,
    ) -> Result<Box<dyn RecvIo>> {
        if num_recv_frames == 0 {
            return Err(IoError::Configuration(
                "recv client must reserve at least one frame".to_string(),
            ));
        }
        let link_id = recv_link.link_id();
        let mux = self.inner.reserve_recv(link_id, num_recv_frames)?;
        let client_id = mux.connect(recv_cb);
        debug!(link = %link_id, client_id, num_recv_frames, "connected recv client");
        Ok(Box::new(InlineRecvIo {
            inner: Arc::clone(&self.inner),
            mux,
            link: recv_link,
            link_id,
            client_id,
            num_recv_frames,
            fc_cb,
        }))
    }

    fn make_send_client(
        &self,
        send_link: Arc<dyn SendLink>,
        num_send_frames: usize,
        send_cb: SendCallback,
        fc: Option<SendFc>,
    ) -> Result<Box<dyn SendIo>> {
        if num_send_frames == 0 {
            return Err(IoError::Configuration(
                "send client must reserve at least one frame".to_string(),
            ));
        }
        let link_id = send_link.link_id();
        let send_link = self.inner.reserve_send(link_id, num_send_frames)?;

        let fc_side = match fc {
            Some(fc) => {
                let fc_link_id = fc.recv_link.link_id();
                let mux = match self.inner.reserve_recv(fc_link_id, fc.num_recv_frames) {
                    Ok(mux) => mux,
                    Err(err) => {
                        self.inner.unreserve_send(link_id, num_send_frames);
                        return Err(err);
                    }
                };
                let client_id = mux.connect(fc.recv_cb);
                Some(FcSide {
                    mux,
                    link: fc.recv_link,
                    link_id: fc_link_id,
                    client_id,
                    num_recv_frames: fc.num_recv_frames,
                })
            }
            None => None,
        };

        debug!(link = %link_id, num_send_frames, "connected send client");
        Ok(Box::new(InlineSendIo {
            inner: Arc::clone(&self.inner),
            send_link,
            link_id,
            num_send_frames,
            send_cb,
            fc: fc_side,
        }))
    }
}

struct InlineRecvIo {
    inner: Arc<Inner>,
    mux: Arc<RecvMux>,
    link: Arc<dyn RecvLink>,
    link_id: LinkId,
    client_id: u64,
    num_recv_frames: usize,
    fc_cb: Option<RecvFcCallback>,
}

impl std::fmt::Debug for InlineRecvIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineRecvIo")
            .field("link_id", &self.link_id)
            .field("client_id", &self.client_id)
            .field("num_recv_frames", &self.num_recv_frames)
            .finish_non_exhaustive()
    }
}

impl RecvIo for InlineRecvIo {
    fn get_recv_buff(&mut self, timeout: Option<Duration>) -> Option<FrameBuff> {
        self.mux.recv(self.client_id, timeout)
    }

    fn release_recv_buff(&mut self, frame: FrameBuff) {
        match &mut self.fc_cb {
            Some(fc_cb) => fc_cb(frame, &*self.link),
            None => {
                if let Err(err) = self.link.release_recv(frame) {
                    warn!(link = %self.link_id, %err, "failed to release recv frame");
                }
            }
        }
    }

    fn num_recv_frames(&self) -> usize {
        self.num_recv_frames
    }
}

impl Drop for InlineRecvIo {
    fn drop(&mut self) {
        self.mux.disconnect(self.client_id);
        self.inner.unreserve_recv(self.link_id, self.num_recv_frames);
        debug!(link = %self.link_id, client_id = self.client_id, "disconnected recv client");
    }
}

struct FcSide {
    mux: Arc<RecvMux>,
    link: Arc<dyn RecvLink>,
    link_id: LinkId,
    client_id: u64,
    num_recv_frames: usize,
}

struct InlineSendIo {
    inner: Arc<Inner>,
    send_link: Arc<dyn SendLink>,
    link_id: LinkId,
    num_send_frames: usize,
    send_cb: SendCallback,
    fc: Option<FcSide>,
}

impl std::fmt::Debug for InlineSendIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineSendIo")
            .field("link_id", &self.link_id)
            .field("num_send_frames", &self.num_send_frames)
            .finish_non_exhaustive()
    }
}

impl SendIo for InlineSendIo {
    fn get_send_buff(&mut self, timeout: Option<Duration>) -> Option<FrameBuff> {
        self.send_link.acquire_send(timeout)
    }

    fn release_send_buff(&mut self, frame: FrameBuff) {
        let mut frame = frame;
        loop {
            // Poll the paired recv side so flow-control responses can land
            // before the send hook decides whether the destination is ready.
            if let Some(fc) = &self.fc {
                if let Some(stray) = fc.mux.recv(fc.client_id, Some(Duration::ZERO)) {
                    if let Err(err) = fc.link.release_recv(stray) {
                        warn!(link = %fc.link_id, %err, "failed to recycle fc frame");
                    }
                }
            }
            match (self.send_cb)(frame, &*self.send_link) {
                None => return,
                Some(deferred) => {
                    // Destination not ready yet; retry until the hook's own
                    // policy lets the frame through.
                    frame = deferred;
                    std::thread::yield_now();
                }
            }
        }
    }

    fn num_send_frames(&self) -> usize {
        self.num_send_frames
    }
}

impl Drop for InlineSendIo {
    fn drop(&mut self) {
        if let Some(fc) = &self.fc {
            fc.mux.disconnect(fc.client_id);
            self.inner.unreserve_recv(fc.link_id, fc.num_recv_frames);
        }
        self.inner.unreserve_send(self.link_id, self.num_send_frames);
        debug!(link = %self.link_id, "disconnected send client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chdrlink_link::{MemLinkParams, MemRecvLink, MemSendLink};

    fn params(num_frames: usize) -> MemLinkParams {
        MemLinkParams {
            num_frames,
            frame_size: 256,
        }
    }

    /// Filter matching frames whose first byte equals `tag`.
    fn tag_filter(tag: u8) -> RecvCallback {
        Box::new(move |frame, _link| {
            if frame.data().first() == Some(&tag) {
                CallbackResult::Matched(frame)
            } else {
                CallbackResult::NotMine(frame)
            }
        })
    }

    fn passthrough_send() -> SendCallback {
        Box::new(|frame, link: &dyn SendLink| {
            link.release_send(frame).unwrap();
            None
        })
    }

    #[test]
    fn single_client_receives_in_order() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(4)));
        io_srv.attach_recv_link(link.clone()).unwrap();

        let mut client = io_srv
            .make_recv_client(link.clone(), 2, tag_filter(1), None)
            .unwrap();

        link.push_input(&[1, 10], Some(Duration::ZERO));
        link.push_input(&[1, 11], Some(Duration::ZERO));

        let a = client.get_recv_buff(Some(Duration::ZERO)).unwrap();
        assert_eq!(a.data(), &[1, 10]);
        client.release_recv_buff(a);
        let b = client.get_recv_buff(Some(Duration::ZERO)).unwrap();
        assert_eq!(b.data(), &[1, 11]);
        client.release_recv_buff(b);

        assert!(client.get_recv_buff(Some(Duration::ZERO)).is_none());
        assert_eq!(link.available_frames(), 4);
    }

    #[test]
    fn mux_queues_frames_for_the_other_session() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(4)));
        io_srv.attach_recv_link(link.clone()).unwrap();

        let mut one = io_srv
            .make_recv_client(link.clone(), 2, tag_filter(1), None)
            .unwrap();
        let mut two = io_srv
            .make_recv_client(link.clone(), 2, tag_filter(2), None)
            .unwrap();

        // Interleaved arrivals; client one drives the link first.
        link.push_input(&[2, 20], Some(Duration::ZERO));
        link.push_input(&[2, 21], Some(Duration::ZERO));
        link.push_input(&[1, 10], Some(Duration::ZERO));

        let frame = one.get_recv_buff(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(frame.data(), &[1, 10]);
        one.release_recv_buff(frame);

        // Client two finds its frames already queued, in arrival order.
        let frame = two.get_recv_buff(Some(Duration::ZERO)).unwrap();
        assert_eq!(frame.data(), &[2, 20]);
        two.release_recv_buff(frame);
        let frame = two.get_recv_buff(Some(Duration::ZERO)).unwrap();
        assert_eq!(frame.data(), &[2, 21]);
        two.release_recv_buff(frame);
    }

    #[test]
    fn unmatched_frames_are_recycled() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(2)));
        io_srv.attach_recv_link(link.clone()).unwrap();

        let mut client = io_srv
            .make_recv_client(link.clone(), 2, tag_filter(1), None)
            .unwrap();

        link.push_input(&[9, 9], Some(Duration::ZERO));
        assert!(client.get_recv_buff(Some(Duration::from_millis(20))).is_none());
        // The stray frame went back to the pool, not into any queue.
        assert_eq!(link.available_frames(), 2);
    }

    #[test]
    fn reservation_accounting_rejects_overcommit() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(3)));
        io_srv.attach_recv_link(link.clone()).unwrap();

        let _a = io_srv
            .make_recv_client(link.clone(), 2, tag_filter(1), None)
            .unwrap();
        let err = io_srv
            .make_recv_client(link.clone(), 2, tag_filter(2), None)
            .unwrap_err();
        assert!(matches!(err, IoError::ResourceExhausted { requested: 4, available: 3 }));

        // Dropping a client returns its reservation.
        drop(_a);
        assert!(io_srv
            .make_recv_client(link.clone(), 3, tag_filter(3), None)
            .is_ok());
    }

    #[test]
    fn duplicate_attach_and_missing_attach_are_errors() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(2)));
        io_srv.attach_recv_link(link.clone()).unwrap();
        assert!(matches!(
            io_srv.attach_recv_link(link.clone()),
            Err(IoError::AlreadyAttached)
        ));

        let other = Arc::new(MemRecvLink::new(params(2)));
        let err = io_srv
            .make_recv_client(other, 1, tag_filter(0), None)
            .unwrap_err();
        assert!(matches!(err, IoError::NotAttached));
    }

    #[test]
    fn detach_requires_all_clients_gone() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(2)));
        io_srv.attach_recv_link(link.clone()).unwrap();

        let client = io_srv
            .make_recv_client(link.clone(), 1, tag_filter(1), None)
            .unwrap();
        assert!(matches!(
            io_srv.detach_recv_link(link.link_id()),
            Err(IoError::Configuration(_))
        ));
        drop(client);
        io_srv.detach_recv_link(link.link_id()).unwrap();
        assert!(matches!(
            io_srv.detach_recv_link(link.link_id()),
            Err(IoError::NotAttached)
        ));
    }

    #[test]
    fn send_client_transmits_through_hook() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemSendLink::new(params(2)));
        io_srv.attach_send_link(link.clone()).unwrap();

        let mut client = io_srv
            .make_send_client(link.clone(), 1, passthrough_send(), None)
            .unwrap();

        let mut frame = client.get_send_buff(Some(Duration::ZERO)).unwrap();
        frame.region_mut()[..2].copy_from_slice(&[7, 8]);
        frame.set_len(2);
        client.release_send_buff(frame);

        assert_eq!(link.pop_output(Some(Duration::ZERO)).unwrap(), &[7, 8]);
    }

    #[test]
    fn send_hook_retries_until_ready() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemSendLink::new(params(1)));
        io_srv.attach_send_link(link.clone()).unwrap();

        let mut remaining_defers = 3usize;
        let send_cb: SendCallback = Box::new(move |frame, link: &dyn SendLink| {
            if remaining_defers > 0 {
                remaining_defers -= 1;
                Some(frame)
            } else {
                link.release_send(frame).unwrap();
                None
            }
        });
        let mut client = io_srv.make_send_client(link.clone(), 1, send_cb, None).unwrap();

        let mut frame = client.get_send_buff(Some(Duration::ZERO)).unwrap();
        frame.region_mut()[0] = 0xAB;
        frame.set_len(1);
        client.release_send_buff(frame);

        assert_eq!(link.pop_output(Some(Duration::ZERO)).unwrap(), &[0xAB]);
    }

    #[test]
    fn recv_release_runs_fc_hook() {
        let io_srv = InlineIoService::new();
        let link = Arc::new(MemRecvLink::new(params(2)));
        io_srv.attach_recv_link(link.clone()).unwrap();

        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let fc_cb: RecvFcCallback = Box::new(move |frame, link: &dyn RecvLink| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _ = link.release_recv(frame);
        });

        let mut client = io_srv
            .make_recv_client(link.clone(), 1, tag_filter(1), Some(fc_cb))
            .unwrap();

        link.push_input(&[1], Some(Duration::ZERO));
        let frame = client.get_recv_buff(Some(Duration::ZERO)).unwrap();
        client.release_recv_buff(frame);

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(link.available_frames(), 2);
    }
}
