use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Result;
use crate::frame::{Direction, FrameBuff, FramePool};
use crate::link::{LinkId, RecvLink, SendLink};

/// Parameters for the in-memory link endpoints.
#[derive(Debug, Clone)]
pub struct MemLinkParams {
    pub num_frames: usize,
    pub frame_size: usize,
}

impl Default for MemLinkParams {
    fn default() -> Self {
        Self {
            num_frames: 16,
            frame_size: 8192,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ByteQueue {
    queue: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

impl ByteQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, bytes: Vec<u8>) {
        lock(&self.queue).push_back(bytes);
        self.ready.notify_one();
    }

    fn pop(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = lock(&self.queue);
        loop {
            if let Some(bytes) = queue.pop_front() {
                return Some(bytes);
            }
            match deadline {
                None => {
                    queue = self
                        .ready
                        .wait(queue)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    queue = guard;
                }
            }
        }
    }
}

/// In-memory send link: released frames land on an output queue the far end
/// (a test or device simulator) drains with [`pop_output`](Self::pop_output).
///
/// Stands in for the UDP/DMA/PCIe drivers that live outside this workspace.
pub struct MemSendLink {
    id: LinkId,
    pool: FramePool,
    output: Arc<ByteQueue>,
}

impl MemSendLink {
    pub fn new(params: MemLinkParams) -> Self {
        Self {
            id: LinkId::new(),
            pool: FramePool::new(params.num_frames, params.frame_size, Direction::Send),
            output: Arc::new(ByteQueue::new()),
        }
    }

    /// Pop the next transmitted datagram, waiting up to `timeout`.
    pub fn pop_output(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        self.output.pop(timeout)
    }

    /// Frames currently on the free list. All frames are free when nothing
    /// holds a send buffer.
    pub fn available_frames(&self) -> usize {
        self.pool.available()
    }
}

impl SendLink for MemSendLink {
    fn acquire_send(&self, timeout: Option<Duration>) -> Option<FrameBuff> {
        self.pool.acquire(timeout)
    }

    fn release_send(&self, frame: FrameBuff) -> Result<()> {
        if !frame.is_empty() {
            self.output.push(frame.data().to_vec());
        }
        self.pool.release(frame)
    }

    fn num_send_frames(&self) -> usize {
        self.pool.num_frames()
    }

    fn send_frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    fn link_id(&self) -> LinkId {
        self.id
    }
}

/// In-memory receive link: the far end injects datagrams with
/// [`push_input`](Self::push_input); they surface through `acquire_recv` in
/// arrival order.
pub struct MemRecvLink {
    id: LinkId,
    pool: FramePool,
    inbound: Mutex<VecDeque<FrameBuff>>,
    ready: Condvar,
}

impl MemRecvLink {
    pub fn new(params: MemLinkParams) -> Self {
        Self {
            id: LinkId::new(),
            pool: FramePool::new(params.num_frames, params.frame_size, Direction::Recv),
            inbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Deliver a datagram into the link, waiting up to `timeout` for a free
    /// frame. Returns false when the datagram was dropped (no frame in time,
    /// or larger than the frame size) — the same fate an overrun NIC gives
    /// excess packets.
    pub fn push_input(&self, bytes: &[u8], timeout: Option<Duration>) -> bool {
        if bytes.len() > self.pool.frame_size() {
            warn!(
                link = %self.id,
                len = bytes.len(),
                frame_size = self.pool.frame_size(),
                "dropping oversized inbound datagram"
            );
            return false;
        }
        let Some(mut frame) = self.pool.acquire(timeout) else {
            warn!(link = %self.id, "dropping inbound datagram, no free frame");
            return false;
        };
        frame.region_mut()[..bytes.len()].copy_from_slice(bytes);
        frame.set_len(bytes.len());
        lock(&self.inbound).push_back(frame);
        self.ready.notify_one();
        true
    }

    /// Frames currently on the free list. Equal to `num_recv_frames()` only
    /// when every frame has been consumed and released.
    pub fn available_frames(&self) -> usize {
        self.pool.available()
    }
}

impl RecvLink for MemRecvLink {
    fn acquire_recv(&self, timeout: Option<Duration>) -> Option<FrameBuff> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inbound = lock(&self.inbound);
        loop {
            if let Some(frame) = inbound.pop_front() {
                return Some(frame);
            }
            match deadline {
                None => {
                    inbound = self
                        .ready
                        .wait(inbound)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(inbound, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    inbound = guard;
                }
            }
        }
    }

    fn release_recv(&self, frame: FrameBuff) -> Result<()> {
        self.pool.release(frame)
    }

    fn num_recv_frames(&self) -> usize {
        self.pool.num_frames()
    }

    fn recv_frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    fn link_id(&self) -> LinkId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_params() -> MemLinkParams {
        MemLinkParams {
            num_frames: 2,
            frame_size: 64,
        }
    }

    #[test]
    fn send_link_transmits_committed_bytes() {
        let link = MemSendLink::new(small_params());
        let mut frame = link.acquire_send(Some(Duration::ZERO)).unwrap();
        frame.region_mut()[..3].copy_from_slice(b"abc");
        frame.set_len(3);
        link.release_send(frame).unwrap();

        assert_eq!(link.pop_output(Some(Duration::ZERO)).unwrap(), b"abc");
        assert_eq!(link.available_frames(), 2);
    }

    #[test]
    fn zero_length_send_frame_is_aborted() {
        let link = MemSendLink::new(small_params());
        let frame = link.acquire_send(Some(Duration::ZERO)).unwrap();
        link.release_send(frame).unwrap();

        assert!(link.pop_output(Some(Duration::ZERO)).is_none());
        assert_eq!(link.available_frames(), 2);
    }

    #[test]
    fn recv_link_delivers_in_arrival_order() {
        let link = MemRecvLink::new(small_params());
        assert!(link.push_input(b"first", Some(Duration::ZERO)));
        assert!(link.push_input(b"second", Some(Duration::ZERO)));

        let a = link.acquire_recv(Some(Duration::ZERO)).unwrap();
        assert_eq!(a.data(), b"first");
        let b = link.acquire_recv(Some(Duration::ZERO)).unwrap();
        assert_eq!(b.data(), b"second");

        link.release_recv(a).unwrap();
        link.release_recv(b).unwrap();
        assert_eq!(link.available_frames(), 2);
    }

    #[test]
    fn recv_link_drops_when_pool_exhausted() {
        let link = MemRecvLink::new(small_params());
        assert!(link.push_input(b"1", Some(Duration::ZERO)));
        assert!(link.push_input(b"2", Some(Duration::ZERO)));
        assert!(!link.push_input(b"3", Some(Duration::ZERO)));
    }

    #[test]
    fn recv_link_drops_oversized_input() {
        let link = MemRecvLink::new(small_params());
        let oversized = vec![0u8; 65];
        assert!(!link.push_input(&oversized, Some(Duration::ZERO)));
        assert_eq!(link.available_frames(), 2);
    }

    #[test]
    fn blocking_recv_wakes_on_input() {
        let link = Arc::new(MemRecvLink::new(small_params()));
        let waiter = {
            let link = Arc::clone(&link);
            thread::spawn(move || link.acquire_recv(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(10));
        assert!(link.push_input(b"wake", Some(Duration::ZERO)));
        let frame = waiter.join().unwrap().unwrap();
        assert_eq!(frame.data(), b"wake");
        link.release_recv(frame).unwrap();
    }

    #[test]
    fn recv_timeout_returns_none() {
        let link = MemRecvLink::new(small_params());
        let start = Instant::now();
        assert!(link.acquire_recv(Some(Duration::from_millis(15))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
