use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{LinkError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Direction a frame moves in. Assigned at pool construction; a frame never
/// changes direction over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FreeSlot {
    data: Box<[u8]>,
    slot: usize,
}

struct PoolShared {
    free: Mutex<VecDeque<FreeSlot>>,
    available: Condvar,
}

/// A fixed-capacity buffer for exactly one in-flight packet.
///
/// A frame is owned exclusively by whichever stage currently holds it; it
/// changes hands by move and returns to its pool through
/// [`FramePool::release`]. Dropping a frame also returns it, so a frame can
/// be neither leaked nor released twice.
pub struct FrameBuff {
    data: Option<Box<[u8]>>,
    len: usize,
    slot: usize,
    direction: Direction,
    pool_id: u64,
    shared: Arc<PoolShared>,
}

impl FrameBuff {
    /// Total capacity of the backing region in bytes.
    pub fn capacity(&self) -> usize {
        self.region().len()
    }

    /// Number of valid bytes currently committed to this frame.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes have been committed yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commit the valid length. Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "frame length {len} exceeds capacity {}",
            self.capacity()
        );
        self.len = len;
    }

    /// The valid bytes of this frame.
    pub fn data(&self) -> &[u8] {
        let len = self.len;
        &self.region()[..len]
    }

    /// The valid bytes of this frame, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.region_mut()[..len]
    }

    /// The full backing region, regardless of valid length. Writers fill a
    /// prefix of this and commit it with [`set_len`](Self::set_len).
    pub fn region_mut(&mut self) -> &mut [u8] {
        self.data.as_mut().map(|d| &mut d[..]).unwrap_or(&mut [])
    }

    /// Arena slot index within the owning pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Identity of the pool this frame belongs to.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    fn region(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl Drop for FrameBuff {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let mut free = lock(&self.shared.free);
            free.push_back(FreeSlot {
                data,
                slot: self.slot,
            });
            drop(free);
            self.shared.available.notify_one();
        }
    }
}

impl fmt::Debug for FrameBuff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuff")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("direction", &self.direction)
            .finish()
    }
}

/// A fixed arena of frames, cycled between the free list and whoever holds
/// them. The pool never grows: at most `num_frames` frames exist, each of
/// exactly `frame_size` bytes.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
    pool_id: u64,
    num_frames: usize,
    frame_size: usize,
    direction: Direction,
}

impl FramePool {
    pub fn new(num_frames: usize, frame_size: usize, direction: Direction) -> Self {
        assert!(num_frames > 0, "frame pool must hold at least one frame");
        assert!(frame_size > 0, "frame size must be non-zero");
        let mut free = VecDeque::with_capacity(num_frames);
        for slot in 0..num_frames {
            free.push_back(FreeSlot {
                data: vec![0u8; frame_size].into_boxed_slice(),
                slot,
            });
        }
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                available: Condvar::new(),
            }),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            num_frames,
            frame_size,
            direction,
        }
    }

    /// Take a free frame, waiting up to `timeout`.
    ///
    /// `None` blocks until a frame is free; `Some(Duration::ZERO)` performs a
    /// single non-blocking check. Returns `None` when no frame became free
    /// within the timeout.
    pub fn acquire(&self, timeout: Option<Duration>) -> Option<FrameBuff> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut free = lock(&self.shared.free);
        loop {
            if let Some(slot) = free.pop_front() {
                return Some(FrameBuff {
                    data: Some(slot.data),
                    len: 0,
                    slot: slot.slot,
                    direction: self.direction,
                    pool_id: self.pool_id,
                    shared: Arc::clone(&self.shared),
                });
            }
            match deadline {
                None => {
                    free = self
                        .shared
                        .available
                        .wait(free)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .shared
                        .available
                        .wait_timeout(free, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    free = guard;
                }
            }
        }
    }

    /// Return a frame to this pool's free list.
    ///
    /// Releasing a frame from another pool is an error, but the frame still
    /// finds its way back to the pool it came from.
    pub fn release(&self, frame: FrameBuff) -> Result<()> {
        if frame.pool_id != self.pool_id {
            let frame_pool = frame.pool_id;
            drop(frame);
            return Err(LinkError::ForeignFrame {
                frame_pool,
                pool: self.pool_id,
            });
        }
        drop(frame);
        Ok(())
    }

    /// Number of frames currently on the free list.
    pub fn available(&self) -> usize {
        lock(&self.shared.free).len()
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("pool_id", &self.pool_id)
            .field("num_frames", &self.num_frames)
            .field("frame_size", &self.frame_size)
            .field("direction", &self.direction)
            .field("available", &self.available())
            .finish()
    }
}
