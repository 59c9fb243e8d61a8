use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::frame::FrameBuff;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity for one link endpoint.
///
/// Used as the key in I/O service reservation tables instead of pointer
/// identity, so tearing a link down can never leave a dangling reference
/// behind in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Allocate a fresh id. Called once per link endpoint at construction.
    pub fn new() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Transmit side of a physical link.
///
/// The transport core treats implementations as an opaque capability set; it
/// never inspects driver internals (socket descriptors, DMA descriptors).
pub trait SendLink: Send + Sync {
    /// Take an empty send frame from the link's pool, waiting up to
    /// `timeout` (`None` blocks, `Some(Duration::ZERO)` never does).
    fn acquire_send(&self, timeout: Option<Duration>) -> Option<FrameBuff>;

    /// Commit the frame's valid bytes to the wire and recycle it.
    /// A zero-length frame is recycled without transmission.
    fn release_send(&self, frame: FrameBuff) -> Result<()>;

    /// Size of this link's send frame pool.
    fn num_send_frames(&self) -> usize;

    /// Capacity of each send frame in bytes.
    fn send_frame_size(&self) -> usize;

    fn link_id(&self) -> LinkId;
}

/// Receive side of a physical link.
pub trait RecvLink: Send + Sync {
    /// Take the next received frame, waiting up to `timeout`
    /// (`None` blocks, `Some(Duration::ZERO)` never does).
    fn acquire_recv(&self, timeout: Option<Duration>) -> Option<FrameBuff>;

    /// Return a consumed frame to the link's pool.
    fn release_recv(&self, frame: FrameBuff) -> Result<()>;

    /// Size of this link's receive frame pool.
    fn num_recv_frames(&self) -> usize;

    /// Capacity of each receive frame in bytes.
    fn recv_frame_size(&self) -> usize;

    fn link_id(&self) -> LinkId;
}
