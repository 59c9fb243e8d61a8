//! The I/O service contract shared by the inline and offload strategies.
//!
//! Transports implement callbacks; the service implements the scheduling of
//! the work those callbacks define. Callbacks run on whichever thread drives
//! the link — the caller's own thread for the inline strategy, the worker
//! thread for the offload strategy — and must never block.

use std::sync::Arc;
use std::time::Duration;

use chdrlink_link::{FrameBuff, LinkId, RecvLink, SendLink};

use crate::error::Result;

/// Verdict of a receive filter on an incoming frame.
///
/// Frame ownership moves through the callback: a frame comes in by value and
/// either stays with the client (`Matched`), was fully handled inside the
/// callback (`Consumed` — the callback released it), or is handed back for
/// the next registered filter (`NotMine`).
pub enum CallbackResult {
    /// Destined for this client; queue it for a later `get_recv_buff`.
    Matched(FrameBuff),
    /// Destined for this client and already handled; nothing to queue.
    Consumed,
    /// Not for this client; offer it to the next filter on the link.
    NotMine(FrameBuff),
}

/// Receive filter: decides whether an incoming frame belongs to a client.
pub type RecvCallback = Box<dyn FnMut(FrameBuff, &dyn RecvLink) -> CallbackResult + Send>;

/// Flow-control hook run when a client releases a consumed receive frame.
/// The hook owns the frame and must return it to the link (directly or after
/// sending a flow-control response).
pub type RecvFcCallback = Box<dyn FnMut(FrameBuff, &dyn RecvLink) + Send>;

/// Send hook run when a client releases a filled send frame. The hook stamps
/// any final header state (sequence count, flow-control fields) and releases
/// the frame to the link. Returning the frame instead means "destination not
/// ready"; the service retries until the hook accepts it.
pub type SendCallback = Box<dyn FnMut(FrameBuff, &dyn SendLink) -> Option<FrameBuff> + Send>;

/// Receive side attached to a send client so it can observe flow-control
/// responses arriving on the paired receive link.
pub struct SendFc {
    pub recv_link: Arc<dyn RecvLink>,
    pub num_recv_frames: usize,
    pub recv_cb: RecvCallback,
}

/// Client handle for receiving frames through an I/O service.
///
/// Handles are not reentrant: one handle serves one session at a time.
/// Dropping the handle disconnects it and returns its reservation.
pub trait RecvIo: Send + std::fmt::Debug {
    /// Next frame destined for this client. `None` timeout blocks;
    /// `Some(Duration::ZERO)` never blocks. Returns `None` when nothing
    /// arrived within the timeout.
    fn get_recv_buff(&mut self, timeout: Option<Duration>) -> Option<FrameBuff>;

    /// Hand a consumed frame back toward the link pool, running the client's
    /// flow-control hook if one is registered.
    fn release_recv_buff(&mut self, frame: FrameBuff);

    /// Frames reserved on the link for this client.
    fn num_recv_frames(&self) -> usize;
}

/// Client handle for sending frames through an I/O service.
pub trait SendIo: Send + std::fmt::Debug {
    /// An empty send frame, or `None` when the pool stayed dry past the
    /// timeout.
    fn get_send_buff(&mut self, timeout: Option<Duration>) -> Option<FrameBuff>;

    /// Commit a filled frame to the wire via the client's send hook.
    /// A zero-length frame is recycled without transmission.
    fn release_send_buff(&mut self, frame: FrameBuff);

    /// Frames reserved on the link for this client.
    fn num_send_frames(&self) -> usize;
}

/// Owns links and schedules the movement of frames between clients and the
/// wire. See the crate docs for the two strategies.
pub trait IoService: Send + Sync {
    fn attach_recv_link(&self, link: Arc<dyn RecvLink>) -> Result<()>;

    fn attach_send_link(&self, link: Arc<dyn SendLink>) -> Result<()>;

    /// Detach a receive link. Fails while clients still hold reservations.
    fn detach_recv_link(&self, link_id: LinkId) -> Result<()>;

    /// Detach a send link. Fails while clients still hold reservations.
    fn detach_send_link(&self, link_id: LinkId) -> Result<()>;

    /// Connect a receive client, reserving `num_recv_frames` from the link's
    /// pool. Fails with [`IoError::ResourceExhausted`] when the total
    /// reservation would exceed the pool.
    ///
    /// [`IoError::ResourceExhausted`]: crate::error::IoError::ResourceExhausted
    fn make_recv_client(
        &self,
        recv_link: Arc<dyn RecvLink>,
        num_recv_frames: usize,
        recv_cb: RecvCallback,
        fc_cb: Option<RecvFcCallback>,
    ) -> Result<Box<dyn RecvIo>>;

    /// Connect a send client, reserving `num_send_frames` from the link's
    /// pool. An optional [`SendFc`] attaches a receive filter for
    /// flow-control responses.
    fn make_send_client(
        &self,
        send_link: Arc<dyn SendLink>,
        num_send_frames: usize,
        send_cb: SendCallback,
        fc: Option<SendFc>,
    ) -> Result<Box<dyn SendIo>>;
}
