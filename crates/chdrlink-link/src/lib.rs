//! Frame buffers, frame pools, and the link-layer boundary of the CHDR
//! transport core.
//!
//! This is the lowest layer of chdrlink. A [`FramePool`] is a fixed arena of
//! packet-sized buffers; a [`FrameBuff`] is the exclusively-owned handle to
//! one of them. The [`SendLink`] and [`RecvLink`] traits are the boundary to
//! physical link drivers (UDP, DMA, PCIe) which live outside this workspace.
//! [`MemSendLink`]/[`MemRecvLink`] provide an in-process stand-in for those
//! drivers, used by tests and simulations.

pub mod error;
pub mod frame;
pub mod link;
pub mod mem;

pub use error::{LinkError, Result};
pub use frame::{Direction, FrameBuff, FramePool};
pub use link::{LinkId, RecvLink, SendLink};
pub use mem::{MemLinkParams, MemRecvLink, MemSendLink};
