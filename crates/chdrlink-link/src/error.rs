/// Errors that can occur at the link and frame-pool boundary.
///
/// Running out of frames is not an error: acquire paths report it by
/// returning `None` after the caller's timeout.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A frame was released to a pool it does not belong to.
    /// The frame still returns to its rightful pool.
    #[error("frame belongs to pool {frame_pool}, released to pool {pool}")]
    ForeignFrame { frame_pool: u64, pool: u64 },

    /// The link has been shut down and no longer moves frames.
    #[error("link shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, LinkError>;
