use chdrlink_link::LinkError;

/// Errors raised by the I/O services.
///
/// Timeouts are not errors; buffer-acquisition paths report them by
/// returning `None`.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// A client connect would push a link's total reserved frames past its
    /// physical pool size. Detected at connect time, never during
    /// steady-state I/O.
    #[error("reserved frames exceed link pool ({requested} requested, pool holds {available})")]
    ResourceExhausted { requested: usize, available: usize },

    /// A link was attached twice, or a client was requested on a link that
    /// was never attached.
    #[error("link already attached to this I/O service")]
    AlreadyAttached,

    #[error("link not attached to this I/O service")]
    NotAttached,

    /// Conflicting configuration, raised before any side effect occurs.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The I/O service has shut down and can no longer serve requests.
    #[error("I/O service shut down")]
    Shutdown,

    /// The offload worker thread could not be spawned.
    #[error("failed to spawn offload worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error(transparent)]
    Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, IoError>;
