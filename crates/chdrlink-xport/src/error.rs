use chdrlink_io::IoError;
use chdrlink_packet::ChdrError;

/// Errors raised by transport sessions.
#[derive(Debug, thiserror::Error)]
pub enum XportError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Chdr(#[from] ChdrError),
}

pub type Result<T> = std::result::Result<T, XportError>;
