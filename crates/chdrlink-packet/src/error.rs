/// Errors that can occur while encoding or decoding CHDR packets.
#[derive(Debug, thiserror::Error)]
pub enum ChdrError {
    /// The packet's declared lengths and the buffer bounds disagree, or a
    /// field holds a value the format does not define. Detected
    /// synchronously at decode; never tolerated.
    #[error("malformed packet: {reason}")]
    MalformedPacket { reason: &'static str },

    /// The packet does not fit the destination frame.
    #[error("packet too large ({size} bytes, frame holds {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The requested packet cannot be expressed in the selected protocol
    /// generation (e.g. metadata words in the legacy 32-bit framing).
    #[error("not representable in this header generation: {what}")]
    Unrepresentable { what: &'static str },
}

pub type Result<T> = std::result::Result<T, ChdrError>;
