// Error type shared by framing and payload codecs.

use thiserror::Error;

use crate::framing::MAX_PAYLOAD_SIZE;

/// Errors raised while reading, writing or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: usize },

    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown message id {0}")]
    UnknownMessageId(u32),

    #[error("message id {0} is not a {1}")]
    WrongDirection(u32, &'static str),
}
