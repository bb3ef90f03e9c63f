//! Errors raised by the message model.

use thiserror::Error;

/// Protocol errors that can occur while building or reading messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A mutator was called on a read-only view.
    #[error("Message is read-only")]
    ReadOnly,

    /// The request already carries a sequence number.
    #[error("Request already sequenced as {0}")]
    AlreadySequenced(u32),

    /// Sequence zero is reserved for "no sequence".
    #[error("Sequence 0 is reserved")]
    ReservedSequence,

    /// The path could not be resolved into a gateway URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// The payload is not valid in the requested character set.
    #[error("Payload is not valid {0}")]
    Charset(&'static str),

    /// The payload content type has no typed decoder.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// JSON decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}
