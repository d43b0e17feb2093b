use thiserror::Error;

/// Error type returned by subscriber callbacks. Callbacks are application
/// code, so any boxed error is accepted and carried through to the error
/// handler unchanged.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad connection URL or options. Raised at configuration time, fatal.
    #[error("invalid broker configuration: {0}")]
    Configuration(String),

    /// The codec could not encode an outbound payload.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// The codec could not parse an inbound payload. The raw bytes are
    /// preserved so the error handler can inspect or dead-letter them.
    #[error("failed to decode payload: {reason}")]
    Decode { reason: String, raw: Vec<u8> },

    /// A subscriber callback failed. Routed to the error handler exactly
    /// like a decode failure; the variant is the only way to tell them apart.
    #[error("subscriber callback failed: {0}")]
    Callback(#[source] BoxError),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn callback(source: BoxError) -> Self {
        Error::Callback(source)
    }

    /// Raw bytes of the message that failed to decode, if this is a decode
    /// failure.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        match self {
            Error::Decode { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

impl From<lapin::Error> for Error {
    fn from(error: lapin::Error) -> Self {
        Error::Transport(error.to_string())
    }
}
