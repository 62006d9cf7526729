use thiserror::Error;

/// Errors produced by the rchat protocol layer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("server full: {0}")]
    ServerFull(String),

    #[error("file transfer error: {0}")]
    FileTransfer(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<base64::DecodeError> for ChatError {
    fn from(e: base64::DecodeError) -> Self {
        ChatError::Codec(format!("base64: {e}"))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
