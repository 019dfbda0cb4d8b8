use std::time::Duration;

use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum LimpetError {
    // ---
    #[error("backend url already registered: {0}")]
    AlreadyRegistered(String),

    #[error("a pipe already exists for client {0}")]
    DuplicateClient(uuid::Uuid),

    #[error("staging buffer limit of {limit} bytes exceeded")]
    BufferOverflow { limit: usize },

    #[error("pipe is already streaming")]
    AlreadyStreaming,

    #[error("pipe is missing a stream")]
    MissingStream,

    #[error("no backend became available within {0:?}")]
    NoBackendAvailable(Duration),

    #[error("client connection failed: {0}")]
    Client(String),

    #[error("backend dial failed: {0}")]
    Dial(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, LimpetError>;
