use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("not found")]
    NotFound,
    #[error("validation {0}")]
    Validation(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("protocol {0}")]
    Protocol(String),
    #[error("connectivity {0}")]
    Connectivity(String),
    #[error("codec")]
    Codec,
    #[error("service stopped")]
    Stopped,
}

impl CoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, CoreError::Transport(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, CoreError::Protocol(_) | CoreError::Codec)
    }
}
