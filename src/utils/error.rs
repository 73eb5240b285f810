use thiserror::Error;

#[derive(Debug, Error)]
pub enum AratagaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unresolved target: {0}")]
    UnresolvedTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out: {0}")]
    PhaseTimedOut(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, AratagaError>;
