//! Errors raised while building a listener's filter config

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// No codec registered under this name
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    /// No built-in filter registered under this name
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    /// A direct response names a status code the codec layer does not know
    #[error("Invalid status code: {0}")]
    InvalidStatus(String),

    /// Opening a filter's output, e.g. the access log file
    #[error("Filter output error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
