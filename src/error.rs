//! MAC errors

use thiserror::Error;

use crate::status::Status;

/// Errors reported synchronously by the station API
#[derive(Debug, Error)]
pub enum MacError {
    /// Invalid argument, such as an oversized payload
    #[error("illegal argument")]
    IllegalArgument,

    /// Destination address cannot be used
    #[error("bad address")]
    BadAddress,

    /// Station address cannot be used
    #[error("bad MAC address")]
    BadMacAddress,

    /// Invalid buffer configuration
    #[error("bad buffer size")]
    BadBufferSize,

    /// Outbound queue is full
    #[error("insufficient buffer space")]
    InsufficientBufferSpace,

    /// Failed to start the engines over the channel
    #[error("RF init failed: {0}")]
    RfInitFailed(#[from] std::io::Error),
}

impl MacError {
    /// Status code recorded for this error
    pub fn status(&self) -> Status {
        match self {
            MacError::IllegalArgument => Status::IllegalArgument,
            MacError::BadAddress => Status::BadAddress,
            MacError::BadMacAddress => Status::BadMacAddress,
            MacError::BadBufferSize => Status::BadBufSize,
            MacError::InsufficientBufferSpace => Status::InsufficientBufferSpace,
            MacError::RfInitFailed(_) => Status::RfInitFailed,
        }
    }
}
