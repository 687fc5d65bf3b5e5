//! Error type shared by providers, caches, output devices and the controller

use thiserror::Error;

/// Errors that can occur anywhere in the playback pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// A device, context, cache or source could not be acquired
    #[error("Failed to open audio: {0}")]
    Open(String),

    /// A long operation was cancelled cooperatively
    #[error("Cancelled: {0}")]
    UserCancelled(String),

    /// The underlying source failed mid-read
    #[error("Decode error: {0}")]
    Decode(String),
}

impl AudioError {
    pub fn open(msg: impl Into<String>) -> Self {
        Self::Open(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Cancellation is an ordinary abort, not a failure worth logging as one
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::UserCancelled(_))
    }
}
