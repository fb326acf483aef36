//! Error types for the ARINC 429 link layer

use thiserror::Error;

/// Result type for ARINC 429 link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors raised by the link layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Word is not exactly 32 bits / 4 bytes
    #[error("Length error: {0}")]
    Length(String),

    /// Pin or peripheral is unavailable or already claimed
    #[error("Resource error: {0}")]
    Resource(String),

    /// Bounded transmit queue has no room left
    #[error("Transmit queue full ({capacity} words pending)")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// Receiver went idle with a partially assembled word
    #[error("Receive timeout after {bits} of 32 bits")]
    ReceiveTimeout {
        /// Number of bits collected before the line went idle
        bits: u8,
    },

    /// A pin operation reported a HAL error
    #[error("Pin error: {0}")]
    Pin(String),

    /// Invalid link configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver was stopped and accepts no further words
    #[error("Driver stopped")]
    Stopped,

    /// Background worker could not be started or terminated abnormally
    #[error("Worker error: {0}")]
    Worker(String),
}

impl LinkError {
    /// Create a new Length error
    pub fn length(msg: impl Into<String>) -> Self {
        LinkError::Length(msg.into())
    }

    /// Create a new Resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        LinkError::Resource(msg.into())
    }

    /// Create a new Pin error
    pub fn pin(msg: impl Into<String>) -> Self {
        LinkError::Pin(msg.into())
    }

    /// Create a new Config error
    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    /// Create a new Worker error
    pub fn worker(msg: impl Into<String>) -> Self {
        LinkError::Worker(msg.into())
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Length(_) | LinkError::QueueFull { .. })
    }
}

/// Map any HAL pin error into a [`LinkError::Pin`]
pub(crate) fn pin_err<E: std::fmt::Debug>(err: E) -> LinkError {
    LinkError::pin(format!("{:?}", err))
}
