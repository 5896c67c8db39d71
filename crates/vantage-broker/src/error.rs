use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Backend error: {0}")]
    Backend(String),
}

impl BrokerError {
    /// True when the broker could not be reached at all, as opposed to
    /// rejecting a well-formed command.
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Connection error: {0}")]
    Connection(String),
}
