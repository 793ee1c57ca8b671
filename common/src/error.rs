use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFailure {
    #[error("wifi credentials missing")]
    MissingCredentials,
    #[error("link not up after {0}s")]
    Timeout(u32),
    #[error("link error: {0}")]
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor checksum mismatch")]
    Checksum,
    #[error("sensor did not answer in time")]
    Timeout,
    #[error("sensor read failed: {0}")]
    Read(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("nothing to publish")]
    Empty,
    #[error("update transport failed: {0}")]
    Transport(#[source] TransportError),
    #[error("update answered with HTTP {0}")]
    Status(u16),
    #[error("update rejected by service")]
    Rejected,
    #[error("unexpected update answer: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("fetch transport failed: {0}")]
    Transport(String),
    #[error("fetch timed out")]
    Timeout,
    #[error("fetch answered with HTTP {0}")]
    Status(u16),
    #[error("malformed field body: {0}")]
    Malformed(String),
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::Io(message) => Self::Transport(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}
