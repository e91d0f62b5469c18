use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Empty consumer group")]
    EmptyGroup,

    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown consume-from mode: {0}")]
    UnknownConsumeFrom(String),

    #[error("Offset store error: {0}")]
    OffsetStore(String),

    #[error("Broker not found: {0}")]
    BrokerNotFound(String),

    #[error("Remote call failed: {0}")]
    Remote(#[source] anyhow::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Consume callback timed out")]
    ConsumeTimeout,

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Group already registered: {0}")]
    GroupAlreadyRegistered(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Config error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConsumerError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl ConsumerError {
    /// Wrap an arbitrary network failure.
    pub fn remote(err: impl Into<anyhow::Error>) -> Self {
        Self::Remote(err.into())
    }
}
