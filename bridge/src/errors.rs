use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Storage failure: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("Unroutable topic {topic}: {reason}")]
    Routing { topic: String, reason: String },

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gave up reconnecting to broker after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Channel send error")]
    ChannelSend,

    #[error("Connection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Reasons an inbound payload is rejected before anything is stored.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Validation error: missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Malformed payload: field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Validation error: field `{field}` {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl PayloadError {
    /// Short label used for metrics and log context.
    pub fn kind(&self) -> &'static str {
        match self {
            PayloadError::Malformed(_) | PayloadError::WrongType { .. } => "malformed",
            PayloadError::MissingField(_) | PayloadError::Invalid { .. } => "validation",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
