use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardliteError {
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ShardliteError>;
