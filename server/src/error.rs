use thiserror::Error;

/// The taxonomy from the collection core's error-handling design: each variant maps to one
/// recovery policy at the call site rather than being handled ad hoc.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("domain error: {0}")]
    Domain(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("pipeline-fatal error: {0}")]
    PipelineFatal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx_core::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx_core::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
