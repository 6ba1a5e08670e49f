use thiserror::Error;

/// key: billing-errors -> library-wide error surface
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;
