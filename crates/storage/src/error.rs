use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no crank is currently active")]
    NotInCrank,

    #[error("a crank is already active")]
    CrankAlreadyActive,

    #[error("unknown savepoint '{0}'")]
    UnknownSavepoint(String),

    #[error("backend error: {0}")]
    Backend(String),
}
