use thiserror::Error;

pub type BlobsealResult<T> = Result<T, BlobsealError>;

#[derive(Debug, Error)]
pub enum BlobsealError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
