use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can report.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("transformation error: {0}")]
    Transform(String),

    #[error("vector error: {0}")]
    Vector(String),

    #[error("tile service error: {0}")]
    TileService(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("processing was cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
