use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the pipeline stages and the reporting layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("API server error on {addr}: {source}")]
    Server {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("telegram error: {0}")]
    Telegram(String),

    #[error("telegram session is not authorized; run the `login` command first")]
    Unauthorized,

    #[error("model error: {0}")]
    Model(String),

    #[error("transform failed (exit code {code:?}): {stderr}")]
    Transform { code: Option<i32>, stderr: String },

    #[error("cannot derive a message id from {}", .0.display())]
    InvalidFileName(PathBuf),

    #[error("Channel '{0}' not found.")]
    ChannelNotFound(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
