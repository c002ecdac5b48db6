use thiserror::Error;

/// Failures talking to the hosted message/presence collections.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("document {0} not found")]
    NotFound(String),
}

/// Failures of the on-device key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("firestore backend selected but {0} is not set")]
    MissingFirestoreSetting(&'static str),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
