use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Config(String),
    #[error("invalid update: {0}")]
    Validation(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned {status}: {message}")]
    Api {
        endpoint: &'static str,
        status: u16,
        message: String,
    },
    #[error("catalog did not confirm deletion of record {0}")]
    DeleteUnconfirmed(i64),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
}

impl AppError {
    /// Configuration failures abort a whole run; everything else is scoped to one item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_))
    }
}
