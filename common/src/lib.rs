use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;
use url::ParseError;

pub mod config;
pub mod logging;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] rquest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Extraction error for {source_name}: {message}")]
    Extraction {
        source_name: String,
        message: String,
    },

    #[error("Validation failed for {source_name}: {}", errors.join("; "))]
    ValidationFailed {
        source_name: String,
        errors: Vec<String>,
    },

    #[error(
        "Silent failure for {source_name}: 0 extracted rows after watermark {watermark} but {evidence}"
    )]
    SilentFailure {
        source_name: String,
        watermark: String,
        evidence: String,
    },

    #[error("Load failed for {table}: {message}")]
    Load { table: String, message: String },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Infrastructure errors the run driver may retry. Validation and
    /// silent-failure errors fail deterministically on the same input.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Io(_) | Error::Storage(_) | Error::Extraction { .. } => true,
            Error::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        Error::Storage(format!("Object store error: {}", err))
    }
}

impl From<object_store::path::Error> for Error {
    fn from(err: object_store::path::Error) -> Self {
        Error::InvalidInput(format!("Object path error: {}", err))
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::InvalidInput(format!("URL parse error: {}", err))
    }
}
