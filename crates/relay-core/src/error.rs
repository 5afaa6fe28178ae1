use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short error code string used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
