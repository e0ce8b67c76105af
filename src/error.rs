use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Serial error: {0}")]
    SerialError(#[from] tokio_serial::Error),
}

impl From<&str> for ControlError {
    fn from(error: &str) -> Self {
        ControlError::HardwareError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
